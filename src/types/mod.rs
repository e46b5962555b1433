//! Core data types for the vault engine
//!
//! This module contains entity types, provider events, and error types
//! used throughout the engine.

pub mod entities;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use entities::{
    CardBrand, Currency, Customer, CustomerId, IdempotencyKey, IdempotencyRecord,
    IdempotencyStatus, InstrumentDescriptor, InstrumentSummary, OperationKind, Order, OrderId,
    OrderStatus, PaymentToken, PaymentTokenId, PaymentTokenStatus, ResultSnapshot, SetupToken,
    SetupTokenId, SetupTokenStatus,
};
pub use error::VaultError;
pub use event::{ProviderEntityType, ProviderEvent};
