//! Vault Engine Library
//! # Overview
//!
//! This library keeps a merchant's local token store and a remote payment
//! vault provider consistent: instrument tokenization, token deletion, and
//! charge execution, all under caller-supplied idempotency keys, with a
//! reconciliation processor that converges the two sides after failures.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (SetupToken, PaymentToken, Order, etc.)
//! - [`config`] - Provider credentials and engine tuning
//! - [`remote`] - The provider adapter trait, its normalized outcome
//!   taxonomy, and an in-memory mock
//! - [`store`] - Concurrent local store with optimistic versioning
//! - [`core`] - Business logic components:
//!   - [`core::ledger`] - Idempotency ledger with result replay
//!   - [`core::lifecycle`] - Setup-token and payment-token orchestration
//!   - [`core::payment`] - Charge execution against stored tokens
//!   - [`core::reconcile`] - Event-driven and sweep-based reconciliation
//!
//! # Consistency Model
//!
//! The remote provider is the source of truth for token and charge state.
//! Mutations run remote-first; a remote success whose local write fails is
//! queued for adoption, and an indeterminate remote outcome parks the local
//! row in a PENDING state. The reconciliation sweep settles both, so no
//! confirmed side effect is ever silently lost.
//!
//! # Idempotency
//!
//! Every externally-effectful operation takes an idempotency key. Retrying
//! with the same key and request replays the recorded result; the same key
//! with a different request is rejected. Ambiguous charge outcomes are
//! resolved by status lookup keyed on the same id, never by blind
//! re-dispatch.

// Module declarations
pub mod config;
pub mod core;
pub mod remote;
pub mod store;
pub mod types;

pub use config::{CaptureMode, EngineConfig, ProviderCredentials, ProviderMode};
pub use core::{
    AdoptionQueue, DeleteAck, IdempotencyLedger, PaymentExecutor, ReconcileAction, Reconciler,
    SweepReport, TokenLifecycle, TokenizationSource,
};
pub use remote::{MockVaultProvider, RemoteOutcome, VaultProvider};
pub use store::LocalStore;
pub use types::{
    Currency, InstrumentDescriptor, InstrumentSummary, Order, OrderStatus, PaymentToken,
    PaymentTokenStatus, ProviderEvent, SetupToken, SetupTokenStatus, VaultError,
};
