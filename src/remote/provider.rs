//! Remote vault provider boundary
//!
//! This module defines the typed adapter over the provider's token and
//! charge operations. The adapter is stateless: it translates requests and
//! normalizes every provider response into a [`RemoteOutcome`], collapsing
//! the provider's error codes into a four-way taxonomy the orchestrators
//! can reason about.
//!
//! `Unknown` outcomes (connection dropped after dispatch, timeout with the
//! request possibly landed) are first-class: they drive the PENDING_* local
//! states and must never be treated as plain failures.

use crate::types::{Currency, InstrumentDescriptor, InstrumentSummary};
use crate::config::CaptureMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Normalized result of a remote provider call
///
/// - `Success` — the provider confirmed the operation and returned a payload
/// - `Retryable` — timeout before dispatch, 5xx, or rate limit; a repeat
///   attempt is safe under the caller's retry policy
/// - `NonRetryable` — provider-side validation failure or declined
///   instrument; repeating the call cannot succeed
/// - `Unknown` — the request may have been processed but no answer arrived;
///   only an idempotent status lookup or reconciliation may resolve it
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome<T> {
    Success(T),
    Retryable { reason: String },
    NonRetryable { reason: String },
    Unknown { reason: String },
}

impl<T> RemoteOutcome<T> {
    /// Map the success payload, leaving failure variants untouched
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RemoteOutcome<U> {
        match self {
            RemoteOutcome::Success(value) => RemoteOutcome::Success(f(value)),
            RemoteOutcome::Retryable { reason } => RemoteOutcome::Retryable { reason },
            RemoteOutcome::NonRetryable { reason } => RemoteOutcome::NonRetryable { reason },
            RemoteOutcome::Unknown { reason } => RemoteOutcome::Unknown { reason },
        }
    }
}

/// Provider-side view of a setup token
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSetupToken {
    pub id: String,
    pub customer_id: String,
    pub status: RemoteSetupStatus,
    pub instrument_summary: InstrumentSummary,
    pub expires_at: DateTime<Utc>,
}

/// Provider vocabulary for setup token states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSetupStatus {
    Created,
    Approved,
    Consumed,
    Expired,
    Failed,
}

/// Provider-side view of a payment token
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePaymentToken {
    pub id: String,
    pub customer_id: String,
    pub status: RemoteTokenStatus,
    pub instrument_summary: InstrumentSummary,
}

/// Provider vocabulary for payment token states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteTokenStatus {
    Active,
    Revoked,
}

/// Result of a remote deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDeletion {
    Deleted,
    /// The provider has no such token; deletion is idempotently complete
    NotFound,
}

/// Provider-side view of an executed charge
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCharge {
    /// Provider transaction id
    pub transaction_id: String,
    pub status: RemoteChargeStatus,
}

/// Provider vocabulary for charge states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChargeStatus {
    Authorized,
    Captured,
    Reversed,
    Declined,
}

/// Source for creating a payment token
#[derive(Clone)]
pub enum TokenSource {
    /// Exchange an approved setup token
    SetupToken(String),
    /// Vault an instrument directly, skipping the setup step
    Instrument {
        customer_id: String,
        descriptor: InstrumentDescriptor,
    },
}

/// Typed adapter to the remote vault and payment provider
///
/// One method per provider operation. Every mutating method accepts a
/// caller-supplied `request_id` which the provider treats as its own
/// idempotency key: re-dispatching with the same id returns the original
/// result instead of duplicating the side effect.
#[async_trait]
pub trait VaultProvider: Send + Sync {
    /// Create a provider-side setup token for an instrument
    async fn create_setup_token(
        &self,
        request_id: &str,
        customer_id: &str,
        descriptor: &InstrumentDescriptor,
    ) -> RemoteOutcome<RemoteSetupToken>;

    /// Fetch the provider's current view of a setup token
    async fn fetch_setup_token(&self, id: &str) -> RemoteOutcome<Option<RemoteSetupToken>>;

    /// Create a durable payment token from a setup token or raw instrument
    async fn create_payment_token(
        &self,
        request_id: &str,
        source: TokenSource,
    ) -> RemoteOutcome<RemotePaymentToken>;

    /// Fetch the provider's current view of a payment token
    async fn fetch_payment_token(&self, id: &str) -> RemoteOutcome<Option<RemotePaymentToken>>;

    /// List all payment tokens the provider holds for a customer
    async fn list_payment_tokens(
        &self,
        customer_id: &str,
    ) -> RemoteOutcome<Vec<RemotePaymentToken>>;

    /// Delete a payment token
    async fn delete_payment_token(&self, id: &str) -> RemoteOutcome<RemoteDeletion>;

    /// Execute a charge against a stored payment token
    async fn charge(
        &self,
        request_id: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
        capture: CaptureMode,
    ) -> RemoteOutcome<RemoteCharge>;

    /// Look up the charge previously dispatched under `request_id`
    ///
    /// Returns `Success(None)` when the provider confirms no such charge
    /// ever landed — the signal that a fresh dispatch is safe.
    async fn fetch_charge_status(&self, request_id: &str) -> RemoteOutcome<Option<RemoteCharge>>;
}
