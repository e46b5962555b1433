//! Entity types for the vault synchronization engine
//!
//! This module defines the four durable entities (Customer, SetupToken,
//! PaymentToken, Order) plus the idempotency ledger record, along with
//! their status vocabularies and the instrument descriptor/summary split.
//!
//! Every mutable entity carries a `local_version` column for optimistic
//! concurrency and an `updated_at` timestamp. Raw instrument data is never
//! persisted; only the `InstrumentSummary` (brand, last four, expiry) is.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Merchant-assigned customer identifier (opaque string)
pub type CustomerId = String;

/// Provider-issued setup token identifier
pub type SetupTokenId = String;

/// Provider-issued payment token identifier
pub type PaymentTokenId = String;

/// Locally-generated order identifier
pub type OrderId = String;

/// Caller-supplied idempotency key
pub type IdempotencyKey = String;

/// Card brands accepted by the engine
///
/// Acts as the instrument brand whitelist: a descriptor carrying any other
/// brand never reaches the remote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardBrand {
    Visa,
    Mastercard,
    Amex,
    Discover,
}

impl fmt::Display for CardBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CardBrand::Visa => "visa",
            CardBrand::Mastercard => "mastercard",
            CardBrand::Amex => "amex",
            CardBrand::Discover => "discover",
        };
        write!(f, "{}", s)
    }
}

/// Recognized ISO-4217 currency codes
///
/// Charges in any other currency are rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Cad,
    Aud,
    Jpy,
    Mxn,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Cad => "CAD",
            Currency::Aud => "AUD",
            Currency::Jpy => "JPY",
            Currency::Mxn => "MXN",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Currency {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "CAD" => Ok(Currency::Cad),
            "AUD" => Ok(Currency::Aud),
            "JPY" => Ok(Currency::Jpy),
            "MXN" => Ok(Currency::Mxn),
            _ => Err(()),
        }
    }
}

/// Raw payment instrument data, as received from the merchant request
///
/// This type does not derive `Debug` or `Display`: the card number and CVV
/// must never reach logs or error messages. It is consumed at the remote
/// boundary and only its [`InstrumentSummary`] is ever persisted.
#[derive(Clone)]
pub struct InstrumentDescriptor {
    /// Card brand (whitelisted via [`CardBrand`])
    pub brand: CardBrand,
    /// Full card number (digits only)
    pub number: String,
    /// Expiration month (1-12)
    pub expiry_month: u8,
    /// Expiration year (4 digits)
    pub expiry_year: u16,
    /// CVC/CVV code
    pub cvv: String,
}

impl InstrumentDescriptor {
    /// Derive the persistable summary (brand, last four, expiry)
    pub fn summary(&self) -> InstrumentSummary {
        let last4 = if self.number.len() >= 4 {
            self.number[self.number.len() - 4..].to_string()
        } else {
            self.number.clone()
        };
        InstrumentSummary {
            brand: self.brand,
            last4,
            expiry_month: self.expiry_month,
            expiry_year: self.expiry_year,
        }
    }
}

// Redacted Debug so the descriptor can appear in structured logs without
// exposing the PAN or CVV.
impl fmt::Debug for InstrumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentDescriptor")
            .field("brand", &self.brand)
            .field("number", &"[redacted]")
            .field("expiry_month", &self.expiry_month)
            .field("expiry_year", &self.expiry_year)
            .field("cvv", &"[redacted]")
            .finish()
    }
}

/// Persistable view of a payment instrument
///
/// The only instrument data ever written to the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSummary {
    pub brand: CardBrand,
    /// Last four digits of the card number
    pub last4: String,
    pub expiry_month: u8,
    pub expiry_year: u16,
}

/// Merchant-local customer identity
///
/// Created on first reference from any vault operation; never auto-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub customer_id: CustomerId,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle states of a setup token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupTokenStatus {
    /// Issued by the provider, awaiting payer approval
    Created,
    /// Approved by the payer (provider-reported)
    Approved,
    /// Exchanged for a payment token; terminal
    Consumed,
    /// Lapsed past its expiry; terminal
    Expired,
    /// Rejected by the provider; terminal
    Failed,
}

/// Ephemeral validation artifact: a payment instrument pending approval
///
/// Transitions `Consumed` at most once (enforced by the store's version
/// check) and yields exactly one payment token when it does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupToken {
    /// Provider-issued identifier
    pub id: SetupTokenId,
    pub customer_id: CustomerId,
    pub instrument_summary: InstrumentSummary,
    pub status: SetupTokenStatus,
    /// Monotonic version for optimistic concurrency
    pub local_version: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker, set by the garbage-collecting sweep
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lifecycle states of a payment token
///
/// `Active -> PendingDelete -> (soft-deleted)`; `Active -> Revoked` is
/// provider-initiated only, and no transition leaves `Revoked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentTokenStatus {
    Active,
    /// Remote deletion dispatched but unconfirmed; resolved by reconciliation
    PendingDelete,
    /// Invalidated by the provider; terminal
    Revoked,
}

/// Durable reference to a stored payment instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentToken {
    /// Provider-issued identifier, globally unique, one local row per id
    pub id: PaymentTokenId,
    pub customer_id: CustomerId,
    pub instrument_summary: InstrumentSummary,
    pub status: PaymentTokenStatus,
    /// Monotonic version for optimistic concurrency
    pub local_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Lifecycle states of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Charge dispatched with an indeterminate outcome; awaiting
    /// reconciliation via status fetch
    Initiated,
    Authorized,
    Captured,
    Failed,
    Reversed,
}

impl OrderStatus {
    /// Whether the order counts against the one-non-failed-per-key invariant
    pub fn is_live(&self) -> bool {
        !matches!(self, OrderStatus::Failed)
    }
}

/// Result of executing a charge against a payment token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub payment_token_id: PaymentTokenId,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: OrderStatus,
    pub idempotency_key: IdempotencyKey,
    /// Provider transaction id; `None` until the outcome is confirmed
    pub provider_transaction_id: Option<String>,
    /// Monotonic version for optimistic concurrency
    pub local_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of an idempotency ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Done,
    Failed,
}

/// Operation classes recorded in the idempotency ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateSetupToken,
    CreatePaymentToken,
    DeletePaymentToken,
    Charge,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::CreateSetupToken => "create_setup_token",
            OperationKind::CreatePaymentToken => "create_payment_token",
            OperationKind::DeletePaymentToken => "delete_payment_token",
            OperationKind::Charge => "charge",
        };
        write!(f, "{}", s)
    }
}

/// Cached result of a completed externally-effectful operation
///
/// Replayed verbatim to callers retrying with the same idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultSnapshot {
    SetupToken(SetupToken),
    PaymentToken(PaymentToken),
    Order(Order),
    /// Deletion acknowledged for the given token id
    Deleted(PaymentTokenId),
}

/// Outcome record for one externally-effectful operation, keyed by the
/// caller-supplied idempotency key
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub operation_kind: OperationKind,
    /// Hex SHA-256 digest of the canonical request body
    pub request_fingerprint: String,
    pub result_snapshot: Option<ResultSnapshot>,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
