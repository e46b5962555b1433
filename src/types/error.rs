//! Error types for the vault synchronization engine
//!
//! This module defines the error taxonomy shared by the orchestrators, the
//! local store, and the reconciliation processor.
//!
//! # Error Categories
//!
//! - **Caller errors**: malformed input, illegal state transitions, key
//!   reuse — rejected synchronously with no side effects.
//! - **Remote errors**: normalized provider failures, split by whether the
//!   call may be retried, must not be retried, or landed indeterminately.
//! - **Consistency errors**: a remote side effect succeeded but the local
//!   write did not, or an entity has been pending longer than allowed.
//!
//! Every remote-facing variant carries the idempotency key when one was in
//! play, so the caller can safely poll or resubmit with the identical key.

use thiserror::Error;

/// Main error type for the vault engine
///
/// `RemoteUnknown` and `PartialFailure` are never resolved by retrying the
/// original mutating call; they surface as "accepted, pending confirmation"
/// and are settled out-of-band by the reconciliation processor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VaultError {
    /// Malformed input, the caller's fault; never retried by the engine
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the constraint that failed
        message: String,
    },

    /// Operation not legal for the entity's current state
    ///
    /// For example, consuming a setup token that is not APPROVED.
    #[error("{entity} {id} is {state}: cannot {operation}")]
    InvalidState {
        /// Entity kind ("setup token", "payment token", "order")
        entity: String,
        /// Entity identifier
        id: String,
        /// Current state that blocks the operation
        state: String,
        /// The operation that was attempted
        operation: String,
    },

    /// A previously-used idempotency key was reused with a different request
    #[error("Idempotency key '{key}' was already used with a different request body")]
    IdempotencyKeyReuse {
        /// The conflicting key
        key: String,
    },

    /// Another caller holds the in-progress ledger slot for this key
    ///
    /// The first caller proceeds; concurrent callers with the same key must
    /// wait and re-submit once the record completes.
    #[error("Operation with idempotency key '{key}' is already in progress")]
    OperationInProgress {
        /// The contended key
        key: String,
    },

    /// Transient remote failure (timeout, 5xx, rate limit), retries exhausted
    #[error("Remote call failed after {attempts} attempts: {reason}")]
    RemoteRetryable {
        /// Provider-reported reason
        reason: String,
        /// Number of attempts made before surfacing
        attempts: u32,
        /// Idempotency key of the operation, if any
        idempotency_key: Option<String>,
    },

    /// Permanent remote failure (declined instrument, provider validation)
    #[error("Remote call rejected: {reason}")]
    RemoteNonRetryable {
        /// Provider-reported reason
        reason: String,
        /// Idempotency key of the operation, if any
        idempotency_key: Option<String>,
    },

    /// The remote outcome is indeterminate (connection dropped after dispatch)
    ///
    /// Resolved only via idempotent status lookup or reconciliation; never
    /// retried as a fresh side-effecting call.
    #[error("Outcome of remote {operation} is unknown; resolution pending")]
    RemoteUnknown {
        /// The provider operation whose outcome is ambiguous
        operation: String,
        /// Idempotency key of the operation, if any
        idempotency_key: Option<String>,
    },

    /// The remote call succeeded but the local write failed
    ///
    /// The remote entity is queued for adoption by the reconciliation
    /// processor; eventual local consistency is pending.
    #[error("Remote succeeded but local persistence failed for {remote_id}; reconciliation pending")]
    PartialFailure {
        /// Provider-issued id of the orphaned remote entity
        remote_id: String,
        /// Idempotency key of the operation, if any
        idempotency_key: Option<String>,
    },

    /// An entity has stayed in a PENDING_* state past the allowed age
    ///
    /// Surfaced to the observability layer as an operational fault; not
    /// auto-resolved.
    #[error("{entity} {id} has been pending for {pending_secs}s, past the allowed maximum")]
    PendingEscalation {
        /// Entity kind
        entity: String,
        /// Entity identifier
        id: String,
        /// How long the entity has been pending, in seconds
        pending_secs: i64,
    },

    /// Entity not found in the local store
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: String,
        /// Entity identifier
        id: String,
    },

    /// Optimistic concurrency conflict: the row's version moved underneath
    /// the writer, which must re-read and retry
    #[error("Version conflict on {entity} {id}: expected version {expected}")]
    VersionConflict {
        /// Entity kind
        entity: String,
        /// Entity identifier
        id: String,
        /// The stale version the writer presented
        expected: u64,
    },

    /// A row with this provider id already exists (store-level uniqueness)
    #[error("Duplicate {entity} {id}")]
    Duplicate {
        /// Entity kind
        entity: String,
        /// Entity identifier
        id: String,
    },

    /// Local store write failure
    #[error("Store write failed for {entity} {id}: {message}")]
    Store {
        /// Entity kind
        entity: String,
        /// Entity identifier
        id: String,
        /// Description of the failure
        message: String,
    },
}

// Helper functions for creating common errors

impl VaultError {
    /// Create a Validation error
    pub fn validation(message: impl Into<String>) -> Self {
        VaultError::Validation {
            message: message.into(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state(entity: &str, id: &str, state: &str, operation: &str) -> Self {
        VaultError::InvalidState {
            entity: entity.to_string(),
            id: id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Create an IdempotencyKeyReuse error
    pub fn key_reuse(key: &str) -> Self {
        VaultError::IdempotencyKeyReuse {
            key: key.to_string(),
        }
    }

    /// Create an OperationInProgress error
    pub fn in_progress(key: &str) -> Self {
        VaultError::OperationInProgress {
            key: key.to_string(),
        }
    }

    /// Create a RemoteRetryable error
    pub fn remote_retryable(reason: &str, attempts: u32, key: Option<&str>) -> Self {
        VaultError::RemoteRetryable {
            reason: reason.to_string(),
            attempts,
            idempotency_key: key.map(str::to_string),
        }
    }

    /// Create a RemoteNonRetryable error
    pub fn remote_non_retryable(reason: &str, key: Option<&str>) -> Self {
        VaultError::RemoteNonRetryable {
            reason: reason.to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    /// Create a RemoteUnknown error
    pub fn remote_unknown(operation: &str, key: Option<&str>) -> Self {
        VaultError::RemoteUnknown {
            operation: operation.to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    /// Create a PartialFailure error
    pub fn partial_failure(remote_id: &str, key: Option<&str>) -> Self {
        VaultError::PartialFailure {
            remote_id: remote_id.to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    /// Create a NotFound error
    pub fn not_found(entity: &str, id: &str) -> Self {
        VaultError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Create a VersionConflict error
    pub fn version_conflict(entity: &str, id: &str, expected: u64) -> Self {
        VaultError::VersionConflict {
            entity: entity.to_string(),
            id: id.to_string(),
            expected,
        }
    }

    /// Create a Duplicate error
    pub fn duplicate(entity: &str, id: &str) -> Self {
        VaultError::Duplicate {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Create a Store error
    pub fn store(entity: &str, id: &str, message: &str) -> Self {
        VaultError::Store {
            entity: entity.to_string(),
            id: id.to_string(),
            message: message.to_string(),
        }
    }

    /// The idempotency key attached to this error, if any
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            VaultError::IdempotencyKeyReuse { key } | VaultError::OperationInProgress { key } => {
                Some(key)
            }
            VaultError::RemoteRetryable {
                idempotency_key, ..
            }
            | VaultError::RemoteNonRetryable {
                idempotency_key, ..
            }
            | VaultError::RemoteUnknown {
                idempotency_key, ..
            }
            | VaultError::PartialFailure {
                idempotency_key, ..
            } => idempotency_key.as_deref(),
            _ => None,
        }
    }

    /// Whether this error left no side effect anywhere (safe to retry freely)
    pub fn is_side_effect_free(&self) -> bool {
        matches!(
            self,
            VaultError::Validation { .. }
                | VaultError::InvalidState { .. }
                | VaultError::IdempotencyKeyReuse { .. }
                | VaultError::NotFound { .. }
        )
    }
}
