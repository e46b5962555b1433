//! Bounded retry driver for remote calls
//!
//! Every remote call runs under the configured timeout. `Retryable`
//! outcomes are re-dispatched with exponential backoff up to the attempt
//! limit; `NonRetryable` and `Unknown` surface immediately.
//!
//! An elapsed timeout is mapped by policy: a fetch that timed out can
//! simply be retried, but a mutating dispatch that timed out may have
//! landed, so it becomes `Unknown`.

use crate::config::EngineConfig;
use crate::remote::RemoteOutcome;
use crate::types::VaultError;
use std::future::Future;
use std::time::Duration;

/// How timeouts and ambiguity are interpreted for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Mutating call whose dispatch is provider-side idempotent by request
    /// id; timeouts are indeterminate
    IdempotentDispatch,
    /// Read-only call; timeouts and ambiguity are plain transient failures
    Fetch,
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Drive a remote call to a definite outcome
///
/// # Errors
///
/// - [`VaultError::RemoteRetryable`] when every attempt failed transiently
/// - [`VaultError::RemoteNonRetryable`] on a permanent provider rejection
/// - [`VaultError::RemoteUnknown`] when a mutating dispatch ended
///   indeterminate (never returned for `Fetch` policy)
pub async fn with_retry<T, F, Fut>(
    config: &EngineConfig,
    operation: &str,
    idempotency_key: Option<&str>,
    policy: RetryPolicy,
    mut call: F,
) -> Result<T, VaultError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteOutcome<T>>,
{
    let mut last_reason = String::new();
    for attempt in 0..config.retry_max_attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(config.retry_base_delay, attempt - 1)).await;
        }

        let outcome = match tokio::time::timeout(config.remote_timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => match policy {
                RetryPolicy::Fetch => RemoteOutcome::Retryable {
                    reason: "timed out".to_string(),
                },
                RetryPolicy::IdempotentDispatch => RemoteOutcome::Unknown {
                    reason: "timed out".to_string(),
                },
            },
        };

        match outcome {
            RemoteOutcome::Success(value) => return Ok(value),
            RemoteOutcome::Retryable { reason } => {
                tracing::debug!(operation, attempt, %reason, "transient remote failure");
                last_reason = reason;
            }
            RemoteOutcome::NonRetryable { reason } => {
                return Err(VaultError::remote_non_retryable(&reason, idempotency_key));
            }
            RemoteOutcome::Unknown { reason } => match policy {
                // A fetch has no side effect to lose; treat as transient.
                RetryPolicy::Fetch => {
                    tracing::debug!(operation, attempt, %reason, "ambiguous fetch outcome");
                    last_reason = reason;
                }
                RetryPolicy::IdempotentDispatch => {
                    return Err(VaultError::remote_unknown(operation, idempotency_key));
                }
            },
        }
    }

    Err(VaultError::remote_retryable(
        &last_reason,
        config.retry_max_attempts,
        idempotency_key,
    ))
}
