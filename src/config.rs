//! Engine configuration
//!
//! Provider credentials and engine tuning are explicit values threaded into
//! components at construction, never ambient globals, so multiple tenants
//! with separate credentials can coexist in one process.

use std::time::Duration;

/// Remote provider environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Sandbox,
    Live,
}

/// Credentials for the remote vault provider
///
/// Owned by whatever constructs the concrete provider client; the engine
/// itself only ever sees the [`crate::remote::VaultProvider`] trait.
#[derive(Clone)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub mode: ProviderMode,
}

impl ProviderCredentials {
    pub fn sandbox(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            mode: ProviderMode::Sandbox,
        }
    }
}

// Secrets stay out of Debug output.
impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("mode", &self.mode)
            .finish()
    }
}

/// Whether a successful charge authorizes only or captures immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Charge settles immediately; orders land as CAPTURED
    Automatic,
    /// Charge authorizes only; orders land as AUTHORIZED
    Manual,
}

/// Tuning knobs for the engine
///
/// All remote calls run under `remote_timeout`; an elapsed timeout on a
/// mutating call is an indeterminate outcome, not a failure.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub capture_mode: CaptureMode,
    /// Upper bound on any single remote call
    pub remote_timeout: Duration,
    /// Maximum dispatch attempts for retryable remote failures
    pub retry_max_attempts: u32,
    /// Base delay for exponential backoff between retries
    pub retry_base_delay: Duration,
    /// Minimum age before the sweep picks up a CREATED/PENDING_* row
    pub sweep_grace: Duration,
    /// Age past which a still-pending entity is escalated
    pub max_pending_age: Duration,
    /// Extra window after a setup token's expiry before it is soft-deleted
    pub setup_token_gc_grace: Duration,
    /// Lifetime of idempotency records before they are prunable
    pub ledger_ttl: Duration,
    /// Capacity of the provider-event dedup set
    pub event_dedup_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_mode: CaptureMode::Automatic,
            remote_timeout: Duration::from_secs(10),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            sweep_grace: Duration::from_secs(30),
            max_pending_age: Duration::from_secs(60 * 60),
            setup_token_gc_grace: Duration::from_secs(60 * 60),
            ledger_ttl: Duration::from_secs(24 * 60 * 60),
            event_dedup_capacity: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create a config, falling back to defaults for invalid values
    pub fn new(retry_max_attempts: u32, event_dedup_capacity: usize) -> Self {
        let default = Self::default();

        let retry_max_attempts = if retry_max_attempts == 0 {
            tracing::warn!(
                given = retry_max_attempts,
                fallback = default.retry_max_attempts,
                "invalid retry_max_attempts, using default"
            );
            default.retry_max_attempts
        } else {
            retry_max_attempts
        };

        let event_dedup_capacity = if event_dedup_capacity == 0 {
            tracing::warn!(
                given = event_dedup_capacity,
                fallback = default.event_dedup_capacity,
                "invalid event_dedup_capacity, using default"
            );
            default.event_dedup_capacity
        } else {
            event_dedup_capacity
        };

        Self {
            retry_max_attempts,
            event_dedup_capacity,
            ..default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = EngineConfig::default();
        assert!(config.retry_max_attempts >= 1);
        assert!(config.remote_timeout > Duration::ZERO);
        assert!(config.max_pending_age > config.sweep_grace);
        assert!(config.event_dedup_capacity > 0);
    }

    #[test]
    fn test_new_rejects_zero_values() {
        let config = EngineConfig::new(0, 0);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.event_dedup_capacity, 10_000);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = ProviderCredentials::sandbox("client-1", "super-secret");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("client-1"));
        assert!(!rendered.contains("super-secret"));
    }
}
