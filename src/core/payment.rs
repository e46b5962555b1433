//! Payment execution orchestrator
//!
//! Executes charges against stored payment tokens. The charge is the one
//! operation where an ambiguous remote outcome is never resolved by blind
//! re-dispatch: after an `Unknown`, the executor looks the charge up by its
//! idempotency key, and only a provider confirmation that nothing landed
//! permits a fresh dispatch. If the ambiguity cannot be resolved at all,
//! the order is persisted as INITIATED and handed to the reconciliation
//! sweep, so no charge outcome is ever silently dropped.

use crate::config::EngineConfig;
use crate::core::ledger::{request_fingerprint, BeginOutcome, IdempotencyLedger};
use crate::core::orphan::{AdoptionQueue, Orphan};
use crate::core::retry::{backoff_delay, with_retry, RetryPolicy};
use crate::remote::{RemoteCharge, RemoteChargeStatus, RemoteOutcome, VaultProvider};
use crate::store::LocalStore;
use crate::types::{
    Currency, OperationKind, Order, OrderStatus, PaymentTokenStatus, ResultSnapshot, VaultError,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) fn map_charge_status(status: RemoteChargeStatus) -> OrderStatus {
    match status {
        RemoteChargeStatus::Authorized => OrderStatus::Authorized,
        RemoteChargeStatus::Captured => OrderStatus::Captured,
        RemoteChargeStatus::Reversed => OrderStatus::Reversed,
        RemoteChargeStatus::Declined => OrderStatus::Failed,
    }
}

/// Orchestrates charge execution and order reads
pub struct PaymentExecutor<P: VaultProvider> {
    provider: Arc<P>,
    store: Arc<LocalStore>,
    ledger: Arc<IdempotencyLedger>,
    adoption: Arc<AdoptionQueue>,
    config: EngineConfig,
}

impl<P: VaultProvider> PaymentExecutor<P> {
    pub fn new(
        provider: Arc<P>,
        store: Arc<LocalStore>,
        ledger: Arc<IdempotencyLedger>,
        adoption: Arc<AdoptionQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            store,
            ledger,
            adoption,
            config,
        }
    }

    /// Execute a charge against an ACTIVE payment token
    ///
    /// Returns the resulting order. An order in INITIATED means the charge
    /// was dispatched but its outcome is still unconfirmed; retrying with
    /// the same key replays that order rather than charging again, and the
    /// reconciliation sweep settles it.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Validation`] / [`VaultError::InvalidState`] with no
    ///   remote side effect; the key stays usable
    /// - [`VaultError::IdempotencyKeyReuse`] when the key was used with a
    ///   different charge request
    /// - [`VaultError::RemoteNonRetryable`] when the provider declines
    /// - [`VaultError::PartialFailure`] when the charge landed but the
    ///   local order write failed; the order is queued for adoption
    pub async fn charge_with_token(
        &self,
        key: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
    ) -> Result<Order, VaultError> {
        if key.trim().is_empty() {
            return Err(VaultError::validation("idempotency key must not be empty"));
        }
        if amount <= Decimal::ZERO {
            return Err(VaultError::validation("amount must be greater than zero"));
        }

        let fingerprint = request_fingerprint(&[
            "charge",
            token_id,
            &amount.to_string(),
            &currency.to_string(),
        ]);
        // Replay wins over state checks: the token may have been revoked or
        // deleted since the recorded charge, and the retry must still see
        // the recorded order.
        match self.ledger.begin(key, OperationKind::Charge, &fingerprint)? {
            BeginOutcome::Replay(ResultSnapshot::Order(snapshot)) => {
                // The sweep may have settled the order since it was cached.
                return Ok(self.store.get_order(&snapshot.id).unwrap_or(snapshot));
            }
            BeginOutcome::Replay(_) => return Err(VaultError::key_reuse(key)),
            BeginOutcome::Proceed => {}
        }

        let token = match self
            .store
            .get_payment_token(token_id)
            .filter(|t| t.deleted_at.is_none())
        {
            Some(token) => token,
            None => {
                self.ledger.complete_failed(key);
                return Err(VaultError::not_found("payment token", token_id));
            }
        };
        if token.status != PaymentTokenStatus::Active {
            self.ledger.complete_failed(key);
            return Err(VaultError::invalid_state(
                "payment token",
                token_id,
                match token.status {
                    PaymentTokenStatus::PendingDelete => "PENDING_DELETE",
                    PaymentTokenStatus::Revoked => "REVOKED",
                    PaymentTokenStatus::Active => "ACTIVE",
                },
                "charge",
            ));
        }

        let charge = match self.dispatch_charge(key, token_id, amount, currency).await? {
            Some(charge) => charge,
            // Ambiguity could not be resolved; the INITIATED order was
            // already persisted and recorded.
            None => {
                return self
                    .store
                    .get_order_by_idempotency_key(key)
                    .ok_or_else(|| VaultError::remote_unknown("charge", Some(key)));
            }
        };

        let status = map_charge_status(charge.status);
        if status == OrderStatus::Failed {
            self.record_failed_order(key, token_id, amount, currency, Some(charge));
            return Err(VaultError::remote_non_retryable("charge declined", Some(key)));
        }

        let order = self.build_order(key, token_id, amount, currency, status, Some(charge));
        self.persist_order(key, order)
    }

    /// Drive the charge to a confirmed outcome
    ///
    /// `Ok(None)` means the outcome stayed indeterminate and an INITIATED
    /// order has been persisted and recorded under the key.
    async fn dispatch_charge(
        &self,
        key: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
    ) -> Result<Option<RemoteCharge>, VaultError> {
        let mut last_reason = String::new();
        for attempt in 0..self.config.retry_max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.config.retry_base_delay, attempt - 1)).await;
            }

            let outcome = match tokio::time::timeout(
                self.config.remote_timeout,
                self.provider
                    .charge(key, token_id, amount, currency, self.config.capture_mode),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => RemoteOutcome::Unknown {
                    reason: "timed out".to_string(),
                },
            };

            match outcome {
                RemoteOutcome::Success(charge) => return Ok(Some(charge)),
                // Retryable is a provider guarantee that nothing was
                // processed; re-dispatch is safe.
                RemoteOutcome::Retryable { reason } => {
                    tracing::debug!(attempt, %reason, "transient charge failure");
                    last_reason = reason;
                }
                RemoteOutcome::NonRetryable { reason } => {
                    self.record_failed_order(key, token_id, amount, currency, None);
                    return Err(VaultError::remote_non_retryable(&reason, Some(key)));
                }
                RemoteOutcome::Unknown { reason } => {
                    tracing::warn!(%reason, "charge outcome unknown; querying by key");
                    match self.lookup_charge(key).await {
                        Ok(Some(charge)) => return Ok(Some(charge)),
                        // Confirmed never landed; a fresh dispatch is safe.
                        Ok(None) => {
                            last_reason = reason;
                        }
                        Err(_) => {
                            self.record_initiated_order(key, token_id, amount, currency)?;
                            return Ok(None);
                        }
                    }
                }
            }
        }

        self.ledger.complete_failed(key);
        Err(VaultError::remote_retryable(
            &last_reason,
            self.config.retry_max_attempts,
            Some(key),
        ))
    }

    async fn lookup_charge(&self, key: &str) -> Result<Option<RemoteCharge>, VaultError> {
        with_retry(
            &self.config,
            "fetch_charge_status",
            Some(key),
            RetryPolicy::Fetch,
            || self.provider.fetch_charge_status(key),
        )
        .await
    }

    /// Mirror a declined charge as a FAILED order row
    ///
    /// FAILED orders do not block the key, so the caller may retry with the
    /// same key; the row remains as the audit record of the attempt.
    fn record_failed_order(
        &self,
        key: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
        charge: Option<RemoteCharge>,
    ) {
        let order = self.build_order(key, token_id, amount, currency, OrderStatus::Failed, charge);
        if let Err(err) = self.store.insert_order(order) {
            tracing::warn!(error = %err, "failed order row could not be written");
        }
        self.ledger.complete_failed(key);
    }

    /// Persist the unresolved charge as an INITIATED order and cache it
    /// under the key, so any retry replays instead of re-charging
    fn record_initiated_order(
        &self,
        key: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
    ) -> Result<(), VaultError> {
        let order = self.build_order(key, token_id, amount, currency, OrderStatus::Initiated, None);
        tracing::warn!(
            order = %order.id,
            payment_token = %token_id,
            "charge unresolved; order initiated pending reconciliation"
        );
        self.persist_order(key, order).map(|_| ())
    }

    fn build_order(
        &self,
        key: &str,
        token_id: &str,
        amount: Decimal,
        currency: Currency,
        status: OrderStatus,
        charge: Option<RemoteCharge>,
    ) -> Order {
        let now = Utc::now();
        Order {
            id: format!("ord_{}", Uuid::new_v4()),
            payment_token_id: token_id.to_string(),
            amount,
            currency,
            status,
            idempotency_key: key.to_string(),
            provider_transaction_id: charge.map(|c| c.transaction_id),
            local_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn persist_order(&self, key: &str, order: Order) -> Result<Order, VaultError> {
        match self.store.insert_order(order.clone()) {
            Ok(stored) => {
                self.ledger
                    .complete_done(key, ResultSnapshot::Order(stored.clone()));
                tracing::info!(
                    order = %stored.id,
                    status = ?stored.status,
                    "order persisted"
                );
                Ok(stored)
            }
            Err(VaultError::Duplicate { .. }) => {
                // A concurrent writer landed the order for this key first.
                let existing = self
                    .store
                    .get_order_by_idempotency_key(key)
                    .ok_or_else(|| VaultError::not_found("order", key))?;
                self.ledger
                    .complete_done(key, ResultSnapshot::Order(existing.clone()));
                Ok(existing)
            }
            Err(err) => {
                tracing::warn!(
                    order = %order.id,
                    error = %err,
                    "order write failed after charge; queued for adoption"
                );
                let order_id = order.id.clone();
                self.ledger
                    .complete_done(key, ResultSnapshot::Order(order.clone()));
                self.adoption.enqueue(Orphan::Order(order));
                Err(VaultError::partial_failure(&order_id, Some(key)))
            }
        }
    }

    /// Local view of an order
    pub fn get_order(&self, id: &str) -> Result<Order, VaultError> {
        self.store
            .get_order(id)
            .ok_or_else(|| VaultError::not_found("order", id))
    }

    /// Look an order up by the idempotency key that created it
    pub fn get_order_by_idempotency_key(&self, key: &str) -> Result<Order, VaultError> {
        self.store
            .get_order_by_idempotency_key(key)
            .ok_or_else(|| VaultError::not_found("order", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureMode;
    use crate::remote::{MockVaultProvider, Script};
    use crate::types::{CardBrand, InstrumentSummary};
    use std::time::Duration;

    fn summary() -> InstrumentSummary {
        InstrumentSummary {
            brand: CardBrand::Visa,
            last4: "1111".to_string(),
            expiry_month: 12,
            expiry_year: 2030,
        }
    }

    struct Harness {
        provider: Arc<MockVaultProvider>,
        store: Arc<LocalStore>,
        ledger: Arc<IdempotencyLedger>,
        adoption: Arc<AdoptionQueue>,
        executor: PaymentExecutor<MockVaultProvider>,
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let provider = Arc::new(MockVaultProvider::new());
        let store = Arc::new(LocalStore::new());
        let ledger = Arc::new(IdempotencyLedger::new(config.ledger_ttl));
        let adoption = Arc::new(AdoptionQueue::new());
        let executor = PaymentExecutor::new(
            Arc::clone(&provider),
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&adoption),
            config,
        );
        Harness {
            provider,
            store,
            ledger,
            adoption,
            executor,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig {
            retry_base_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        })
    }

    /// Seeds the same ACTIVE token on both sides
    async fn active_token(h: &Harness) -> String {
        let id = h.provider.seed_payment_token("cust_1", summary()).await;
        let now = Utc::now();
        h.store
            .insert_payment_token(crate::types::PaymentToken {
                id: id.clone(),
                customer_id: "cust_1".to_string(),
                instrument_summary: summary(),
                status: PaymentTokenStatus::Active,
                local_version: 1,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            })
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_charge_captures_and_persists_order() {
        let h = harness();
        let token_id = active_token(&h).await;

        let order = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(2999, 2), Currency::Usd)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Captured);
        assert!(order.provider_transaction_id.is_some());
        assert_eq!(h.executor.get_order(&order.id).unwrap(), order);
        assert_eq!(
            h.executor.get_order_by_idempotency_key("key-1").unwrap().id,
            order.id
        );
    }

    #[tokio::test]
    async fn test_manual_capture_authorizes_only() {
        let h = harness_with(EngineConfig {
            capture_mode: CaptureMode::Manual,
            retry_base_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        });
        let token_id = active_token(&h).await;

        let order = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Authorized);
    }

    #[tokio::test]
    async fn test_replay_returns_same_order_without_second_dispatch() {
        let h = harness();
        let token_id = active_token(&h).await;

        let first = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        let second = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_replay_after_token_revoked_returns_recorded_order() {
        let h = harness();
        let token_id = active_token(&h).await;

        let first = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();

        // The token is revoked after the charge completed.
        let current = h.store.get_payment_token(&token_id).unwrap();
        h.store
            .update_payment_token(&token_id, current.local_version, |t| {
                t.status = PaymentTokenStatus::Revoked;
            })
            .unwrap();

        let replay = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(replay.id, first.id);
        assert_eq!(h.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_amount_rejected() {
        let h = harness();
        let token_id = active_token(&h).await;

        h.executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        let err = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(9900, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert_eq!(err, VaultError::key_reuse("key-1"));
    }

    #[tokio::test]
    async fn test_unknown_outcome_resolved_by_status_lookup() {
        let h = harness();
        let token_id = active_token(&h).await;

        // The charge lands but the response is lost.
        h.provider
            .script_next(
                "charge",
                Script::Unknown {
                    processed: true,
                    reason: "connection reset".to_string(),
                },
            )
            .await;

        let order = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();

        // Resolved via the key lookup; never dispatched twice.
        assert_eq!(order.status, OrderStatus::Captured);
        assert!(order.provider_transaction_id.is_some());
        assert_eq!(h.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_unknown_lands_initiated_order() {
        let h = harness();
        let token_id = active_token(&h).await;

        h.provider
            .script_next(
                "charge",
                Script::Unknown {
                    processed: true,
                    reason: "connection reset".to_string(),
                },
            )
            .await;
        // The status lookup stays ambiguous for every fetch attempt.
        for _ in 0..3 {
            h.provider
                .script_next(
                    "fetch_charge_status",
                    Script::Retryable("unavailable".to_string()),
                )
                .await;
        }

        let order = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Initiated);
        assert!(order.provider_transaction_id.is_none());
        assert_eq!(h.provider.charge_dispatches(), 1);

        // A retry replays the INITIATED order instead of charging again.
        let replay = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(replay.id, order.id);
        assert_eq!(h.provider.charge_dispatches(), 1);
    }

    #[tokio::test]
    async fn test_charge_against_missing_or_inactive_token_rejected() {
        let h = harness();
        let err = h
            .executor
            .charge_with_token("key-1", "pt_missing", Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound { .. }));

        let token_id = active_token(&h).await;
        let current = h.store.get_payment_token(&token_id).unwrap();
        h.store
            .update_payment_token(&token_id, current.local_version, |t| {
                t.status = PaymentTokenStatus::Revoked;
            })
            .unwrap();

        let err = h
            .executor
            .charge_with_token("key-2", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_declined_charge_records_failed_order_and_frees_key() {
        let h = harness();
        let token_id = active_token(&h).await;

        // Over the provider limit: a permanent decline.
        let err = h
            .executor
            .charge_with_token(
                "key-1",
                &token_id,
                Decimal::new(200_000, 0),
                Currency::Usd,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RemoteNonRetryable { .. }));

        // The attempt is mirrored as a FAILED order row.
        let order = h.executor.get_order_by_idempotency_key("key-1").unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.provider_transaction_id.is_none());

        // A FAILED record does not burn the key for the identical request.
        let err = h
            .executor
            .charge_with_token(
                "key-1",
                &token_id,
                Decimal::new(200_000, 0),
                Currency::Usd,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RemoteNonRetryable { .. }));
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_before_any_effect() {
        let h = harness();
        let token_id = active_token(&h).await;

        let err = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::ZERO, Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
        assert!(h.ledger.get("key-1").is_none());
        assert_eq!(h.provider.charge_dispatches(), 0);
    }

    #[tokio::test]
    async fn test_order_write_failure_queues_adoption_and_replays() {
        let h = harness();
        let token_id = active_token(&h).await;
        h.store.fail_next_inserts(1);

        let err = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PartialFailure { .. }));
        assert_eq!(h.adoption.len(), 1);
        assert_eq!(h.provider.charge_dispatches(), 1);

        // The outcome is recorded: a retry replays, it does not re-charge.
        let replay = h
            .executor
            .charge_with_token("key-1", &token_id, Decimal::new(1000, 2), Currency::Usd)
            .await
            .unwrap();
        assert_eq!(replay.status, OrderStatus::Captured);
        assert_eq!(h.provider.charge_dispatches(), 1);
    }
}
