//! Token lifecycle orchestrator
//!
//! Drives the setup-token and payment-token flows across the remote
//! provider and the local store. Every externally-effectful operation takes
//! a caller-supplied idempotency key, claims it in the ledger, performs the
//! remote call first, then persists locally.
//!
//! Failure ordering is deliberate: a remote success followed by a local
//! write failure enqueues the remote entity for adoption instead of losing
//! it, and an indeterminate remote outcome leaves the local row in a
//! PENDING state for the reconciliation sweep to settle.

use crate::config::EngineConfig;
use crate::core::ledger::{request_fingerprint, BeginOutcome, IdempotencyLedger};
use crate::core::orphan::{AdoptionQueue, Orphan};
use crate::core::retry::{with_retry, RetryPolicy};
use crate::remote::{
    RemoteDeletion, RemotePaymentToken, RemoteSetupStatus, RemoteSetupToken, RemoteTokenStatus,
    TokenSource, VaultProvider,
};
use crate::store::LocalStore;
use crate::types::{
    CustomerId, InstrumentDescriptor, OperationKind, PaymentToken, PaymentTokenStatus,
    ResultSnapshot, SetupToken, SetupTokenStatus, VaultError,
};
use chrono::{Datelike, Utc};
use std::sync::Arc;

/// Bound on compare-and-swap re-reads before giving up
pub(crate) const CAS_RETRY_LIMIT: u32 = 16;

/// Where the instrument behind a new payment token comes from
#[derive(Debug, Clone)]
pub enum TokenizationSource {
    /// Exchange a locally APPROVED setup token
    SetupToken(String),
    /// Vault an instrument directly, without the approval step
    Instrument {
        customer_id: CustomerId,
        descriptor: InstrumentDescriptor,
    },
}

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAck {
    /// The provider confirmed deletion; the local row is soft-deleted
    Deleted,
    /// The outcome is unconfirmed; the row is PENDING_DELETE and the
    /// reconciliation sweep will finish the job
    Pending,
}

/// One page of a customer's payment tokens
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPage {
    pub items: Vec<PaymentToken>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

pub(crate) fn map_setup_status(status: RemoteSetupStatus) -> SetupTokenStatus {
    match status {
        RemoteSetupStatus::Created => SetupTokenStatus::Created,
        RemoteSetupStatus::Approved => SetupTokenStatus::Approved,
        RemoteSetupStatus::Consumed => SetupTokenStatus::Consumed,
        RemoteSetupStatus::Expired => SetupTokenStatus::Expired,
        RemoteSetupStatus::Failed => SetupTokenStatus::Failed,
    }
}

pub(crate) fn map_token_status(status: RemoteTokenStatus) -> PaymentTokenStatus {
    match status {
        RemoteTokenStatus::Active => PaymentTokenStatus::Active,
        RemoteTokenStatus::Revoked => PaymentTokenStatus::Revoked,
    }
}

pub(crate) fn setup_token_from_remote(remote: &RemoteSetupToken) -> SetupToken {
    let now = Utc::now();
    SetupToken {
        id: remote.id.clone(),
        customer_id: remote.customer_id.clone(),
        instrument_summary: remote.instrument_summary.clone(),
        status: map_setup_status(remote.status),
        local_version: 1,
        created_at: now,
        expires_at: remote.expires_at,
        updated_at: now,
        deleted_at: None,
    }
}

pub(crate) fn payment_token_from_remote(remote: &RemotePaymentToken) -> PaymentToken {
    let now = Utc::now();
    PaymentToken {
        id: remote.id.clone(),
        customer_id: remote.customer_id.clone(),
        instrument_summary: remote.instrument_summary.clone(),
        status: map_token_status(remote.status),
        local_version: 1,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Reject malformed instrument data before it reaches the provider
pub(crate) fn validate_descriptor(descriptor: &InstrumentDescriptor) -> Result<(), VaultError> {
    let digits = descriptor.number.len();
    if !(12..=19).contains(&digits) || !descriptor.number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VaultError::validation(
            "card number must be 12-19 digits",
        ));
    }
    if !(1..=12).contains(&descriptor.expiry_month) {
        return Err(VaultError::validation("expiry month must be 1-12"));
    }
    let now = Utc::now();
    let (year, month) = (now.year() as u16, now.month() as u8);
    if descriptor.expiry_year < year
        || (descriptor.expiry_year == year && descriptor.expiry_month < month)
    {
        return Err(VaultError::validation("instrument is expired"));
    }
    if !(3..=4).contains(&descriptor.cvv.len())
        || !descriptor.cvv.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(VaultError::validation("cvv must be 3-4 digits"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), VaultError> {
    if key.trim().is_empty() {
        return Err(VaultError::validation("idempotency key must not be empty"));
    }
    Ok(())
}

/// Orchestrates setup-token and payment-token operations
pub struct TokenLifecycle<P: VaultProvider> {
    provider: Arc<P>,
    store: Arc<LocalStore>,
    ledger: Arc<IdempotencyLedger>,
    adoption: Arc<AdoptionQueue>,
    config: EngineConfig,
}

impl<P: VaultProvider> TokenLifecycle<P> {
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

    /// Create a setup token for an instrument, pending payer approval
    ///
    /// Remote-first: the provider issues the token, then a local row is
    /// written in CREATED. Retrying with the same key replays the recorded
    /// result without a second remote creation.
    ///
    /// # Errors
    ///
    /// Validation and state errors are side-effect free. A
    /// [`VaultError::PartialFailure`] means the provider holds the token
    /// but the local row is pending adoption by the sweep.
    pub async fn create_setup_token(
        &self,
        key: &str,
        customer_id: &str,
        descriptor: &InstrumentDescriptor,
    ) -> Result<SetupToken, VaultError> {
        validate_key(key)?;
        if customer_id.trim().is_empty() {
            return Err(VaultError::validation("customer id must not be empty"));
        }
        validate_descriptor(descriptor)?;

        let fingerprint = request_fingerprint(&[
            "create_setup_token",
            customer_id,
            &descriptor.brand.to_string(),
            &descriptor.number,
            &descriptor.expiry_month.to_string(),
            &descriptor.expiry_year.to_string(),
        ]);
        match self
            .ledger
            .begin(key, OperationKind::CreateSetupToken, &fingerprint)?
        {
            BeginOutcome::Replay(ResultSnapshot::SetupToken(snapshot)) => {
                return Ok(self
                    .store
                    .get_setup_token(&snapshot.id)
                    .unwrap_or(snapshot));
            }
            BeginOutcome::Replay(_) => return Err(VaultError::key_reuse(key)),
            BeginOutcome::Proceed => {}
        }

        self.store.ensure_customer(customer_id);

        let remote = match with_retry(
            &self.config,
            "create_setup_token",
            Some(key),
            RetryPolicy::IdempotentDispatch,
            || self.provider.create_setup_token(key, customer_id, descriptor),
        )
        .await
        {
            Ok(remote) => remote,
            Err(err) => {
                self.ledger.complete_failed(key);
                return Err(err);
            }
        };

        let stored = self.persist_setup_token(key, &remote)?;
        self.ledger
            .complete_done(key, ResultSnapshot::SetupToken(stored.clone()));
        tracing::info!(
            setup_token = %stored.id,
            customer = %customer_id,
            "setup token created"
        );
        Ok(stored)
    }

    fn persist_setup_token(
        &self,
        key: &str,
        remote: &RemoteSetupToken,
    ) -> Result<SetupToken, VaultError> {
        let token = setup_token_from_remote(remote);
        match self.store.insert_setup_token(token.clone()) {
            Ok(stored) => Ok(stored),
            Err(VaultError::Duplicate { .. }) => {
                // Idempotent replay already landed this row.
                Ok(self.store.get_setup_token(&token.id).unwrap_or(token))
            }
            Err(err) => {
                tracing::warn!(
                    setup_token = %token.id,
                    error = %err,
                    "local write failed after remote success; queued for adoption"
                );
                self.adoption.enqueue(Orphan::SetupToken(remote.clone()));
                self.ledger.complete_failed(key);
                Err(VaultError::partial_failure(&token.id, Some(key)))
            }
        }
    }

    /// Local view of a setup token
    pub fn get_setup_token(&self, id: &str) -> Result<SetupToken, VaultError> {
        match self.store.get_setup_token(id) {
            Some(token) if token.deleted_at.is_none() => Ok(token),
            _ => Err(VaultError::not_found("setup token", id)),
        }
    }

    /// Exchange a setup token (or vault an instrument directly) for a
    /// durable payment token
    ///
    /// The setup-token path requires the local row to be APPROVED; the
    /// provider consumes the setup token as part of the exchange, and the
    /// local row is moved to CONSUMED once the exchange succeeds.
    pub async fn create_payment_token(
        &self,
        key: &str,
        source: TokenizationSource,
    ) -> Result<PaymentToken, VaultError> {
        validate_key(key)?;

        let fingerprint = match &source {
            TokenizationSource::SetupToken(setup_id) => {
                request_fingerprint(&["create_payment_token", "setup_token", setup_id])
            }
            TokenizationSource::Instrument {
                customer_id,
                descriptor,
            } => {
                if customer_id.trim().is_empty() {
                    return Err(VaultError::validation("customer id must not be empty"));
                }
                validate_descriptor(descriptor)?;
                request_fingerprint(&[
                    "create_payment_token",
                    "instrument",
                    customer_id,
                    &descriptor.number,
                    &descriptor.expiry_month.to_string(),
                    &descriptor.expiry_year.to_string(),
                ])
            }
        };

        // Replay wins over state checks: a completed exchange leaves the
        // setup token CONSUMED, and retrying that exchange must return the
        // recorded token, not an error.
        match self
            .ledger
            .begin(key, OperationKind::CreatePaymentToken, &fingerprint)?
        {
            BeginOutcome::Replay(ResultSnapshot::PaymentToken(snapshot)) => {
                return Ok(self
                    .store
                    .get_payment_token(&snapshot.id)
                    .unwrap_or(snapshot));
            }
            BeginOutcome::Replay(_) => return Err(VaultError::key_reuse(key)),
            BeginOutcome::Proceed => {}
        }

        let remote_source = match &source {
            TokenizationSource::SetupToken(setup_id) => {
                let local = match self.get_setup_token(setup_id) {
                    Ok(local) => local,
                    Err(err) => {
                        self.ledger.complete_failed(key);
                        return Err(err);
                    }
                };
                if local.status != SetupTokenStatus::Approved {
                    self.ledger.complete_failed(key);
                    return Err(VaultError::invalid_state(
                        "setup token",
                        setup_id,
                        &format!("{:?}", local.status).to_uppercase(),
                        "exchange",
                    ));
                }
                TokenSource::SetupToken(setup_id.clone())
            }
            TokenizationSource::Instrument {
                customer_id,
                descriptor,
            } => {
                self.store.ensure_customer(customer_id);
                TokenSource::Instrument {
                    customer_id: customer_id.clone(),
                    descriptor: descriptor.clone(),
                }
            }
        };

        let remote = match with_retry(
            &self.config,
            "create_payment_token",
            Some(key),
            RetryPolicy::IdempotentDispatch,
            || self.provider.create_payment_token(key, remote_source.clone()),
        )
        .await
        {
            Ok(remote) => remote,
            Err(err) => {
                self.ledger.complete_failed(key);
                return Err(err);
            }
        };

        // The provider has consumed the setup token; mirror that locally. A
        // failed mirror queues the remote token for adoption and frees the
        // key, since the remote exchange already happened.
        if let TokenizationSource::SetupToken(setup_id) = &source {
            if let Err(err) = self.mark_setup_token_consumed(setup_id) {
                tracing::warn!(
                    setup_token = %setup_id,
                    error = %err,
                    "consume mirror failed after remote exchange; queued for adoption"
                );
                self.adoption.enqueue(Orphan::PaymentToken(remote.clone()));
                self.ledger.complete_failed(key);
                return Err(VaultError::partial_failure(&remote.id, Some(key)));
            }
        }

        let token = payment_token_from_remote(&remote);
        let stored = match self.store.insert_payment_token(token.clone()) {
            Ok(stored) => stored,
            Err(VaultError::Duplicate { .. }) => {
                self.store.get_payment_token(&token.id).unwrap_or(token)
            }
            Err(err) => {
                tracing::warn!(
                    payment_token = %token.id,
                    error = %err,
                    "local write failed after remote success; queued for adoption"
                );
                self.adoption.enqueue(Orphan::PaymentToken(remote));
                self.ledger.complete_failed(key);
                return Err(VaultError::partial_failure(&token.id, Some(key)));
            }
        };

        self.ledger
            .complete_done(key, ResultSnapshot::PaymentToken(stored.clone()));
        tracing::info!(
            payment_token = %stored.id,
            customer = %stored.customer_id,
            "payment token created"
        );
        Ok(stored)
    }

    fn mark_setup_token_consumed(&self, setup_id: &str) -> Result<(), VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_setup_token(setup_id)
                .ok_or_else(|| VaultError::not_found("setup token", setup_id))?;
            if current.status == SetupTokenStatus::Consumed {
                return Ok(());
            }
            match self.store.update_setup_token(setup_id, current.local_version, |t| {
                t.status = SetupTokenStatus::Consumed;
            }) {
                Ok(_) => return Ok(()),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "setup token",
            setup_id,
            "version contention exceeded retry limit",
        ))
    }

    /// Delete a payment token remotely and soft-delete it locally
    ///
    /// The local row is moved to PENDING_DELETE before dispatch, so an
    /// indeterminate remote outcome can never leave a token that looks
    /// ACTIVE locally while deleted provider-side.
    pub async fn delete_payment_token(
        &self,
        key: &str,
        token_id: &str,
    ) -> Result<DeleteAck, VaultError> {
        validate_key(key)?;
        let local = self
            .store
            .get_payment_token(token_id)
            .ok_or_else(|| VaultError::not_found("payment token", token_id))?;
        if local.deleted_at.is_some() {
            return Ok(DeleteAck::Deleted);
        }

        let fingerprint = request_fingerprint(&["delete_payment_token", token_id]);
        match self
            .ledger
            .begin(key, OperationKind::DeletePaymentToken, &fingerprint)?
        {
            BeginOutcome::Replay(ResultSnapshot::Deleted(_)) => return Ok(DeleteAck::Deleted),
            BeginOutcome::Replay(_) => return Err(VaultError::key_reuse(key)),
            BeginOutcome::Proceed => {}
        }

        let prior_status = local.status;
        if let Err(err) = self.set_payment_token_status(token_id, PaymentTokenStatus::PendingDelete)
        {
            // Nothing was dispatched; free the key for retry.
            self.ledger.complete_failed(key);
            return Err(err);
        }

        match with_retry(
            &self.config,
            "delete_payment_token",
            Some(key),
            RetryPolicy::IdempotentDispatch,
            || self.provider.delete_payment_token(token_id),
        )
        .await
        {
            // NotFound provider-side means the deletion is already done.
            Ok(RemoteDeletion::Deleted) | Ok(RemoteDeletion::NotFound) => {
                // The remote outcome is settled either way; a failed local
                // soft delete leaves a PENDING_DELETE row the sweep finishes.
                let soft_deleted = self.soft_delete_payment_token(token_id);
                self.ledger
                    .complete_done(key, ResultSnapshot::Deleted(token_id.to_string()));
                soft_deleted?;
                tracing::info!(payment_token = %token_id, "payment token deleted");
                Ok(DeleteAck::Deleted)
            }
            Err(err @ VaultError::RemoteNonRetryable { .. }) => {
                self.ledger.complete_failed(key);
                self.set_payment_token_status(token_id, prior_status)?;
                Err(err)
            }
            Err(err) => {
                // Unconfirmed: the row stays PENDING_DELETE for the sweep.
                tracing::warn!(
                    payment_token = %token_id,
                    error = %err,
                    "delete unconfirmed; pending reconciliation"
                );
                self.ledger.complete_failed(key);
                Ok(DeleteAck::Pending)
            }
        }
    }

    pub(crate) fn set_payment_token_status(
        &self,
        token_id: &str,
        status: PaymentTokenStatus,
    ) -> Result<PaymentToken, VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_payment_token(token_id)
                .ok_or_else(|| VaultError::not_found("payment token", token_id))?;
            if current.status == status {
                return Ok(current);
            }
            match self
                .store
                .update_payment_token(token_id, current.local_version, |t| t.status = status)
            {
                Ok(updated) => return Ok(updated),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "payment token",
            token_id,
            "version contention exceeded retry limit",
        ))
    }

    fn soft_delete_payment_token(&self, token_id: &str) -> Result<(), VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_payment_token(token_id)
                .ok_or_else(|| VaultError::not_found("payment token", token_id))?;
            if current.deleted_at.is_some() {
                return Ok(());
            }
            match self
                .store
                .update_payment_token(token_id, current.local_version, |t| {
                    t.deleted_at = Some(Utc::now());
                }) {
                Ok(_) => return Ok(()),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "payment token",
            token_id,
            "version contention exceeded retry limit",
        ))
    }

    /// Local view of a payment token
    ///
    /// Soft-deleted rows are not found; a PENDING_DELETE row is returned
    /// as-is so the caller can see the unresolved state. A read for an id
    /// with no local row at all is noted for the sweep, which checks the
    /// provider and adopts the token if one exists there; the read itself
    /// still returns NotFound so its latency stays local-only.
    pub fn get_payment_token(&self, id: &str) -> Result<PaymentToken, VaultError> {
        match self.store.get_payment_token(id) {
            Some(token) if token.deleted_at.is_none() => Ok(token),
            Some(_) => Err(VaultError::not_found("payment token", id)),
            None => {
                self.adoption.note_read_miss(id);
                Err(VaultError::not_found("payment token", id))
            }
        }
    }

    /// Page through a customer's stored payment tokens
    ///
    /// Pages are 1-based; ordering is stable (creation time, then id).
    pub fn list_customer_payment_tokens(
        &self,
        customer_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<TokenPage, VaultError> {
        if page == 0 || page_size == 0 {
            return Err(VaultError::validation(
                "page and page_size must be at least 1",
            ));
        }
        let all = self.store.payment_tokens_for_customer(customer_id);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();
        Ok(TokenPage {
            items,
            page,
            page_size,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockVaultProvider, Script};
    use crate::types::CardBrand;
    use std::time::Duration;

    fn visa() -> InstrumentDescriptor {
        InstrumentDescriptor {
            brand: CardBrand::Visa,
            number: "4111111111111111".to_string(),
            expiry_month: 12,
            expiry_year: 2030,
            cvv: "123".to_string(),
        }
    }

    struct Harness {
        provider: Arc<MockVaultProvider>,
        store: Arc<LocalStore>,
        ledger: Arc<IdempotencyLedger>,
        adoption: Arc<AdoptionQueue>,
        lifecycle: TokenLifecycle<MockVaultProvider>,
    }

    fn harness() -> Harness {
        let provider = Arc::new(MockVaultProvider::new());
        let store = Arc::new(LocalStore::new());
        let config = EngineConfig {
            retry_base_delay: Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let ledger = Arc::new(IdempotencyLedger::new(config.ledger_ttl));
        let adoption = Arc::new(AdoptionQueue::new());
        let lifecycle = TokenLifecycle::new(
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
            lifecycle,
        }
    }

    /// Walks a setup token through creation and local approval
    async fn approved_setup_token(h: &Harness, key: &str) -> SetupToken {
        let token = h
            .lifecycle
            .create_setup_token(key, "cust_1", &visa())
            .await
            .unwrap();
        h.provider.approve_setup_token(&token.id).await;
        h.store
            .update_setup_token(&token.id, token.local_version, |t| {
                t.status = SetupTokenStatus::Approved;
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_setup_token_persists_created_row() {
        let h = harness();
        let token = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();

        assert_eq!(token.status, SetupTokenStatus::Created);
        assert_eq!(token.local_version, 1);
        assert_eq!(token.instrument_summary.last4, "1111");
        assert!(h.store.get_customer("cust_1").is_some());
        assert_eq!(h.store.get_setup_token(&token.id), Some(token));
    }

    #[tokio::test]
    async fn test_create_setup_token_replays_on_same_key() {
        let h = harness();
        let first = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();
        let second = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_same_key_different_instrument_rejected() {
        let h = harness();
        h.lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();

        let other = InstrumentDescriptor {
            number: "5555555555554444".to_string(),
            brand: CardBrand::Mastercard,
            ..visa()
        };
        let err = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &other)
            .await
            .unwrap_err();
        assert_eq!(err, VaultError::key_reuse("key-1"));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_rejected_before_dispatch() {
        let h = harness();
        let bad = InstrumentDescriptor {
            number: "41".to_string(),
            ..visa()
        };
        let err = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &bad)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation { .. }));
        // The key was never claimed.
        assert!(h.ledger.get("key-1").is_none());
    }

    #[tokio::test]
    async fn test_transient_remote_failure_is_retried() {
        let h = harness();
        h.provider
            .script_next("create_setup_token", Script::Retryable("503".to_string()))
            .await;

        let token = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();
        assert_eq!(token.status, SetupTokenStatus::Created);
    }

    #[tokio::test]
    async fn test_local_write_failure_queues_orphan() {
        let h = harness();
        h.store.fail_next_inserts(1);

        let err = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PartialFailure { .. }));
        assert_eq!(h.adoption.len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_requires_approved_setup_token() {
        let h = harness();
        let token = h
            .lifecycle
            .create_setup_token("key-1", "cust_1", &visa())
            .await
            .unwrap();

        let err = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(token.id))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_exchange_consumes_setup_token_and_creates_payment_token() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;

        let payment = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id.clone()))
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentTokenStatus::Active);
        assert_eq!(payment.customer_id, "cust_1");
        assert_eq!(
            h.store.get_setup_token(&setup.id).unwrap().status,
            SetupTokenStatus::Consumed
        );
    }

    #[tokio::test]
    async fn test_exchange_replay_yields_same_payment_token() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;

        let first = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id.clone()))
            .await
            .unwrap();
        let second = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.provider.payment_token_count().await, 1);
    }

    #[tokio::test]
    async fn test_consume_mirror_failure_frees_key_and_queues_orphan() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;
        h.store.fail_next_updates(1);

        let err = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PartialFailure { .. }));
        assert_eq!(h.adoption.len(), 1);

        // The key is free and the retry converges on the same remote token.
        let token = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id.clone()))
            .await
            .unwrap();
        assert_eq!(token.status, PaymentTokenStatus::Active);
        assert_eq!(h.provider.payment_token_count().await, 1);
        assert_eq!(
            h.store.get_setup_token(&setup.id).unwrap().status,
            SetupTokenStatus::Consumed
        );
    }

    #[tokio::test]
    async fn test_direct_instrument_tokenization() {
        let h = harness();
        let payment = h
            .lifecycle
            .create_payment_token(
                "key-1",
                TokenizationSource::Instrument {
                    customer_id: "cust_9".to_string(),
                    descriptor: visa(),
                },
            )
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentTokenStatus::Active);
        assert!(h.store.get_customer("cust_9").is_some());
    }

    #[tokio::test]
    async fn test_delete_soft_deletes_on_confirmation() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;
        let payment = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id))
            .await
            .unwrap();

        let ack = h
            .lifecycle
            .delete_payment_token("key-3", &payment.id)
            .await
            .unwrap();
        assert_eq!(ack, DeleteAck::Deleted);

        let row = h.store.get_payment_token(&payment.id).unwrap();
        assert!(row.deleted_at.is_some());
        assert!(h.lifecycle.get_payment_token(&payment.id).is_err());
        assert_eq!(h.provider.payment_token_count().await, 0);
    }

    #[tokio::test]
    async fn test_pending_delete_write_failure_frees_key() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;
        let payment = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id))
            .await
            .unwrap();
        h.store.fail_next_updates(1);

        let err = h
            .lifecycle
            .delete_payment_token("key-3", &payment.id)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Store { .. }));
        assert_eq!(
            h.store.get_payment_token(&payment.id).unwrap().status,
            PaymentTokenStatus::Active
        );

        // Nothing was dispatched and the key is free; the retry completes.
        let ack = h
            .lifecycle
            .delete_payment_token("key-3", &payment.id)
            .await
            .unwrap();
        assert_eq!(ack, DeleteAck::Deleted);
    }

    #[tokio::test]
    async fn test_unconfirmed_delete_leaves_pending_delete() {
        let h = harness();
        let setup = approved_setup_token(&h, "key-1").await;
        let payment = h
            .lifecycle
            .create_payment_token("key-2", TokenizationSource::SetupToken(setup.id))
            .await
            .unwrap();

        h.provider
            .script_next(
                "delete_payment_token",
                Script::Unknown {
                    processed: true,
                    reason: "connection reset".to_string(),
                },
            )
            .await;

        let ack = h
            .lifecycle
            .delete_payment_token("key-3", &payment.id)
            .await
            .unwrap();
        assert_eq!(ack, DeleteAck::Pending);

        let row = h.store.get_payment_token(&payment.id).unwrap();
        assert_eq!(row.status, PaymentTokenStatus::PendingDelete);
        assert!(row.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_listing_is_paginated_and_ordered() {
        let h = harness();
        for i in 0..5 {
            h.lifecycle
                .create_payment_token(
                    &format!("key-{}", i),
                    TokenizationSource::Instrument {
                        customer_id: "cust_1".to_string(),
                        descriptor: visa(),
                    },
                )
                .await
                .unwrap();
        }

        let page1 = h
            .lifecycle
            .list_customer_payment_tokens("cust_1", 1, 2)
            .unwrap();
        let page3 = h
            .lifecycle
            .list_customer_payment_tokens("cust_1", 3, 2)
            .unwrap();

        assert_eq!(page1.total, 5);
        assert_eq!(page1.items.len(), 2);
        assert_eq!(page3.items.len(), 1);
        assert!(h
            .lifecycle
            .list_customer_payment_tokens("cust_1", 0, 2)
            .is_err());
    }
}
