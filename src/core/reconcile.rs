//! Reconciliation processor
//!
//! Keeps the local store converged with the provider through two inputs:
//! pushed provider events (webhooks) and a periodic sweep. The provider is
//! the source of truth for token and charge state, so every divergence is
//! resolved remote-wins, applied under the store's version check so a
//! concurrent orchestrator write is never clobbered blindly.
//!
//! Events are deduplicated by event id in a bounded FIFO set; delivery is
//! at-least-once and the sweep backstops anything an event misses.

use crate::config::EngineConfig;
use crate::core::ledger::IdempotencyLedger;
use crate::core::lifecycle::{
    map_setup_status, map_token_status, payment_token_from_remote, setup_token_from_remote,
    CAS_RETRY_LIMIT,
};
use crate::core::orphan::{AdoptionQueue, Orphan};
use crate::core::payment::map_charge_status;
use crate::core::retry::{with_retry, RetryPolicy};
use crate::remote::{RemoteDeletion, VaultProvider};
use crate::store::LocalStore;
use crate::types::{
    Order, OrderStatus, PaymentToken, PaymentTokenStatus, ProviderEntityType, ProviderEvent,
    ResultSnapshot, SetupToken, SetupTokenStatus, VaultError,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// What the processor did with one provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The local row was updated to the provider's state
    Applied,
    /// Duplicate, stale, or irrelevant; nothing changed
    Ignored,
    /// The entity had no local row and was adopted from the provider
    Adopted,
}

/// Bounded FIFO set of processed event ids
struct SeenSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if !self.members.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }
}

/// Counters from one sweep pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Orphans drained from the adoption queue into the store
    pub adopted: usize,
    /// PENDING_DELETE tokens resolved against the provider
    pub deletes_resolved: usize,
    /// INITIATED orders settled via charge status lookup
    pub orders_settled: usize,
    /// Setup tokens whose state was pulled up to the provider's
    pub tokens_synchronized: usize,
    /// Expired setup tokens garbage-collected
    pub setup_tokens_expired: usize,
    /// Idempotency records pruned
    pub ledger_pruned: usize,
    /// Entities pending past the allowed age, needing operator attention
    pub escalations: Vec<VaultError>,
    /// Transient failures; the next sweep retries them
    pub errors: Vec<VaultError>,
}

/// Result of a per-customer token synchronization
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Provider tokens with no local row, now adopted
    pub adopted: usize,
    /// Local rows whose status was corrected to the provider's
    pub updated: usize,
    /// Local rows soft-deleted because the provider no longer has them
    pub removed: usize,
}

/// Converges local state with the provider
pub struct Reconciler<P: VaultProvider> {
    provider: Arc<P>,
    store: Arc<LocalStore>,
    ledger: Arc<IdempotencyLedger>,
    adoption: Arc<AdoptionQueue>,
    config: EngineConfig,
    seen: Mutex<SeenSet>,
}

impl<P: VaultProvider> Reconciler<P> {
    pub fn new(
        provider: Arc<P>,
        store: Arc<LocalStore>,
        ledger: Arc<IdempotencyLedger>,
        adoption: Arc<AdoptionQueue>,
        config: EngineConfig,
    ) -> Self {
        let seen = Mutex::new(SeenSet::new(config.event_dedup_capacity));
        Self {
            provider,
            store,
            ledger,
            adoption,
            config,
            seen,
        }
    }

    fn already_seen(&self, event_id: &str) -> bool {
        self.seen
            .lock()
            .map(|seen| seen.contains(event_id))
            .unwrap_or(false)
    }

    fn mark_seen(&self, event_id: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(event_id);
        }
    }

    /// Apply one pushed provider event
    ///
    /// Duplicate event ids and events stale relative to the local row are
    /// ignored. An event for an entity with no local row triggers adoption
    /// from the provider's current state, not from the event payload.
    pub async fn ingest_event(&self, event: &ProviderEvent) -> Result<ReconcileAction, VaultError> {
        if self.already_seen(&event.event_id) {
            return Ok(ReconcileAction::Ignored);
        }

        let action = match event.entity_type {
            ProviderEntityType::SetupToken => self.apply_setup_token_event(event).await?,
            ProviderEntityType::PaymentToken => self.apply_payment_token_event(event).await?,
            ProviderEntityType::Payment => self.apply_payment_event(event)?,
        };

        // Marked only after successful processing, so a failed event can be
        // redelivered.
        self.mark_seen(&event.event_id);
        tracing::debug!(
            event = %event.event_id,
            entity = %event.entity_id,
            ?action,
            "provider event processed"
        );
        Ok(action)
    }

    async fn apply_setup_token_event(
        &self,
        event: &ProviderEvent,
    ) -> Result<ReconcileAction, VaultError> {
        let new_status = match event.new_status.to_ascii_uppercase().as_str() {
            "CREATED" => SetupTokenStatus::Created,
            "APPROVED" => SetupTokenStatus::Approved,
            "CONSUMED" => SetupTokenStatus::Consumed,
            "EXPIRED" => SetupTokenStatus::Expired,
            "FAILED" => SetupTokenStatus::Failed,
            other => {
                tracing::warn!(status = other, "unrecognized setup token status");
                return Ok(ReconcileAction::Ignored);
            }
        };

        let Some(local) = self.store.get_setup_token(&event.entity_id) else {
            return self.adopt_setup_token(&event.entity_id).await;
        };

        // Terminal local states never move backwards on an event.
        let terminal = matches!(
            local.status,
            SetupTokenStatus::Consumed | SetupTokenStatus::Expired | SetupTokenStatus::Failed
        );
        if terminal || local.status == new_status {
            return Ok(ReconcileAction::Ignored);
        }

        self.cas_setup_token(&event.entity_id, |t| t.status = new_status)?;
        Ok(ReconcileAction::Applied)
    }

    async fn adopt_setup_token(&self, id: &str) -> Result<ReconcileAction, VaultError> {
        let remote = with_retry(
            &self.config,
            "fetch_setup_token",
            None,
            RetryPolicy::Fetch,
            || self.provider.fetch_setup_token(id),
        )
        .await?;
        match remote {
            Some(remote) => {
                match self.store.insert_setup_token(setup_token_from_remote(&remote)) {
                    Ok(_) | Err(VaultError::Duplicate { .. }) => Ok(ReconcileAction::Adopted),
                    Err(err) => Err(err),
                }
            }
            None => Ok(ReconcileAction::Ignored),
        }
    }

    async fn apply_payment_token_event(
        &self,
        event: &ProviderEvent,
    ) -> Result<ReconcileAction, VaultError> {
        let Some(local) = self.store.get_payment_token(&event.entity_id) else {
            return self.adopt_payment_token(&event.entity_id).await;
        };

        match event.new_status.to_ascii_uppercase().as_str() {
            "REVOKED" => {
                if local.deleted_at.is_some() || local.status == PaymentTokenStatus::Revoked {
                    return Ok(ReconcileAction::Ignored);
                }
                self.cas_payment_token(&event.entity_id, |t| {
                    t.status = PaymentTokenStatus::Revoked;
                })?;
                Ok(ReconcileAction::Applied)
            }
            "DELETED" => {
                if local.deleted_at.is_some() {
                    return Ok(ReconcileAction::Ignored);
                }
                self.cas_payment_token(&event.entity_id, |t| {
                    t.deleted_at = Some(Utc::now());
                })?;
                Ok(ReconcileAction::Applied)
            }
            // ACTIVE on a PENDING_DELETE row is stale relative to our own
            // in-flight deletion; the sweep settles it definitively.
            "ACTIVE" => Ok(ReconcileAction::Ignored),
            other => {
                tracing::warn!(status = other, "unrecognized payment token status");
                Ok(ReconcileAction::Ignored)
            }
        }
    }

    async fn adopt_payment_token(&self, id: &str) -> Result<ReconcileAction, VaultError> {
        let remote = with_retry(
            &self.config,
            "fetch_payment_token",
            None,
            RetryPolicy::Fetch,
            || self.provider.fetch_payment_token(id),
        )
        .await?;
        match remote {
            Some(remote) => {
                match self
                    .store
                    .insert_payment_token(payment_token_from_remote(&remote))
                {
                    Ok(_) | Err(VaultError::Duplicate { .. }) => Ok(ReconcileAction::Adopted),
                    Err(err) => Err(err),
                }
            }
            None => Ok(ReconcileAction::Ignored),
        }
    }

    fn apply_payment_event(&self, event: &ProviderEvent) -> Result<ReconcileAction, VaultError> {
        let new_status = match event.new_status.to_ascii_uppercase().as_str() {
            "AUTHORIZED" => OrderStatus::Authorized,
            "CAPTURED" => OrderStatus::Captured,
            "REVERSED" => OrderStatus::Reversed,
            "DECLINED" | "FAILED" => OrderStatus::Failed,
            other => {
                tracing::warn!(status = other, "unrecognized payment status");
                return Ok(ReconcileAction::Ignored);
            }
        };

        // Payment events reference the provider transaction id; an order
        // still missing its id is settled by the sweep instead.
        let Some(local) = self.store.find_order_by_transaction_id(&event.entity_id) else {
            return Ok(ReconcileAction::Ignored);
        };

        let terminal = matches!(local.status, OrderStatus::Failed | OrderStatus::Reversed);
        if terminal || local.status == new_status {
            return Ok(ReconcileAction::Ignored);
        }

        let updated = self.cas_order(&local.id, |o| o.status = new_status)?;
        self.ledger
            .refresh_snapshot(&local.idempotency_key, ResultSnapshot::Order(updated));
        Ok(ReconcileAction::Applied)
    }

    /// Run one reconciliation pass
    ///
    /// Drains the adoption queue, resolves PENDING_DELETE tokens and
    /// INITIATED orders against the provider, pulls stale setup tokens up
    /// to the provider's state, garbage-collects expired setup tokens, and
    /// prunes the idempotency ledger.
    pub async fn run_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.drain_adoption_queue(&mut report);

        // Payment token reads that missed locally: adopt from the provider
        // if it holds a token under that id.
        let misses = self.adoption.drain_read_misses();
        let miss_results = join_all(misses.iter().map(|id| self.adopt_payment_token(id))).await;
        for result in miss_results {
            match result {
                Ok(ReconcileAction::Adopted) => report.adopted += 1,
                Ok(_) => {}
                Err(err) => report.errors.push(err),
            }
        }

        let pending = self
            .store
            .pending_delete_payment_tokens(self.config.sweep_grace);
        let delete_results = join_all(
            pending
                .iter()
                .map(|token| self.resolve_pending_delete(token)),
        )
        .await;
        for result in delete_results {
            self.tally(result, &mut report, |r| &mut r.deletes_resolved);
        }

        let initiated = self.store.initiated_orders(self.config.sweep_grace);
        let order_results = join_all(initiated.iter().map(|order| self.settle_order(order))).await;
        for result in order_results {
            self.tally(result, &mut report, |r| &mut r.orders_settled);
        }

        let stale = self.store.sweepable_setup_tokens(self.config.sweep_grace);
        let token_results =
            join_all(stale.iter().map(|token| self.refresh_setup_token(token))).await;
        for result in token_results {
            self.tally(result, &mut report, |r| &mut r.tokens_synchronized);
        }

        for token in self
            .store
            .expired_created_setup_tokens(self.config.setup_token_gc_grace)
        {
            match self.cas_setup_token(&token.id, |t| {
                t.status = SetupTokenStatus::Expired;
                t.deleted_at = Some(Utc::now());
            }) {
                Ok(_) => report.setup_tokens_expired += 1,
                Err(err) => report.errors.push(err),
            }
        }

        // Records whose snapshot entity is still in an unsettled state must
        // stay replayable.
        report.ledger_pruned = self.ledger.prune(|record| match &record.result_snapshot {
            Some(ResultSnapshot::Order(order)) => self
                .store
                .get_order(&order.id)
                .map(|o| o.status == OrderStatus::Initiated)
                .unwrap_or(true),
            Some(ResultSnapshot::PaymentToken(token)) => self
                .store
                .get_payment_token(&token.id)
                .map(|t| t.status == PaymentTokenStatus::PendingDelete)
                .unwrap_or(false),
            Some(ResultSnapshot::SetupToken(token)) => self
                .store
                .get_setup_token(&token.id)
                .map(|t| {
                    matches!(
                        t.status,
                        SetupTokenStatus::Created | SetupTokenStatus::Approved
                    )
                })
                .unwrap_or(false),
            Some(ResultSnapshot::Deleted(_)) | None => false,
        });

        tracing::info!(
            adopted = report.adopted,
            deletes = report.deletes_resolved,
            orders = report.orders_settled,
            escalations = report.escalations.len(),
            errors = report.errors.len(),
            "sweep complete"
        );
        report
    }

    fn tally(
        &self,
        result: Result<bool, VaultError>,
        report: &mut SweepReport,
        counter: impl FnOnce(&mut SweepReport) -> &mut usize,
    ) {
        match result {
            Ok(true) => *counter(report) += 1,
            Ok(false) => {}
            Err(err @ VaultError::PendingEscalation { .. }) => {
                tracing::warn!(error = %err, "pending entity escalated");
                report.escalations.push(err);
            }
            Err(err) => report.errors.push(err),
        }
    }

    fn drain_adoption_queue(&self, report: &mut SweepReport) {
        for orphan in self.adoption.drain() {
            let result = match &orphan {
                Orphan::SetupToken(remote) => self
                    .store
                    .insert_setup_token(setup_token_from_remote(remote))
                    .map(|_| ()),
                Orphan::PaymentToken(remote) => self
                    .store
                    .insert_payment_token(payment_token_from_remote(remote))
                    .map(|_| ()),
                Orphan::Order(order) => self.store.insert_order(order.clone()).map(|_| ()),
            };
            match result {
                Ok(()) | Err(VaultError::Duplicate { .. }) => report.adopted += 1,
                Err(err) => {
                    // Put it back for the next sweep.
                    report.errors.push(err);
                    self.adoption.enqueue(orphan);
                }
            }
        }
    }

    /// Finish an unconfirmed deletion; `Ok(true)` when resolved
    async fn resolve_pending_delete(&self, token: &PaymentToken) -> Result<bool, VaultError> {
        let result = with_retry(
            &self.config,
            "delete_payment_token",
            None,
            RetryPolicy::IdempotentDispatch,
            || self.provider.delete_payment_token(&token.id),
        )
        .await;

        match result {
            Ok(RemoteDeletion::Deleted) | Ok(RemoteDeletion::NotFound) => {
                self.cas_payment_token(&token.id, |t| t.deleted_at = Some(Utc::now()))?;
                Ok(true)
            }
            Err(err) => Err(self.escalate_if_overdue(
                "payment token",
                &token.id,
                token.updated_at,
                err,
            )),
        }
    }

    /// Settle an INITIATED order by charge status lookup; `Ok(true)` when
    /// the order reached a definite state
    async fn settle_order(&self, order: &Order) -> Result<bool, VaultError> {
        let result = with_retry(
            &self.config,
            "fetch_charge_status",
            Some(&order.idempotency_key),
            RetryPolicy::Fetch,
            || self.provider.fetch_charge_status(&order.idempotency_key),
        )
        .await;

        match result {
            Ok(Some(charge)) => {
                let status = map_charge_status(charge.status);
                let updated = self.cas_order(&order.id, |o| {
                    o.status = status;
                    o.provider_transaction_id = Some(charge.transaction_id.clone());
                })?;
                self.ledger
                    .refresh_snapshot(&order.idempotency_key, ResultSnapshot::Order(updated));
                Ok(true)
            }
            // The provider confirms the charge never landed. The failed
            // attempt frees the key for a fresh retry.
            Ok(None) => {
                self.cas_order(&order.id, |o| o.status = OrderStatus::Failed)?;
                self.ledger.complete_failed(&order.idempotency_key);
                Ok(true)
            }
            Err(err) => {
                Err(self.escalate_if_overdue("order", &order.id, order.updated_at, err))
            }
        }
    }

    /// Pull a stale local setup token up to the provider's state
    async fn refresh_setup_token(&self, token: &SetupToken) -> Result<bool, VaultError> {
        let remote = with_retry(
            &self.config,
            "fetch_setup_token",
            None,
            RetryPolicy::Fetch,
            || self.provider.fetch_setup_token(&token.id),
        )
        .await?;

        match remote {
            Some(remote) => {
                let status = map_setup_status(remote.status);
                if status == token.status {
                    return Ok(false);
                }
                self.cas_setup_token(&token.id, |t| t.status = status)?;
                Ok(true)
            }
            // Gone provider-side: expired there and already purged.
            None => {
                self.cas_setup_token(&token.id, |t| {
                    t.status = SetupTokenStatus::Expired;
                    t.deleted_at = Some(Utc::now());
                })?;
                Ok(true)
            }
        }
    }

    fn escalate_if_overdue(
        &self,
        entity: &str,
        id: &str,
        pending_since: chrono::DateTime<Utc>,
        err: VaultError,
    ) -> VaultError {
        let pending_secs = (Utc::now() - pending_since).num_seconds().max(0);
        if pending_secs as u64 >= self.config.max_pending_age.as_secs() {
            VaultError::PendingEscalation {
                entity: entity.to_string(),
                id: id.to_string(),
                pending_secs,
            }
        } else {
            err
        }
    }

    /// Converge one customer's payment tokens with the provider's list
    ///
    /// Remote-wins in both directions: provider-only tokens are adopted,
    /// status drift is corrected, and ACTIVE local rows the provider no
    /// longer holds are soft-deleted. PENDING_DELETE rows are left for the
    /// sweep's deletion path.
    pub async fn sync_customer_payment_tokens(
        &self,
        customer_id: &str,
    ) -> Result<SyncReport, VaultError> {
        let remote_tokens = with_retry(
            &self.config,
            "list_payment_tokens",
            None,
            RetryPolicy::Fetch,
            || self.provider.list_payment_tokens(customer_id),
        )
        .await?;

        let mut report = SyncReport::default();
        let local_tokens = self.store.payment_tokens_for_customer(customer_id);

        for remote in &remote_tokens {
            match local_tokens.iter().find(|l| l.id == remote.id) {
                None => {
                    match self
                        .store
                        .insert_payment_token(payment_token_from_remote(remote))
                    {
                        Ok(_) | Err(VaultError::Duplicate { .. }) => report.adopted += 1,
                        Err(err) => return Err(err),
                    }
                }
                Some(local) => {
                    let status = map_token_status(remote.status);
                    if local.status != status && local.status != PaymentTokenStatus::PendingDelete
                    {
                        self.cas_payment_token(&local.id, |t| t.status = status)?;
                        report.updated += 1;
                    }
                }
            }
        }

        for local in &local_tokens {
            let gone = !remote_tokens.iter().any(|r| r.id == local.id);
            if gone && local.status == PaymentTokenStatus::Active {
                self.cas_payment_token(&local.id, |t| t.deleted_at = Some(Utc::now()))?;
                report.removed += 1;
            }
        }

        tracing::info!(
            customer = %customer_id,
            adopted = report.adopted,
            updated = report.updated,
            removed = report.removed,
            "customer tokens synchronized"
        );
        Ok(report)
    }

    fn cas_setup_token(
        &self,
        id: &str,
        mutate: impl Fn(&mut SetupToken),
    ) -> Result<SetupToken, VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_setup_token(id)
                .ok_or_else(|| VaultError::not_found("setup token", id))?;
            match self
                .store
                .update_setup_token(id, current.local_version, &mutate)
            {
                Ok(updated) => return Ok(updated),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "setup token",
            id,
            "version contention exceeded retry limit",
        ))
    }

    fn cas_payment_token(
        &self,
        id: &str,
        mutate: impl Fn(&mut PaymentToken),
    ) -> Result<PaymentToken, VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_payment_token(id)
                .ok_or_else(|| VaultError::not_found("payment token", id))?;
            match self
                .store
                .update_payment_token(id, current.local_version, &mutate)
            {
                Ok(updated) => return Ok(updated),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "payment token",
            id,
            "version contention exceeded retry limit",
        ))
    }

    fn cas_order(&self, id: &str, mutate: impl Fn(&mut Order)) -> Result<Order, VaultError> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self
                .store
                .get_order(id)
                .ok_or_else(|| VaultError::not_found("order", id))?;
            match self.store.update_order(id, current.local_version, &mutate) {
                Ok(updated) => return Ok(updated),
                Err(VaultError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(VaultError::store(
            "order",
            id,
            "version contention exceeded retry limit",
        ))
    }
}
