//! Concurrent in-memory local store
//!
//! One table per entity, each a lock-free concurrent map. All mutations of
//! existing rows go through compare-and-swap on `local_version`: a writer
//! presents the version it read, and a mismatch means another writer got
//! there first and the caller must re-read.
//!
//! Inserts are atomic via the map's entry API, so a provider id can never
//! gain two rows even under concurrent creation.

use crate::types::{
    Customer, CustomerId, Order, OrderId, PaymentToken, PaymentTokenId, PaymentTokenStatus,
    SetupToken, SetupTokenId, SetupTokenStatus, VaultError,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// In-memory dual-persistence local side
///
/// Shared across orchestrators and the reconciler via `Arc`. A write
/// failure hook lets tests exercise the remote-succeeded/local-failed
/// partial failure path.
#[derive(Default)]
pub struct LocalStore {
    customers: DashMap<CustomerId, Customer>,
    setup_tokens: DashMap<SetupTokenId, SetupToken>,
    payment_tokens: DashMap<PaymentTokenId, PaymentToken>,
    orders: DashMap<OrderId, Order>,
    /// Idempotency key -> order id, for replay lookups
    orders_by_key: DashMap<String, OrderId>,
    /// Remaining inserts to fail, for partial-failure injection
    fail_inserts: AtomicU32,
    /// Remaining versioned updates to fail
    fail_updates: AtomicU32,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` inserts fail with a store error
    pub fn fail_next_inserts(&self, count: u32) {
        self.fail_inserts.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Make the next `count` versioned updates fail with a store error
    pub fn fail_next_updates(&self, count: u32) {
        self.fail_updates.store(count, Ordering::SeqCst);
    }

    fn take_injected_update_failure(&self) -> bool {
        self.fail_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // ---- customers ----

    /// Fetch the customer row, creating it on first reference
    pub fn ensure_customer(&self, customer_id: &str) -> Customer {
        self.customers
            .entry(customer_id.to_string())
            .or_insert_with(|| Customer {
                customer_id: customer_id.to_string(),
                created_at: Utc::now(),
            })
            .clone()
    }

    pub fn get_customer(&self, customer_id: &str) -> Option<Customer> {
        self.customers.get(customer_id).map(|c| c.clone())
    }

    // ---- setup tokens ----

    pub fn insert_setup_token(&self, token: SetupToken) -> Result<SetupToken, VaultError> {
        if self.take_injected_failure() {
            return Err(VaultError::store("setup token", &token.id, "write failed"));
        }
        let mut inserted = false;
        self.setup_tokens.entry(token.id.clone()).or_insert_with(|| {
            inserted = true;
            token.clone()
        });
        if inserted {
            Ok(token)
        } else {
            Err(VaultError::duplicate("setup token", &token.id))
        }
    }

    pub fn get_setup_token(&self, id: &str) -> Option<SetupToken> {
        self.setup_tokens.get(id).map(|t| t.clone())
    }

    /// Mutate a setup token under a version check
    ///
    /// The closure sees the row with `local_version` already verified equal
    /// to `expected_version`; on success the version is bumped and the
    /// updated row returned.
    pub fn update_setup_token(
        &self,
        id: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut SetupToken),
    ) -> Result<SetupToken, VaultError> {
        if self.take_injected_update_failure() {
            return Err(VaultError::store("setup token", id, "write failed"));
        }
        let mut row = self
            .setup_tokens
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("setup token", id))?;
        if row.local_version != expected_version {
            return Err(VaultError::version_conflict(
                "setup token",
                id,
                expected_version,
            ));
        }
        mutate(&mut row);
        row.local_version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    /// CREATED setup tokens past expiry (plus grace), due for garbage collection
    pub fn expired_created_setup_tokens(&self, gc_grace: Duration) -> Vec<SetupToken> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(gc_grace).unwrap_or_else(|_| ChronoDuration::zero());
        self.setup_tokens
            .iter()
            .filter(|row| {
                row.deleted_at.is_none()
                    && row.status == SetupTokenStatus::Created
                    && row.expires_at < cutoff
            })
            .map(|row| row.clone())
            .collect()
    }

    /// Non-terminal setup tokens old enough for the sweep to re-check remotely
    pub fn sweepable_setup_tokens(&self, grace: Duration) -> Vec<SetupToken> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
        self.setup_tokens
            .iter()
            .filter(|row| {
                row.deleted_at.is_none()
                    && matches!(
                        row.status,
                        SetupTokenStatus::Created | SetupTokenStatus::Approved
                    )
                    && row.updated_at < cutoff
            })
            .map(|row| row.clone())
            .collect()
    }

    // ---- payment tokens ----

    pub fn insert_payment_token(&self, token: PaymentToken) -> Result<PaymentToken, VaultError> {
        if self.take_injected_failure() {
            return Err(VaultError::store("payment token", &token.id, "write failed"));
        }
        let mut inserted = false;
        self.payment_tokens.entry(token.id.clone()).or_insert_with(|| {
            inserted = true;
            token.clone()
        });
        if inserted {
            Ok(token)
        } else {
            Err(VaultError::duplicate("payment token", &token.id))
        }
    }

    pub fn get_payment_token(&self, id: &str) -> Option<PaymentToken> {
        self.payment_tokens.get(id).map(|t| t.clone())
    }

    /// Mutate a payment token under a version check
    pub fn update_payment_token(
        &self,
        id: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut PaymentToken),
    ) -> Result<PaymentToken, VaultError> {
        if self.take_injected_update_failure() {
            return Err(VaultError::store("payment token", id, "write failed"));
        }
        let mut row = self
            .payment_tokens
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("payment token", id))?;
        if row.local_version != expected_version {
            return Err(VaultError::version_conflict(
                "payment token",
                id,
                expected_version,
            ));
        }
        mutate(&mut row);
        row.local_version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    /// All non-deleted payment tokens for a customer
    pub fn payment_tokens_for_customer(&self, customer_id: &str) -> Vec<PaymentToken> {
        let mut tokens: Vec<PaymentToken> = self
            .payment_tokens
            .iter()
            .filter(|row| row.deleted_at.is_none() && row.customer_id == customer_id)
            .map(|row| row.clone())
            .collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tokens
    }

    /// PENDING_DELETE tokens old enough for the sweep to resolve
    pub fn pending_delete_payment_tokens(&self, grace: Duration) -> Vec<PaymentToken> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
        self.payment_tokens
            .iter()
            .filter(|row| {
                row.deleted_at.is_none()
                    && row.status == PaymentTokenStatus::PendingDelete
                    && row.updated_at < cutoff
            })
            .map(|row| row.clone())
            .collect()
    }

    // ---- orders ----

    /// Insert an order, enforcing at most one non-failed order per
    /// idempotency key
    pub fn insert_order(&self, order: Order) -> Result<Order, VaultError> {
        if self.take_injected_failure() {
            return Err(VaultError::store("order", &order.id, "write failed"));
        }
        // The row lands before the index points at it, so a key lookup never
        // resolves to a missing order.
        self.orders.insert(order.id.clone(), order.clone());
        let mut claimed = false;
        {
            let mut slot = self
                .orders_by_key
                .entry(order.idempotency_key.clone())
                .or_insert_with(|| {
                    claimed = true;
                    order.id.clone()
                });
            if !claimed {
                let existing_id = slot.value().clone();
                let existing_live = self
                    .orders
                    .get(&existing_id)
                    .map(|o| o.status.is_live())
                    .unwrap_or(false);
                if existing_live {
                    self.orders.remove(&order.id);
                    return Err(VaultError::duplicate("order", &existing_id));
                }
                // The previous order under this key failed; replace the index.
                *slot.value_mut() = order.id.clone();
            }
        }
        Ok(order)
    }

    pub fn get_order(&self, id: &str) -> Option<Order> {
        self.orders.get(id).map(|o| o.clone())
    }

    pub fn find_order_by_transaction_id(&self, transaction_id: &str) -> Option<Order> {
        self.orders
            .iter()
            .find(|row| row.provider_transaction_id.as_deref() == Some(transaction_id))
            .map(|row| row.clone())
    }

    pub fn get_order_by_idempotency_key(&self, key: &str) -> Option<Order> {
        let id = self.orders_by_key.get(key)?;
        self.orders.get(id.value()).map(|o| o.clone())
    }

    /// Mutate an order under a version check
    pub fn update_order(
        &self,
        id: &str,
        expected_version: u64,
        mutate: impl FnOnce(&mut Order),
    ) -> Result<Order, VaultError> {
        if self.take_injected_update_failure() {
            return Err(VaultError::store("order", id, "write failed"));
        }
        let mut row = self
            .orders
            .get_mut(id)
            .ok_or_else(|| VaultError::not_found("order", id))?;
        if row.local_version != expected_version {
            return Err(VaultError::version_conflict("order", id, expected_version));
        }
        mutate(&mut row);
        row.local_version += 1;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    /// INITIATED orders old enough for the sweep to resolve via status fetch
    pub fn initiated_orders(&self, grace: Duration) -> Vec<Order> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::zero());
        self.orders
            .iter()
            .filter(|row| {
                row.status == crate::types::OrderStatus::Initiated && row.updated_at < cutoff
            })
            .map(|row| row.clone())
            .collect()
    }
}
