//! In-memory mock of the remote vault provider
//!
//! Stores all provider-side state in memory and supports scripting the
//! outcome of upcoming calls, so orchestrator and reconciliation behavior
//! under `Retryable`, `NonRetryable`, and `Unknown` outcomes can be tested
//! without a network.
//!
//! The mock honors the provider's idempotency contract: mutating calls are
//! keyed by the caller-supplied request id, and re-dispatching with the
//! same id returns the original result instead of duplicating the effect.

use super::provider::{
    RemoteCharge, RemoteChargeStatus, RemoteDeletion, RemoteOutcome, RemotePaymentToken,
    RemoteSetupStatus, RemoteSetupToken, RemoteTokenStatus, TokenSource, VaultProvider,
};
use crate::config::CaptureMode;
use crate::types::{Currency, InstrumentDescriptor, InstrumentSummary};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Scripted outcome for an upcoming provider call
#[derive(Debug, Clone)]
pub enum Script {
    /// Return `Retryable` without performing the operation
    Retryable(String),
    /// Return `NonRetryable` without performing the operation
    NonRetryable(String),
    /// Return `Unknown`; when `processed` is true the operation still
    /// lands provider-side, modeling a response lost after dispatch
    Unknown { processed: bool, reason: String },
}

/// In-memory mock provider
///
/// All state lives behind `RwLock`-protected maps; the mock is shared
/// across tasks via `Arc` exactly like a real client would be.
#[derive(Default)]
pub struct MockVaultProvider {
    setup_tokens: RwLock<HashMap<String, RemoteSetupToken>>,
    payment_tokens: RwLock<HashMap<String, RemotePaymentToken>>,
    /// Charges keyed by the dispatching request id
    charges: RwLock<HashMap<String, RemoteCharge>>,
    /// Request-id idempotency memory for token creation calls
    created_by_request: RwLock<HashMap<String, String>>,
    scripts: RwLock<HashMap<String, VecDeque<Script>>>,
    charge_dispatches: AtomicU32,
}

impl MockVaultProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted outcome for the named operation's next call
    pub async fn script_next(&self, operation: &str, script: Script) {
        self.scripts
            .write()
            .await
            .entry(operation.to_string())
            .or_default()
            .push_back(script);
    }

    async fn take_script(&self, operation: &str) -> Option<Script> {
        self.scripts
            .write()
            .await
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
    }

    /// Simulate payer approval of a setup token
    pub async fn approve_setup_token(&self, id: &str) -> bool {
        let mut tokens = self.setup_tokens.write().await;
        match tokens.get_mut(id) {
            Some(token) if token.status == RemoteSetupStatus::Created => {
                token.status = RemoteSetupStatus::Approved;
                true
            }
            _ => false,
        }
    }

    /// Simulate provider-initiated revocation of a payment token
    pub async fn revoke_payment_token(&self, id: &str) -> bool {
        let mut tokens = self.payment_tokens.write().await;
        match tokens.get_mut(id) {
            Some(token) => {
                token.status = RemoteTokenStatus::Revoked;
                true
            }
            None => false,
        }
    }

    /// Insert a provider-side token with no local counterpart
    ///
    /// Used to model drift the reconciler must adopt.
    pub async fn seed_payment_token(
        &self,
        customer_id: &str,
        summary: InstrumentSummary,
    ) -> String {
        let id = format!("pt_{}", Uuid::new_v4());
        self.payment_tokens.write().await.insert(
            id.clone(),
            RemotePaymentToken {
                id: id.clone(),
                customer_id: customer_id.to_string(),
                status: RemoteTokenStatus::Active,
                instrument_summary: summary,
            },
        );
        id
    }

    /// Number of charge operations actually executed provider-side
    pub fn charge_dispatches(&self) -> u32 {
        self.charge_dispatches.load(Ordering::SeqCst)
    }

    /// Number of payment tokens the provider currently holds
    pub async fn payment_token_count(&self) -> usize {
        self.payment_tokens.read().await.len()
    }

    fn declined(descriptor: &InstrumentDescriptor) -> bool {
        // Test convention: any card number ending in 0002 is declined.
        descriptor.number.ends_with("0002")
    }
}

#[async_trait]
impl VaultProvider for MockVaultProvider {
    async fn create_setup_token(
        &self,
        request_id: &str,
        customer_id: &str,
        descriptor: &InstrumentDescriptor,
    ) -> RemoteOutcome<RemoteSetupToken> {
        let script = self.take_script("create_setup_token").await;
        let process = match script {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { processed, reason }) => {
                if !processed {
                    return RemoteOutcome::Unknown { reason };
                }
                Some(reason)
            }
            None => None,
        };

        // Idempotent replay by request id
        if let Some(existing_id) = self.created_by_request.read().await.get(request_id) {
            if let Some(token) = self.setup_tokens.read().await.get(existing_id) {
                return RemoteOutcome::Success(token.clone());
            }
        }

        if Self::declined(descriptor) {
            return RemoteOutcome::NonRetryable {
                reason: "instrument declined".to_string(),
            };
        }

        let id = format!("st_{}", Uuid::new_v4());
        let token = RemoteSetupToken {
            id: id.clone(),
            customer_id: customer_id.to_string(),
            status: RemoteSetupStatus::Created,
            instrument_summary: descriptor.summary(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        };
        self.setup_tokens
            .write()
            .await
            .insert(id.clone(), token.clone());
        self.created_by_request
            .write()
            .await
            .insert(request_id.to_string(), id);

        match process {
            Some(reason) => RemoteOutcome::Unknown { reason },
            None => RemoteOutcome::Success(token),
        }
    }

    async fn fetch_setup_token(&self, id: &str) -> RemoteOutcome<Option<RemoteSetupToken>> {
        match self.take_script("fetch_setup_token").await {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { reason, .. }) => return RemoteOutcome::Unknown { reason },
            None => {}
        }
        RemoteOutcome::Success(self.setup_tokens.read().await.get(id).cloned())
    }

    async fn create_payment_token(
        &self,
        request_id: &str,
        source: TokenSource,
    ) -> RemoteOutcome<RemotePaymentToken> {
        let script = self.take_script("create_payment_token").await;
        let process = match script {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { processed, reason }) => {
                if !processed {
                    return RemoteOutcome::Unknown { reason };
                }
                Some(reason)
            }
            None => None,
        };

        if let Some(existing_id) = self.created_by_request.read().await.get(request_id) {
            if let Some(token) = self.payment_tokens.read().await.get(existing_id) {
                return RemoteOutcome::Success(token.clone());
            }
        }

        let (customer_id, summary) = match source {
            TokenSource::SetupToken(setup_id) => {
                let mut setup_tokens = self.setup_tokens.write().await;
                let setup = match setup_tokens.get_mut(&setup_id) {
                    Some(setup) => setup,
                    None => {
                        return RemoteOutcome::NonRetryable {
                            reason: format!("setup token {} not found", setup_id),
                        }
                    }
                };
                match setup.status {
                    RemoteSetupStatus::Approved => {
                        // Single-use: the provider consumes the setup token.
                        setup.status = RemoteSetupStatus::Consumed;
                        (setup.customer_id.clone(), setup.instrument_summary.clone())
                    }
                    status => {
                        return RemoteOutcome::NonRetryable {
                            reason: format!("setup token {} is {:?}", setup_id, status),
                        }
                    }
                }
            }
            TokenSource::Instrument {
                customer_id,
                descriptor,
            } => {
                if Self::declined(&descriptor) {
                    return RemoteOutcome::NonRetryable {
                        reason: "instrument declined".to_string(),
                    };
                }
                (customer_id, descriptor.summary())
            }
        };

        let id = format!("pt_{}", Uuid::new_v4());
        let token = RemotePaymentToken {
            id: id.clone(),
            customer_id,
            status: RemoteTokenStatus::Active,
            instrument_summary: summary,
        };
        self.payment_tokens
            .write()
            .await
            .insert(id.clone(), token.clone());
        self.created_by_request
            .write()
            .await
            .insert(request_id.to_string(), id);

        match process {
            Some(reason) => RemoteOutcome::Unknown { reason },
            None => RemoteOutcome::Success(token),
        }
    }

    async fn fetch_payment_token(&self, id: &str) -> RemoteOutcome<Option<RemotePaymentToken>> {
        match self.take_script("fetch_payment_token").await {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { reason, .. }) => return RemoteOutcome::Unknown { reason },
            None => {}
        }
        RemoteOutcome::Success(self.payment_tokens.read().await.get(id).cloned())
    }

    async fn list_payment_tokens(
        &self,
        customer_id: &str,
    ) -> RemoteOutcome<Vec<RemotePaymentToken>> {
        match self.take_script("list_payment_tokens").await {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { reason, .. }) => return RemoteOutcome::Unknown { reason },
            None => {}
        }
        let tokens = self
            .payment_tokens
            .read()
            .await
            .values()
            .filter(|token| token.customer_id == customer_id)
            .cloned()
            .collect();
        RemoteOutcome::Success(tokens)
    }

    async fn delete_payment_token(&self, id: &str) -> RemoteOutcome<RemoteDeletion> {
        let script = self.take_script("delete_payment_token").await;
        let process = match script {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { processed, reason }) => {
                if !processed {
                    return RemoteOutcome::Unknown { reason };
                }
                Some(reason)
            }
            None => None,
        };

        let removed = self.payment_tokens.write().await.remove(id).is_some();
        let result = if removed {
            RemoteDeletion::Deleted
        } else {
            RemoteDeletion::NotFound
        };
        match process {
            Some(reason) => RemoteOutcome::Unknown { reason },
            None => RemoteOutcome::Success(result),
        }
    }

    async fn charge(
        &self,
        request_id: &str,
        token_id: &str,
        amount: Decimal,
        _currency: Currency,
        capture: CaptureMode,
    ) -> RemoteOutcome<RemoteCharge> {
        let script = self.take_script("charge").await;
        let process = match script {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { processed, reason }) => {
                if !processed {
                    return RemoteOutcome::Unknown { reason };
                }
                Some(reason)
            }
            None => None,
        };

        // Idempotent replay by request id: no second dispatch.
        if let Some(existing) = self.charges.read().await.get(request_id) {
            return RemoteOutcome::Success(existing.clone());
        }

        match self.payment_tokens.read().await.get(token_id) {
            Some(token) if token.status == RemoteTokenStatus::Active => {}
            Some(_) => {
                return RemoteOutcome::NonRetryable {
                    reason: format!("payment token {} is revoked", token_id),
                }
            }
            None => {
                return RemoteOutcome::NonRetryable {
                    reason: format!("payment token {} not found", token_id),
                }
            }
        }

        if amount > Decimal::new(100_000, 0) {
            return RemoteOutcome::NonRetryable {
                reason: "amount exceeds provider limit".to_string(),
            };
        }

        self.charge_dispatches.fetch_add(1, Ordering::SeqCst);
        let charge = RemoteCharge {
            transaction_id: format!("txn_{}", Uuid::new_v4()),
            status: match capture {
                CaptureMode::Automatic => RemoteChargeStatus::Captured,
                CaptureMode::Manual => RemoteChargeStatus::Authorized,
            },
        };
        self.charges
            .write()
            .await
            .insert(request_id.to_string(), charge.clone());

        match process {
            Some(reason) => RemoteOutcome::Unknown { reason },
            None => RemoteOutcome::Success(charge),
        }
    }

    async fn fetch_charge_status(&self, request_id: &str) -> RemoteOutcome<Option<RemoteCharge>> {
        match self.take_script("fetch_charge_status").await {
            Some(Script::Retryable(reason)) => return RemoteOutcome::Retryable { reason },
            Some(Script::NonRetryable(reason)) => return RemoteOutcome::NonRetryable { reason },
            Some(Script::Unknown { reason, .. }) => return RemoteOutcome::Unknown { reason },
            None => {}
        }
        RemoteOutcome::Success(self.charges.read().await.get(request_id).cloned())
    }
}
