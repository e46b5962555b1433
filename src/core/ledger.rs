//! Idempotency ledger
//!
//! Records the outcome of every externally-effectful operation under its
//! caller-supplied key. A retry with the same key and the same request body
//! replays the recorded result; the same key with a different body is a
//! caller bug and is rejected.
//!
//! `begin` claims the key atomically through the map's entry API, so of two
//! concurrent callers presenting the same key exactly one proceeds and the
//! other observes the in-progress record.

use crate::types::{
    IdempotencyRecord, IdempotencyStatus, OperationKind, ResultSnapshot, VaultError,
};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// What the caller should do after claiming (or failing to claim) a key
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// The key is claimed; execute the operation and complete the record
    Proceed,
    /// A prior identical request already completed; return its result
    Replay(ResultSnapshot),
}

/// Hex SHA-256 digest over the canonical request parts
///
/// Parts are length-prefixed before hashing so distinct part lists can
/// never collide by concatenation.
pub fn request_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.len().to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Concurrent ledger of operation outcomes keyed by idempotency key
pub struct IdempotencyLedger {
    records: DashMap<String, IdempotencyRecord>,
    ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Claim `key` for an operation, or learn what happened to it already
    ///
    /// # Errors
    ///
    /// - [`VaultError::IdempotencyKeyReuse`] when the key exists with a
    ///   different operation kind or request fingerprint
    /// - [`VaultError::OperationInProgress`] when another caller holds the
    ///   key and has not completed yet
    pub fn begin(
        &self,
        key: &str,
        operation_kind: OperationKind,
        fingerprint: &str,
    ) -> Result<BeginOutcome, VaultError> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::hours(24));

        let mut claimed = false;
        let mut record = self.records.entry(key.to_string()).or_insert_with(|| {
            claimed = true;
            IdempotencyRecord {
                key: key.to_string(),
                operation_kind,
                request_fingerprint: fingerprint.to_string(),
                result_snapshot: None,
                status: IdempotencyStatus::InProgress,
                created_at: now,
                expires_at: now + ttl,
            }
        });
        if claimed {
            return Ok(BeginOutcome::Proceed);
        }

        if record.operation_kind != operation_kind || record.request_fingerprint != fingerprint {
            return Err(VaultError::key_reuse(key));
        }
        match record.status {
            IdempotencyStatus::InProgress => Err(VaultError::in_progress(key)),
            IdempotencyStatus::Done => match record.result_snapshot.clone() {
                Some(snapshot) => Ok(BeginOutcome::Replay(snapshot)),
                None => Err(VaultError::in_progress(key)),
            },
            IdempotencyStatus::Failed => {
                // A terminal failure does not burn the key; the retry
                // reclaims it for a fresh attempt.
                let record = record.value_mut();
                record.status = IdempotencyStatus::InProgress;
                record.result_snapshot = None;
                record.created_at = now;
                record.expires_at = now + ttl;
                Ok(BeginOutcome::Proceed)
            }
        }
    }

    /// Record a successful outcome for a claimed key
    pub fn complete_done(&self, key: &str, snapshot: ResultSnapshot) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.status = IdempotencyStatus::Done;
            record.result_snapshot = Some(snapshot);
        }
    }

    /// Record a terminal failure for a claimed key, freeing it for retry
    pub fn complete_failed(&self, key: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.status = IdempotencyStatus::Failed;
            record.result_snapshot = None;
        }
    }

    /// Overwrite the cached snapshot of a completed record
    ///
    /// Used when reconciliation settles an outcome that was recorded while
    /// still indeterminate.
    pub fn refresh_snapshot(&self, key: &str, snapshot: ResultSnapshot) {
        if let Some(mut record) = self.records.get_mut(key) {
            if record.status == IdempotencyStatus::Done {
                record.result_snapshot = Some(snapshot);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Drop expired records whose snapshots nothing references anymore
    ///
    /// Returns the number of records removed. In-progress records are never
    /// pruned regardless of age.
    pub fn prune(&self, is_referenced: impl Fn(&IdempotencyRecord) -> bool) -> usize {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            record.status == IdempotencyStatus::InProgress
                || record.expires_at > now
                || is_referenced(record)
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
