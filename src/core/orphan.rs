//! Orphan adoption queue
//!
//! When a remote side effect succeeds but the local write fails, the remote
//! entity is an orphan: it exists provider-side with no local row. The
//! orchestrators enqueue the full remote payload here, and the
//! reconciliation sweep drains the queue by retrying the local insert.

use crate::remote::{RemotePaymentToken, RemoteSetupToken};
use crate::types::Order;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// A remote entity awaiting local adoption
#[derive(Debug, Clone, PartialEq)]
pub enum Orphan {
    SetupToken(RemoteSetupToken),
    PaymentToken(RemotePaymentToken),
    /// Fully-built order whose local insert failed
    Order(Order),
}

/// FIFO queue of orphaned remote entities, plus the set of payment token
/// ids that missed a local read and should be checked against the provider
#[derive(Default)]
pub struct AdoptionQueue {
    pending: Mutex<VecDeque<Orphan>>,
    read_misses: Mutex<HashSet<String>>,
}

impl AdoptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, orphan: Orphan) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(orphan);
        }
    }

    /// Note a payment token id that was read but has no local row
    ///
    /// The read itself stays local-only; the sweep decides whether the
    /// provider holds a token worth adopting.
    pub fn note_read_miss(&self, token_id: &str) {
        if let Ok(mut misses) = self.read_misses.lock() {
            misses.insert(token_id.to_string());
        }
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<Orphan> {
        match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Take the noted read misses
    pub fn drain_read_misses(&self) -> Vec<String> {
        match self.read_misses.lock() {
            Ok(mut misses) => misses.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
