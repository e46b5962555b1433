//! Orchestration core: idempotency ledger, token lifecycle, payment
//! execution, and reconciliation.

pub mod ledger;
pub mod lifecycle;
pub mod orphan;
pub mod payment;
pub mod reconcile;
pub mod retry;

pub use ledger::{request_fingerprint, BeginOutcome, IdempotencyLedger};
pub use lifecycle::{DeleteAck, TokenLifecycle, TokenPage, TokenizationSource};
pub use orphan::{AdoptionQueue, Orphan};
pub use payment::PaymentExecutor;
pub use reconcile::{ReconcileAction, Reconciler, SweepReport, SyncReport};
pub use retry::RetryPolicy;
