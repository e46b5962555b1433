//! Remote provider boundary: the typed adapter trait, its normalized
//! outcome taxonomy, and an in-memory mock implementation.

pub mod mock;
pub mod provider;

pub use mock::{MockVaultProvider, Script};
pub use provider::{
    RemoteCharge, RemoteChargeStatus, RemoteDeletion, RemoteOutcome, RemotePaymentToken,
    RemoteSetupStatus, RemoteSetupToken, RemoteTokenStatus, TokenSource, VaultProvider,
};
