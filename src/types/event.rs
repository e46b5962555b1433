//! Asynchronous provider notification events
//!
//! Webhook-equivalent events consumed by the reconciliation processor.
//! Signature verification happens upstream; by the time an event reaches
//! this crate its authenticity has been established.

use serde::{Deserialize, Serialize};

/// Entity kind referenced by a provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderEntityType {
    SetupToken,
    PaymentToken,
    Payment,
}

/// Asynchronous notification from the provider
///
/// Redelivery is expected; events are deduplicated by `event_id` before
/// application. `new_status` is the provider's vocabulary and is parsed
/// against the target entity's status set when the event is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub entity_type: ProviderEntityType,
    pub entity_id: String,
    pub new_status: String,
    pub event_id: String,
}

impl ProviderEvent {
    pub fn new(
        entity_type: ProviderEntityType,
        entity_id: impl Into<String>,
        new_status: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            new_status: new_status.into(),
            event_id: event_id.into(),
        }
    }
}
