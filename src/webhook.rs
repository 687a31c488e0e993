// src/webhook.rs
//
// Outbound webhook notifications: subscription config plus the durable
// delivery queue that retries failed posts with exponential backoff.

pub mod queue;

use serde::{Deserialize, Serialize};

pub use queue::{DeliveryTask, WebhookQueue};

/// One subscriber endpoint for one profile. Plain configuration written by
/// the admin surface; the delivery path never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    pub url: String,
    pub events: Vec<String>,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl WebhookSubscription {
    pub fn wants(&self, event: &str) -> bool {
        self.enabled && self.events.iter().any(|e| e == event)
    }
}
