use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::JsonStore;

/// Per-profile message logs keep only this many recent entries.
const MESSAGE_LOG_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One message as persisted in a profile's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub contact_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub direction: Direction,
    pub timestamp: i64,
}

pub fn messages_key(profile_id: &str) -> String {
    format!("messages_{profile_id}")
}

/// Append to the profile's message log, trimming the oldest entries past the cap.
pub fn append_message(store: &Arc<JsonStore>, profile_id: &str, message: StoredMessage) {
    let key = messages_key(profile_id);
    let mut messages: Vec<StoredMessage> = store.get(&key);
    messages.push(message);
    if messages.len() > MESSAGE_LOG_CAP {
        let excess = messages.len() - MESSAGE_LOG_CAP;
        messages.drain(..excess);
    }
    store.set(&key, &messages);
}
