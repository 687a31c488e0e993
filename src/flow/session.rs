use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::JsonStore;

/// Conversations untouched for longer than this are expired.
pub const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub node_id: String,
    pub text: String,
}

/// One contact's progress pointer through a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub contact_id: String,
    pub active_flow_id: String,
    pub current_node_id: String,
    /// Ordered so the most recent answer is always the tail.
    #[serde(default)]
    pub answers: Vec<AnswerRecord>,
    /// Epoch milliseconds of the last inbound message.
    pub last_activity: i64,
}

impl ConversationSession {
    /// Record an answer for a node. Re-answering replaces the old entry but
    /// moves it to the tail, since "most recent" is what CONDITION reads.
    pub fn record_answer(&mut self, node_id: &str, text: &str) {
        self.answers.retain(|a| a.node_id != node_id);
        self.answers.push(AnswerRecord {
            node_id: node_id.to_string(),
            text: text.to_string(),
        });
    }

    pub fn last_answer(&self) -> Option<&str> {
        self.answers.last().map(|a| a.text.as_str())
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        now_ms - self.last_activity > SESSION_TTL_MS
    }
}

pub fn sessions_key(profile_id: &str) -> String {
    format!("sessions_{profile_id}")
}

/// Typed access to the per-profile session maps in the store. Sessions live
/// in the store rather than volatile memory so a restart resumes them.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<JsonStore>,
}

impl SessionStore {
    pub fn new(store: Arc<JsonStore>) -> Self {
        SessionStore { store }
    }

    pub fn load(&self, profile_id: &str) -> HashMap<String, ConversationSession> {
        self.store.get(&sessions_key(profile_id))
    }

    pub fn get(&self, profile_id: &str, contact_id: &str) -> Option<ConversationSession> {
        self.load(profile_id).get(contact_id).cloned()
    }

    pub fn put(&self, profile_id: &str, session: ConversationSession) {
        let mut sessions = self.load(profile_id);
        sessions.insert(session.contact_id.clone(), session);
        self.store.set(&sessions_key(profile_id), &sessions);
    }

    pub fn remove(&self, profile_id: &str, contact_id: &str) {
        let mut sessions = self.load(profile_id);
        if sessions.remove(contact_id).is_some() {
            self.store.set(&sessions_key(profile_id), &sessions);
        }
    }
}
