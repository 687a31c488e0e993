// src/router.rs
//
// The single place where a normalized transport event becomes side effects:
// persistence, flow dispatch, webhook triggers and observer notifications.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::connection::EventHandler;
use crate::flow::FlowEngine;
use crate::message::{Direction, StoredMessage, append_message};
use crate::profile::bump_unread;
use crate::store::JsonStore;
use crate::transport::{MessageStatus, TransportEvent};
use crate::webhook::WebhookQueue;

/// Receives a copy of everything user-visible, e.g. a dashboard fan-out.
/// The real implementation lives outside this crate.
pub trait ObserverSink: Send + Sync {
    fn notify(&self, profile_id: &str, event: &str, payload: &Value);
}

/// Default sink: just trace what would have been broadcast.
pub struct TracingSink;

impl ObserverSink for TracingSink {
    fn notify(&self, profile_id: &str, event: &str, payload: &Value) {
        debug!("observer `{event}` for {profile_id}: {payload}");
    }
}

pub fn contacts_key(profile_id: &str) -> String {
    format!("contacts_{profile_id}")
}

pub fn status_key(profile_id: &str) -> String {
    format!("status_{profile_id}")
}

/// Fans one event to all interested consumers, exactly once per occurrence.
pub struct EventRouter {
    store: Arc<JsonStore>,
    queue: Arc<WebhookQueue>,
    engine: Arc<FlowEngine>,
    sink: Arc<dyn ObserverSink>,
}

impl EventRouter {
    pub fn new(
        store: Arc<JsonStore>,
        queue: Arc<WebhookQueue>,
        engine: Arc<FlowEngine>,
        sink: Arc<dyn ObserverSink>,
    ) -> Arc<Self> {
        Arc::new(EventRouter { store, queue, engine, sink })
    }

    async fn on_message(
        &self,
        profile_id: &str,
        contact_id: &str,
        text: &str,
        sender_name: Option<&str>,
        from_self: bool,
        group: bool,
        timestamp: i64,
    ) {
        let message_id = Uuid::new_v4().to_string();
        append_message(
            &self.store,
            profile_id,
            StoredMessage {
                id: message_id.clone(),
                contact_id: contact_id.to_string(),
                text: text.to_string(),
                sender_name: sender_name.map(str::to_string),
                direction: if from_self { Direction::Outbound } else { Direction::Inbound },
                timestamp,
            },
        );

        if from_self {
            // Our own messages are persisted for history but trigger nothing.
            return;
        }

        if let Some(name) = sender_name {
            self.record_contact_name(profile_id, contact_id, name);
        }
        bump_unread(&self.store, profile_id);

        if !group {
            self.engine.handle_message(profile_id, contact_id, text).await;
        }

        let payload = json!({
            "messageId": message_id,
            "from": contact_id,
            "message": text,
            "pushName": sender_name,
        });
        self.queue.trigger(profile_id, "message_received", payload.clone()).await;
        self.sink.notify(profile_id, "message_received", &payload);
    }

    /// Remember a sender's display name the first time we see it.
    fn record_contact_name(&self, profile_id: &str, contact_id: &str, name: &str) {
        let key = contacts_key(profile_id);
        let mut contacts: HashMap<String, String> = self.store.get(&key);
        if contacts.contains_key(contact_id) {
            return;
        }
        contacts.insert(contact_id.to_string(), name.to_string());
        self.store.set(&key, &contacts);
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle_event(&self, event: &TransportEvent) {
        match event {
            TransportEvent::MessageReceived {
                profile_id,
                contact_id,
                text,
                sender_name,
                from_self,
                group,
                timestamp,
            } => {
                self.on_message(
                    profile_id,
                    contact_id,
                    text,
                    sender_name.as_deref(),
                    *from_self,
                    *group,
                    *timestamp,
                )
                .await;
            }
            TransportEvent::ConnectionChanged { profile_id, state, error_code } => {
                let payload = json!({ "state": state, "errorCode": error_code });
                self.store.set(&status_key(profile_id), &payload);
                match state {
                    crate::transport::LinkState::Open => {
                        self.queue
                            .trigger(profile_id, "session_opened", json!({"status": "open"}))
                            .await;
                    }
                    crate::transport::LinkState::Closed => {
                        self.queue
                            .trigger(
                                profile_id,
                                "session_closed",
                                json!({"reason": error_code.map(|c| c.to_string())}),
                            )
                            .await;
                    }
                    _ => {}
                }
                self.sink.notify(profile_id, "connection_changed", &payload);
            }
            TransportEvent::LinkingArtifact { profile_id, artifact } => {
                let payload = serde_json::to_value(artifact).unwrap_or(Value::Null);
                self.sink.notify(profile_id, "linking_artifact", &payload);
            }
            TransportEvent::MessageStatusChanged { profile_id, message_id, contact_id, status } => {
                let (event_name, status_str) = match status {
                    MessageStatus::Delivered => ("message_delivered", "delivered"),
                    MessageStatus::Read => ("message_read", "read"),
                };
                let payload = json!({
                    "messageId": message_id,
                    "to": contact_id,
                    "status": status_str,
                });
                self.queue.trigger(profile_id, event_name, payload.clone()).await;
                self.sink.notify(profile_id, event_name, &payload);
            }
            TransportEvent::CredentialsChanged { .. } => {
                // Handled by the lifecycle manager before it reaches us.
            }
        }
    }
}
