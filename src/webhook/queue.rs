use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::WebhookSubscription;
use crate::store::JsonStore;

const SUBSCRIPTIONS_KEY: &str = "webhooks";
const QUEUE_KEY: &str = "webhook_queue";

/// Header carrying the event name on every delivery.
pub const EVENT_HEADER: &str = "X-Courier-Event";
/// Header carrying the body signature when the subscription has a secret.
pub const SIGNATURE_HEADER: &str = "X-Hub-Signature";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: i64 = 2000;
const DELIVERY_TICK: Duration = Duration::from_secs(1);
const PERSIST_TICK: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One pending notification to one subscriber about one event occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTask {
    pub id: Uuid,
    pub profile_id: String,
    pub event: String,
    pub payload: Value,
    pub target_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub attempts: u32,
    pub next_attempt_ms: i64,
}

/// At-least-once webhook delivery with bounded retry.
///
/// The in-memory queue is the source of truth; a dirty flag plus a periodic
/// persistence pass keeps the on-disk copy in sync without rewriting it on
/// every mutation. Delivery passes are single-flight and process due tasks
/// sequentially so one slow subscriber bounds outbound concurrency to one.
pub struct WebhookQueue {
    store: Arc<JsonStore>,
    client: reqwest::Client,
    configs: DashMap<String, Vec<WebhookSubscription>>,
    queue: Mutex<Vec<DeliveryTask>>,
    dirty: AtomicBool,
    delivering: Mutex<()>,
}

impl WebhookQueue {
    /// Build the queue, reloading subscriptions and any in-flight tasks that
    /// survived a restart.
    pub fn new(store: Arc<JsonStore>) -> Arc<Self> {
        let configs: HashMap<String, Vec<WebhookSubscription>> = store.get(SUBSCRIPTIONS_KEY);
        let tasks: Vec<DeliveryTask> = store.get(QUEUE_KEY);
        if !tasks.is_empty() {
            info!("Reloaded {} pending webhook deliveries", tasks.len());
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Arc::new(WebhookQueue {
            store,
            client,
            configs: configs.into_iter().collect(),
            queue: Mutex::new(tasks),
            dirty: AtomicBool::new(false),
            delivering: Mutex::new(()),
        })
    }

    pub fn subscriptions(&self, profile_id: &str) -> Vec<WebhookSubscription> {
        self.configs.get(profile_id).map(|s| s.value().clone()).unwrap_or_default()
    }

    /// Register a subscriber endpoint. The only synchronous rejection in
    /// this component: a target that is not an absolute URL.
    pub async fn add_subscription(
        &self,
        profile_id: &str,
        subscription: WebhookSubscription,
    ) -> anyhow::Result<()> {
        Url::parse(&subscription.url)
            .map_err(|e| anyhow::anyhow!("invalid webhook url `{}`: {e}", subscription.url))?;
        self.configs
            .entry(profile_id.to_string())
            .or_default()
            .push(subscription);
        self.save_configs().await;
        Ok(())
    }

    pub async fn remove_subscription(&self, profile_id: &str, url: &str) {
        if let Some(mut subs) = self.configs.get_mut(profile_id) {
            subs.retain(|s| s.url != url);
        }
        self.save_configs().await;
    }

    async fn save_configs(&self) {
        let snapshot: HashMap<String, Vec<WebhookSubscription>> = self
            .configs
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        self.store.set(SUBSCRIPTIONS_KEY, &snapshot);
        // Config changes are rare; flush right away.
        self.store.flush(SUBSCRIPTIONS_KEY).await;
    }

    /// Enqueue one delivery per enabled subscription that wants `event`.
    /// Cheap no-op when nothing matches.
    pub async fn trigger(self: &Arc<Self>, profile_id: &str, event: &str, data: Value) {
        let matching: Vec<WebhookSubscription> = self
            .configs
            .get(profile_id)
            .map(|subs| subs.iter().filter(|s| s.wants(event)).cloned().collect())
            .unwrap_or_default();

        if matching.is_empty() {
            return;
        }

        let timestamp = Utc::now().to_rfc3339();
        let now = Utc::now().timestamp_millis();
        let payload = envelope(profile_id, event, &data, &timestamp);

        {
            let mut queue = self.queue.lock().await;
            for subscription in matching {
                queue.push(DeliveryTask {
                    id: Uuid::new_v4(),
                    profile_id: profile_id.to_string(),
                    event: event.to_string(),
                    payload: payload.clone(),
                    target_url: subscription.url.clone(),
                    secret: subscription.secret.clone(),
                    attempts: 0,
                    next_attempt_ms: now,
                });
            }
        }
        self.dirty.store(true, Ordering::SeqCst);

        // Nudge the loop so fresh tasks don't wait for the next tick.
        let me = self.clone();
        tokio::spawn(async move {
            me.deliver_due().await;
        });
    }

    /// One delivery pass. Re-entrancy guarded: overlapping calls return
    /// immediately instead of double-sending.
    pub async fn deliver_due(&self) {
        let Ok(_guard) = self.delivering.try_lock() else {
            return;
        };

        let now = Utc::now().timestamp_millis();
        let due: Vec<DeliveryTask> = {
            let queue = self.queue.lock().await;
            queue.iter().filter(|t| t.next_attempt_ms <= now).cloned().collect()
        };

        for task in due {
            match self.send(&task).await {
                Ok(()) => {
                    debug!("Delivered `{}` to {}", task.event, task.target_url);
                    self.queue.lock().await.retain(|t| t.id != task.id);
                    self.dirty.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    let mut queue = self.queue.lock().await;
                    if let Some(entry) = queue.iter_mut().find(|t| t.id == task.id) {
                        entry.attempts += 1;
                        if entry.attempts >= MAX_ATTEMPTS {
                            warn!(
                                "Dropping webhook `{}` for {} after {} attempts: {e}",
                                entry.event, entry.target_url, entry.attempts
                            );
                            let id = entry.id;
                            queue.retain(|t| t.id != id);
                        } else {
                            entry.next_attempt_ms = Utc::now().timestamp_millis()
                                + (1i64 << entry.attempts) * BACKOFF_BASE_MS;
                            debug!(
                                "Webhook `{}` to {} failed (attempt {}): {e}; retrying",
                                entry.event, entry.target_url, entry.attempts
                            );
                        }
                    }
                    self.dirty.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn build_request(&self, task: &DeliveryTask) -> anyhow::Result<reqwest::Request> {
        let body = serde_json::to_string(&task.payload)?;

        let mut builder = self
            .client
            .post(&task.target_url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, concat!("courier-webhook/", env!("CARGO_PKG_VERSION")))
            .header(EVENT_HEADER, &task.event);

        if let Some(secret) = &task.secret {
            builder = builder.header(SIGNATURE_HEADER, sign(secret, &body));
        }

        Ok(builder.body(body).build()?)
    }

    async fn send(&self, task: &DeliveryTask) -> anyhow::Result<()> {
        let request = self.build_request(task)?;
        let response = self.client.execute(request).await?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        Ok(())
    }

    /// Write the queue through the store when something changed.
    pub async fn persist_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.queue.lock().await.clone();
        self.store.set(QUEUE_KEY, &snapshot);
    }

    /// Spawn the 1s delivery tick and the 3s persistence tick.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let delivery = {
            let me = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(DELIVERY_TICK);
                loop {
                    tick.tick().await;
                    me.deliver_due().await;
                }
            })
        };
        let persistence = {
            let me = self.clone();
            tokio::spawn(async move {
                let mut tick = interval(PERSIST_TICK);
                loop {
                    tick.tick().await;
                    me.persist_if_dirty().await;
                }
            })
        };
        vec![delivery, persistence]
    }

    /// Snapshot of the pending tasks, oldest first.
    pub async fn pending(&self) -> Vec<DeliveryTask> {
        self.queue.lock().await.clone()
    }

    /// Flush queue state on shutdown regardless of the dirty flag.
    pub async fn persist_now(&self) {
        let snapshot = self.queue.lock().await.clone();
        self.store.set(QUEUE_KEY, &snapshot);
        self.store.flush(QUEUE_KEY).await;
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// Build the wire payload: `{ event, from, ...data, timestamp }`. A `from`
/// field inside `data` wins over the profile id, matching what subscribers
/// already rely on for message events.
fn envelope(profile_id: &str, event: &str, data: &Value, timestamp: &str) -> Value {
    let mut body = Map::new();
    body.insert("event".to_string(), Value::String(event.to_string()));
    body.insert("from".to_string(), Value::String(profile_id.to_string()));
    if let Value::Object(fields) = data {
        for (k, v) in fields {
            body.insert(k.clone(), v.clone());
        }
    } else if !data.is_null() {
        body.insert("data".to_string(), data.clone());
    }
    body.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
    Value::Object(body)
}

/// `sha256=<hex hmac-sha256(secret, body)>` over the exact raw body.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"").unwrap());
    mac.update(body.as_bytes());
    format!("sha256={:x}", mac.finalize().into_bytes())
}
