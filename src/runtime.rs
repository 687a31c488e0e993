// src/runtime.rs
//
// Composition root: build the store, queue, engine, router and connection
// manager, wire them together, and keep the background loops running.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::flow::FlowEngine;
use crate::profile::{load_profiles, save_profiles, seed_default};
use crate::router::{EventRouter, ObserverSink};
use crate::store::JsonStore;
use crate::transport::Transport;
use crate::webhook::WebhookQueue;

pub struct Runtime {
    pub store: Arc<JsonStore>,
    pub queue: Arc<WebhookQueue>,
    pub engine: Arc<FlowEngine>,
    pub manager: Arc<ConnectionManager>,
    pub router: Arc<EventRouter>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Wire everything up and bring every known profile online.
    pub async fn start(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ObserverSink>,
    ) -> Result<Runtime> {
        let store = JsonStore::open(&settings.data_dir)?;
        let profiles = seed_default(&store);

        let queue = WebhookQueue::new(store.clone());
        let manager = ConnectionManager::new(transport);
        let engine = FlowEngine::new(store.clone(), manager.clone());
        let router = EventRouter::new(store.clone(), queue.clone(), engine.clone(), sink);
        manager.subscribe(router.clone());

        let mut tasks = queue.spawn_loops();
        tasks.push(engine.spawn_sweep());

        for profile in &profiles {
            if let Err(e) = manager.start(&profile.id).await {
                error!("Could not start profile `{}`: {e}", profile.id);
            }
        }
        info!("courier is up with {} profile(s)", profiles.len());

        Ok(Runtime { store, queue, engine, manager, router, tasks })
    }

    /// Tear a profile down for good: cancel its timers and session, drop
    /// its persisted documents, and take it off the profile list.
    pub async fn delete_profile(&self, profile_id: &str) {
        self.manager.remove(profile_id).await;
        self.store.purge_profile(profile_id);
        let profiles: Vec<_> = load_profiles(&self.store)
            .into_iter()
            .filter(|p| p.id != profile_id)
            .collect();
        save_profiles(&self.store, &profiles);
        info!("Deleted profile `{profile_id}`");
    }

    /// Block until ctrl-c, then shut down cleanly.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        self.shutdown().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.queue.persist_now().await;
        self.store.flush_all().await;
        info!("State flushed; bye");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::TracingSink;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{LinkState, TransportEvent};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::sleep;

    #[tokio::test]
    async fn runtime_boots_seeds_and_connects_default_profile() {
        let dir = tempdir().unwrap();
        let settings = Settings::default().with_data_dir(dir.path());
        let transport = MemoryTransport::new();

        let runtime =
            Runtime::start(&settings, transport.clone(), Arc::new(TracingSink)).await.unwrap();

        assert_eq!(transport.open_count("default"), 1);
        assert_eq!(runtime.manager.state("default"), LinkState::Connecting);

        transport
            .emit(
                "default",
                TransportEvent::ConnectionChanged {
                    profile_id: "default".into(),
                    state: LinkState::Open,
                    error_code: None,
                },
            )
            .await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(runtime.manager.state("default"), LinkState::Open);

        runtime.shutdown().await;
        // Shutdown flushed the seeded profile list to disk.
        assert!(dir.path().join("profiles.json").exists());
    }

    #[tokio::test]
    async fn end_to_end_message_reaches_flow_and_webhook_queue() {
        let dir = tempdir().unwrap();
        let settings = Settings::default().with_data_dir(dir.path());
        let transport = MemoryTransport::new();
        let runtime =
            Runtime::start(&settings, transport.clone(), Arc::new(TracingSink)).await.unwrap();

        runtime.store.set(
            &crate::flow::flows_key("default"),
            &serde_json::json!({
                "flows": [{
                    "id": "f1", "name": "greet", "triggers": ["ping"],
                    "nodes": [
                        {"id": "n0", "type": "START", "nextId": "n1"},
                        {"id": "n1", "type": "END", "content": "pong"}
                    ]
                }]
            }),
        );

        transport
            .emit(
                "default",
                TransportEvent::ConnectionChanged {
                    profile_id: "default".into(),
                    state: LinkState::Open,
                    error_code: None,
                },
            )
            .await;
        sleep(Duration::from_millis(30)).await;

        transport
            .emit(
                "default",
                TransportEvent::MessageReceived {
                    profile_id: "default".into(),
                    contact_id: "c1".into(),
                    text: "ping".into(),
                    sender_name: Some("Ada".into()),
                    from_self: false,
                    group: false,
                    timestamp: 1,
                },
            )
            .await;
        sleep(Duration::from_millis(100)).await;

        let sent = transport.sent("default");
        assert!(
            sent.iter().any(|record| matches!(
                record,
                crate::transport::memory::OutboundRecord::Text { text, .. } if text == "pong"
            )),
            "flow reply went out through the live link"
        );

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn delete_profile_cancels_session_and_purges_data() {
        let dir = tempdir().unwrap();
        let settings = Settings::default().with_data_dir(dir.path());
        let transport = MemoryTransport::new();
        let runtime =
            Runtime::start(&settings, transport.clone(), Arc::new(TracingSink)).await.unwrap();

        runtime.store.set(
            &crate::flow::flows_key("default"),
            &serde_json::json!({"flows": []}),
        );
        runtime.store.flush(&crate::flow::flows_key("default")).await;

        runtime.delete_profile("default").await;

        assert_eq!(runtime.manager.state("default"), LinkState::Uninitialized);
        assert!(crate::profile::load_profiles(&runtime.store).is_empty());
        assert!(!dir.path().join("flows_default.json").exists());

        runtime.shutdown().await;
    }
}
