use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::transport::{
    LOGGED_OUT_CODE, LinkState, LinkingArtifact, Outbound, Transport, TransportEvent,
    TransportLink,
};

/// A profile stuck in `connecting` this long gets its credentials discarded
/// and a fresh pairing attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Reconnect delay after a recoverable drop.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Restart delay after a terminal (logged-out) drop, quick so a new linking
/// artifact shows up promptly.
const RELINK_DELAY: Duration = Duration::from_secs(2);

const EVENT_BUFFER: usize = 64;

/// Gets every normalized event that survives lifecycle handling.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &TransportEvent);
}

/// Live state for one profile's link. The transport handle is exclusively
/// owned here; nothing else in the process may hold one for this profile.
struct ConnectionSession {
    state: LinkState,
    link: Option<Arc<dyn TransportLink>>,
    last_error: Option<String>,
    artifact: Option<LinkingArtifact>,
    pump: Option<JoinHandle<()>>,
    connect_timeout: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    fn cancel_timers(&mut self) {
        if let Some(t) = self.connect_timeout.take() {
            t.abort();
        }
    }
}

/// Owns one [`ConnectionSession`] per profile and drives all transitions.
///
/// Every profile's events are consumed by a dedicated pump task, strictly in
/// order, so no two handlers for the same profile ever overlap. Profiles are
/// fully independent of each other.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    sessions: DashMap<String, ConnectionSession>,
    /// Pending delayed restarts for profiles that currently have no session.
    restarts: DashMap<String, JoinHandle<()>>,
    subscribers: Mutex<Vec<Arc<dyn EventHandler>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(ConnectionManager {
            transport,
            sessions: DashMap::new(),
            restarts: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to normalized events. Handlers run in registration order.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.lock().unwrap().push(handler);
    }

    pub fn state(&self, profile_id: &str) -> LinkState {
        self.sessions
            .get(profile_id)
            .map(|s| s.state)
            .unwrap_or(LinkState::Uninitialized)
    }

    pub fn last_error(&self, profile_id: &str) -> Option<String> {
        self.sessions.get(profile_id).and_then(|s| s.last_error.clone())
    }

    /// The cached linking artifact, present only while `connecting`.
    pub fn linking_artifact(&self, profile_id: &str) -> Option<LinkingArtifact> {
        self.sessions.get(profile_id).and_then(|s| s.artifact.clone())
    }

    /// Bring a profile up. A no-op when a live session already exists, so
    /// calling this twice can never create a second transport handle.
    pub async fn start(self: &Arc<Self>, profile_id: &str) -> Result<()> {
        match self.sessions.entry(profile_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("start({profile_id}): session already live, ignoring");
                return Ok(());
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ConnectionSession {
                    state: LinkState::Connecting,
                    link: None,
                    last_error: None,
                    artifact: None,
                    pump: None,
                    connect_timeout: None,
                });
            }
        }
        if let Some((_, pending)) = self.restarts.remove(profile_id) {
            pending.abort();
        }

        info!("Connecting profile `{profile_id}`");
        self.arm_connect_timeout(profile_id);
        self.forward(&TransportEvent::ConnectionChanged {
            profile_id: profile_id.to_string(),
            state: LinkState::Connecting,
            error_code: None,
        })
        .await;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        match self.transport.open_link(profile_id, tx).await {
            Ok(link) => {
                let Some(mut session) = self.sessions.get_mut(profile_id) else {
                    // Removed while we were connecting; give the handle back.
                    let _ = link.close().await;
                    return Ok(());
                };
                session.link = Some(link);
                session.pump = Some(self.spawn_pump(profile_id, rx));
                Ok(())
            }
            Err(e) => {
                warn!("Connect failed for `{profile_id}`: {e}");
                self.remove_session(profile_id, true).await;
                self.schedule_restart(profile_id, RECONNECT_DELAY);
                Ok(())
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        profile_id: &str,
        mut rx: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let me = self.clone();
        let profile_id = profile_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !me.handle_event(event).await {
                    break;
                }
            }
            debug!("Event pump for `{profile_id}` ended");
        })
    }

    /// Lifecycle handling for one event. Returns `false` once the link is
    /// finished and the pump should stop.
    async fn handle_event(self: &Arc<Self>, event: TransportEvent) -> bool {
        match &event {
            TransportEvent::ConnectionChanged { profile_id, state, error_code } => {
                match state {
                    LinkState::Open => {
                        if let Some(mut session) = self.sessions.get_mut(profile_id) {
                            session.state = LinkState::Open;
                            session.last_error = None;
                            session.artifact = None;
                            session.cancel_timers();
                        }
                        info!("Profile `{profile_id}` is open");
                        self.forward(&event).await;
                        true
                    }
                    LinkState::Closed => {
                        let terminal = *error_code == Some(LOGGED_OUT_CODE);
                        if let Some(mut session) = self.sessions.get_mut(profile_id) {
                            session.state = LinkState::Closed;
                            session.last_error = error_code.map(|c| format!("disconnect ({c})"));
                            session.cancel_timers();
                        }
                        self.forward(&event).await;

                        if terminal {
                            info!("Profile `{profile_id}` was logged out; relinking");
                            let _ = self.transport.clear_credentials(profile_id).await;
                            self.remove_session(profile_id, false).await;
                            self.schedule_restart(profile_id, RELINK_DELAY);
                        } else {
                            info!(
                                "Profile `{profile_id}` dropped ({:?}); reconnecting in {}s",
                                error_code,
                                RECONNECT_DELAY.as_secs()
                            );
                            self.remove_session(profile_id, false).await;
                            self.schedule_restart(profile_id, RECONNECT_DELAY);
                        }
                        false
                    }
                    LinkState::Connecting | LinkState::Uninitialized => {
                        self.forward(&event).await;
                        true
                    }
                }
            }
            TransportEvent::LinkingArtifact { profile_id, artifact } => {
                // Artifacts only make sense during pairing; drop stragglers.
                let connecting = self
                    .sessions
                    .get(profile_id)
                    .map(|s| s.state == LinkState::Connecting)
                    .unwrap_or(false);
                if !connecting {
                    debug!("Ignoring linking artifact for non-connecting `{profile_id}`");
                    return true;
                }
                if let Some(mut session) = self.sessions.get_mut(profile_id) {
                    session.artifact = Some(artifact.clone());
                }
                self.forward(&event).await;
                true
            }
            TransportEvent::CredentialsChanged { profile_id } => {
                // Must run before any later event touches the link.
                let link = self.sessions.get(profile_id).and_then(|s| s.link.clone());
                if let Some(link) = link {
                    if let Err(e) = link.persist_credentials().await {
                        warn!("Could not persist credentials for `{profile_id}`: {e}");
                    }
                }
                true
            }
            TransportEvent::MessageReceived { .. } | TransportEvent::MessageStatusChanged { .. } => {
                self.forward(&event).await;
                true
            }
        }
    }

    /// Best-effort graceful sign-off, then terminal cleanup either way. The
    /// delayed restart produces a fresh linking artifact for the profile.
    pub async fn logout(self: &Arc<Self>, profile_id: &str) {
        let link = self.sessions.get(profile_id).and_then(|s| s.link.clone());
        if let Some(link) = link {
            if let Err(e) = link.sign_off().await {
                warn!("Graceful sign-off failed for `{profile_id}`: {e}");
            }
        }
        let _ = self.transport.clear_credentials(profile_id).await;
        self.remove_session(profile_id, true).await;
        self.forward(&TransportEvent::ConnectionChanged {
            profile_id: profile_id.to_string(),
            state: LinkState::Closed,
            error_code: None,
        })
        .await;
        self.schedule_restart(profile_id, RELINK_DELAY);
    }

    /// Force a brand-new pairing attempt right now, for when a human asks
    /// for a fresh linking artifact.
    pub async fn refresh(self: &Arc<Self>, profile_id: &str) {
        info!("Refreshing link for `{profile_id}`");
        self.remove_session(profile_id, true).await;
        let _ = self.transport.clear_credentials(profile_id).await;
        let _ = self.start(profile_id).await;
    }

    /// Profile deletion: cancel every pending timer and drop the session
    /// before returning. No restart is scheduled.
    pub async fn remove(&self, profile_id: &str) {
        if let Some((_, pending)) = self.restarts.remove(profile_id) {
            pending.abort();
        }
        self.remove_session(profile_id, true).await;
    }

    /// Ask the transport for a pairing code bound to a phone number.
    pub async fn request_linking_code(&self, profile_id: &str, phone_number: &str) -> Result<String> {
        let link = self
            .sessions
            .get(profile_id)
            .and_then(|s| s.link.clone())
            .ok_or_else(|| anyhow!("profile `{profile_id}` has no active link"))?;
        Ok(link.request_linking_code(phone_number).await?)
    }

    fn arm_connect_timeout(self: &Arc<Self>, profile_id: &str) {
        let me = self.clone();
        let profile = profile_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(CONNECT_TIMEOUT).await;
            let stuck = me
                .sessions
                .get(&profile)
                .map(|s| s.state == LinkState::Connecting)
                .unwrap_or(false);
            if !stuck {
                return;
            }
            warn!(
                "Profile `{profile}` stuck connecting for {}s; forcing a fresh link",
                CONNECT_TIMEOUT.as_secs()
            );
            // Detach our own handle so the teardown below can't abort us.
            if let Some(mut session) = me.sessions.get_mut(&profile) {
                session.connect_timeout = None;
            }
            let _ = me.transport.clear_credentials(&profile).await;
            me.remove_session(&profile, true).await;
            let _ = me.start(&profile).await;
        });

        match self.sessions.get_mut(profile_id) {
            Some(mut session) => {
                // Re-arming replaces (and cancels) any earlier timer.
                if let Some(old) = session.connect_timeout.replace(handle) {
                    old.abort();
                }
            }
            None => handle.abort(),
        }
    }

    fn schedule_restart(self: &Arc<Self>, profile_id: &str, delay: Duration) {
        let me = self.clone();
        let profile = profile_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            me.restarts.remove(&profile);
            if let Err(e) = me.start(&profile).await {
                warn!("Scheduled restart of `{profile}` failed: {e}");
            }
        });
        if let Some(old) = self.restarts.insert(profile_id.to_string(), handle) {
            old.abort();
        }
    }

    /// Tear a session down. `abort_pump` must be false when called from the
    /// pump itself, which ends on its own afterwards.
    async fn remove_session(&self, profile_id: &str, abort_pump: bool) {
        let Some((_, mut session)) = self.sessions.remove(profile_id) else {
            return;
        };
        session.cancel_timers();
        if abort_pump {
            if let Some(pump) = session.pump.take() {
                pump.abort();
            }
        }
        if let Some(link) = session.link.take() {
            if let Err(e) = link.close().await {
                debug!("Closing link for `{profile_id}`: {e}");
            }
        }
    }

    async fn forward(&self, event: &TransportEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let guard = self.subscribers.lock().unwrap();
            guard.clone()
        };
        for handler in handlers {
            handler.handle_event(event).await;
        }
    }
}

#[async_trait]
impl Outbound for ConnectionManager {
    async fn send_text(&self, profile_id: &str, contact_id: &str, text: &str) -> Result<()> {
        let link = match self.sessions.get(profile_id) {
            Some(s) if s.state == LinkState::Open => s.link.clone(),
            _ => None,
        }
        .ok_or_else(|| anyhow!("profile `{profile_id}` has no open connection"))?;
        // Send errors are reported upward; the connection stays open unless
        // the transport itself says otherwise.
        link.send_text(contact_id, text).await?;
        Ok(())
    }

    async fn send_image(
        &self,
        profile_id: &str,
        contact_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<()> {
        let link = match self.sessions.get(profile_id) {
            Some(s) if s.state == LinkState::Open => s.link.clone(),
            _ => None,
        }
        .ok_or_else(|| anyhow!("profile `{profile_id}` has no open connection"))?;
        link.send_image(contact_id, url, caption).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{Duration, advance, sleep};

    struct Probe {
        events: StdMutex<Vec<TransportEvent>>,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Probe { events: StdMutex::new(Vec::new()) })
        }

        fn states(&self) -> Vec<LinkState> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    TransportEvent::ConnectionChanged { state, .. } => Some(*state),
                    _ => None,
                })
                .collect()
        }

        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventHandler for Probe {
        async fn handle_event(&self, event: &TransportEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    async fn open_profile(
        manager: &Arc<ConnectionManager>,
        transport: &Arc<MemoryTransport>,
        profile: &str,
    ) {
        manager.start(profile).await.unwrap();
        transport
            .emit(
                profile,
                TransportEvent::ConnectionChanged {
                    profile_id: profile.to_string(),
                    state: LinkState::Open,
                    error_code: None,
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        manager.start("p1").await.unwrap();
        manager.start("p1").await.unwrap();

        assert_eq!(transport.open_count("p1"), 1);
        assert_eq!(manager.state("p1"), LinkState::Connecting);
    }

    #[tokio::test]
    async fn open_event_clears_artifact_and_reports_open() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());
        let probe = Probe::new();
        manager.subscribe(probe.clone());

        manager.start("p1").await.unwrap();
        transport
            .emit(
                "p1",
                TransportEvent::LinkingArtifact {
                    profile_id: "p1".into(),
                    artifact: LinkingArtifact::Code { code: "ABCD".into() },
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;
        assert!(manager.linking_artifact("p1").is_some());

        transport
            .emit(
                "p1",
                TransportEvent::ConnectionChanged {
                    profile_id: "p1".into(),
                    state: LinkState::Open,
                    error_code: None,
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.state("p1"), LinkState::Open);
        assert!(manager.linking_artifact("p1").is_none());
        assert_eq!(
            probe.states(),
            vec![LinkState::Connecting, LinkState::Open]
        );
    }

    #[tokio::test]
    async fn artifact_outside_connecting_is_dropped() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());
        let probe = Probe::new();
        manager.subscribe(probe.clone());

        open_profile(&manager, &transport, "p1").await;
        let before = probe.count();

        transport
            .emit(
                "p1",
                TransportEvent::LinkingArtifact {
                    profile_id: "p1".into(),
                    artifact: LinkingArtifact::Code { code: "LATE".into() },
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(probe.count(), before);
        assert!(manager.linking_artifact("p1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_connecting_forces_fresh_link_after_timeout() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        manager.start("p1").await.unwrap();
        assert_eq!(transport.open_count("p1"), 1);

        // Past the 30s connect timeout: credentials dropped, new attempt.
        advance(CONNECT_TIMEOUT + Duration::from_secs(1)).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.credential_clear_count("p1"), 1);
        assert_eq!(transport.open_count("p1"), 2);
        assert_eq!(manager.state("p1"), LinkState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_drop_reconnects_keeping_credentials() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        transport
            .emit(
                "p1",
                TransportEvent::ConnectionChanged {
                    profile_id: "p1".into(),
                    state: LinkState::Closed,
                    error_code: Some(500),
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state("p1"), LinkState::Uninitialized);

        advance(RECONNECT_DELAY + Duration::from_secs(1)).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.credential_clear_count("p1"), 0);
        assert_eq!(transport.open_count("p1"), 2);
        assert_eq!(manager.state("p1"), LinkState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_drop_discards_credentials_and_relinks() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        transport
            .emit(
                "p1",
                TransportEvent::ConnectionChanged {
                    profile_id: "p1".into(),
                    state: LinkState::Closed,
                    error_code: Some(LOGGED_OUT_CODE),
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.credential_clear_count("p1"), 1);

        advance(RELINK_DELAY + Duration::from_secs(1)).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.open_count("p1"), 2);
        assert_eq!(manager.state("p1"), LinkState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_pending_reconnect() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        transport
            .emit(
                "p1",
                TransportEvent::ConnectionChanged {
                    profile_id: "p1".into(),
                    state: LinkState::Closed,
                    error_code: Some(500),
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        manager.remove("p1").await;

        advance(RECONNECT_DELAY + Duration::from_secs(5)).await;
        sleep(Duration::from_millis(50)).await;

        // The pending reconnect died with the profile.
        assert_eq!(transport.open_count("p1"), 1);
        assert_eq!(manager.state("p1"), LinkState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_signs_off_and_schedules_relink() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        let link = transport.link("p1").unwrap();

        manager.logout("p1").await;
        assert!(link.is_closed());
        assert_eq!(transport.credential_clear_count("p1"), 1);

        advance(RELINK_DELAY + Duration::from_secs(1)).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.open_count("p1"), 2);
    }

    #[tokio::test]
    async fn refresh_discards_and_restarts_immediately() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        manager.refresh("p1").await;

        assert_eq!(transport.credential_clear_count("p1"), 1);
        assert_eq!(transport.open_count("p1"), 2);
        assert_eq!(manager.state("p1"), LinkState::Connecting);
    }

    #[tokio::test]
    async fn send_requires_an_open_connection() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        let err = manager.send_text("p1", "c1", "hello").await.unwrap_err();
        assert!(err.to_string().contains("no open connection"));

        manager.start("p1").await.unwrap();
        // Still connecting, still refused.
        assert!(manager.send_text("p1", "c1", "hello").await.is_err());

        transport
            .emit(
                "p1",
                TransportEvent::ConnectionChanged {
                    profile_id: "p1".into(),
                    state: LinkState::Open,
                    error_code: None,
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        manager.send_text("p1", "c1", "hello").await.unwrap();
        assert_eq!(transport.sent("p1").len(), 1);
    }

    #[tokio::test]
    async fn credentials_changed_invokes_link_persistence() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());

        open_profile(&manager, &transport, "p1").await;
        transport
            .emit("p1", TransportEvent::CredentialsChanged { profile_id: "p1".into() })
            .await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.link("p1").unwrap().credential_saves(), 1);
    }

    #[tokio::test]
    async fn message_events_are_forwarded_untouched() {
        let transport = MemoryTransport::new();
        let manager = ConnectionManager::new(transport.clone());
        let probe = Probe::new();
        manager.subscribe(probe.clone());

        open_profile(&manager, &transport, "p1").await;
        transport
            .emit(
                "p1",
                TransportEvent::MessageReceived {
                    profile_id: "p1".into(),
                    contact_id: "c1".into(),
                    text: "hi".into(),
                    sender_name: Some("Ada".into()),
                    from_self: false,
                    group: false,
                    timestamp: 1,
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;

        let events = probe.events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::MessageReceived { contact_id, .. } if contact_id == "c1"
        )));
    }
}
