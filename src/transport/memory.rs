use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    LinkState, LinkingArtifact, Transport, TransportError, TransportEvent, TransportLink,
};

/// What a [`MemoryLink`] was asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRecord {
    Text { contact_id: String, text: String },
    Image { contact_id: String, url: String, caption: Option<String> },
}

/// In-process transport used by tests and the daemon's `--simulate` mode.
///
/// Links record outbound traffic instead of sending it anywhere, and tests
/// drive the event side by calling [`MemoryTransport::emit`]. With
/// `auto_connect` the transport plays out a pairing handshake on its own:
/// a linking code followed by an open connection.
pub struct MemoryTransport {
    auto_connect: bool,
    links: DashMap<String, Arc<MemoryLink>>,
    open_counts: DashMap<String, u32>,
    credential_clears: DashMap<String, u32>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryTransport {
            auto_connect: false,
            links: DashMap::new(),
            open_counts: DashMap::new(),
            credential_clears: DashMap::new(),
        })
    }

    /// A transport that connects by itself, for `--simulate`.
    pub fn auto() -> Arc<Self> {
        Arc::new(MemoryTransport {
            auto_connect: true,
            links: DashMap::new(),
            open_counts: DashMap::new(),
            credential_clears: DashMap::new(),
        })
    }

    /// Push an event into a profile's live link, as the real transport would.
    pub async fn emit(&self, profile_id: &str, event: TransportEvent) {
        if let Some(link) = self.links.get(profile_id).map(|l| l.value().clone()) {
            let _ = link.events.send(event).await;
        }
    }

    pub fn link(&self, profile_id: &str) -> Option<Arc<MemoryLink>> {
        self.links.get(profile_id).map(|l| l.value().clone())
    }

    /// Outbound records captured for a profile across its current link.
    pub fn sent(&self, profile_id: &str) -> Vec<OutboundRecord> {
        self.links
            .get(profile_id)
            .map(|l| l.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// How many links have been opened for a profile.
    pub fn open_count(&self, profile_id: &str) -> u32 {
        self.open_counts.get(profile_id).map(|c| *c).unwrap_or(0)
    }

    /// How many times credentials were discarded for a profile.
    pub fn credential_clear_count(&self, profile_id: &str) -> u32 {
        self.credential_clears.get(profile_id).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_link(
        &self,
        profile_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>, TransportError> {
        *self.open_counts.entry(profile_id.to_string()).or_insert(0) += 1;

        let link = Arc::new(MemoryLink {
            profile_id: profile_id.to_string(),
            events: events.clone(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            credential_saves: AtomicU32::new(0),
        });
        self.links.insert(profile_id.to_string(), link.clone());

        if self.auto_connect {
            let profile_id = profile_id.to_string();
            tokio::spawn(async move {
                let _ = events
                    .send(TransportEvent::LinkingArtifact {
                        profile_id: profile_id.clone(),
                        artifact: LinkingArtifact::Code { code: "SIM-CODE".to_string() },
                    })
                    .await;
                let _ = events
                    .send(TransportEvent::ConnectionChanged {
                        profile_id,
                        state: LinkState::Open,
                        error_code: None,
                    })
                    .await;
            });
        }

        Ok(link)
    }

    async fn clear_credentials(&self, profile_id: &str) -> Result<(), TransportError> {
        *self.credential_clears.entry(profile_id.to_string()).or_insert(0) += 1;
        debug!("Cleared credentials for `{profile_id}`");
        Ok(())
    }
}

pub struct MemoryLink {
    profile_id: String,
    events: mpsc::Sender<TransportEvent>,
    sent: Mutex<Vec<OutboundRecord>>,
    closed: AtomicBool,
    credential_saves: AtomicU32,
}

impl MemoryLink {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn credential_saves(&self) -> u32 {
        self.credential_saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send_text(&self, contact_id: &str, text: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected(self.profile_id.clone()));
        }
        self.sent.lock().unwrap().push(OutboundRecord::Text {
            contact_id: contact_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_image(
        &self,
        contact_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::NotConnected(self.profile_id.clone()));
        }
        self.sent.lock().unwrap().push(OutboundRecord::Image {
            contact_id: contact_id.to_string(),
            url: url.to_string(),
            caption: caption.map(str::to_string),
        });
        Ok(())
    }

    async fn request_linking_code(&self, phone_number: &str) -> Result<String, TransportError> {
        Ok(format!("LINK-{phone_number}"))
    }

    async fn sign_off(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_credentials(&self) -> Result<(), TransportError> {
        self.credential_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
