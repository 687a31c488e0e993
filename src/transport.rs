// src/transport.rs
//
// The seam between courier and the real-time messaging collaborator. The
// wire protocol lives entirely behind these traits; courier only sees the
// normalized `TransportEvent` envelope and the command surface below.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::profile::ProfileId;

/// Disconnect code the transport raises when the remote side revoked the
/// link. Everything else is treated as recoverable.
pub const LOGGED_OUT_CODE: u16 = 401;

/// Connection state of one profile's transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Uninitialized,
    Connecting,
    Open,
    Closed,
}

/// Credential artifact shown to a human to authorize a fresh link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LinkingArtifact {
    /// Scannable code, delivered as a data URL.
    Image { data_url: String },
    /// Short alphanumeric pairing code.
    Code { code: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Delivered,
    Read,
}

/// Normalized event envelope emitted by the transport for one profile.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionChanged {
        profile_id: ProfileId,
        state: LinkState,
        error_code: Option<u16>,
    },
    LinkingArtifact {
        profile_id: ProfileId,
        artifact: LinkingArtifact,
    },
    MessageReceived {
        profile_id: ProfileId,
        contact_id: String,
        text: String,
        sender_name: Option<String>,
        from_self: bool,
        group: bool,
        timestamp: i64,
    },
    MessageStatusChanged {
        profile_id: ProfileId,
        message_id: String,
        contact_id: String,
        status: MessageStatus,
    },
    /// The transport rotated credential material; its own persistence hook
    /// must run before any further event is processed.
    CredentialsChanged { profile_id: ProfileId },
}

impl TransportEvent {
    pub fn profile_id(&self) -> &str {
        match self {
            TransportEvent::ConnectionChanged { profile_id, .. }
            | TransportEvent::LinkingArtifact { profile_id, .. }
            | TransportEvent::MessageReceived { profile_id, .. }
            | TransportEvent::MessageStatusChanged { profile_id, .. }
            | TransportEvent::CredentialsChanged { profile_id } => profile_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("profile `{0}` is not connected")]
    NotConnected(String),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// One live link, exclusively owned by a profile's connection session.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send_text(&self, contact_id: &str, text: &str) -> Result<(), TransportError>;
    async fn send_image(
        &self,
        contact_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<(), TransportError>;
    /// Ask the transport for a pairing code tied to a phone number.
    async fn request_linking_code(&self, phone_number: &str) -> Result<String, TransportError>;
    /// Graceful sign-off; the remote side forgets the device.
    async fn sign_off(&self) -> Result<(), TransportError>;
    /// Tear the link down without ceremony.
    async fn close(&self) -> Result<(), TransportError>;
    /// Persist rotated credentials through the transport's own mechanism.
    async fn persist_credentials(&self) -> Result<(), TransportError>;
}

/// Factory for per-profile links.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link for `profile_id`. Events for this profile flow through
    /// `events` until the link dies.
    async fn open_link(
        &self,
        profile_id: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportLink>, TransportError>;

    /// Discard locally cached credentials so the next link starts a fresh
    /// pairing handshake.
    async fn clear_credentials(&self, profile_id: &str) -> Result<(), TransportError>;
}

/// Outbound send capability handed to the flow engine and the admin surface.
/// Implemented by the connection manager over whichever link is open.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, profile_id: &str, contact_id: &str, text: &str)
    -> anyhow::Result<()>;
    async fn send_image(
        &self,
        profile_id: &str,
        contact_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()>;
}
