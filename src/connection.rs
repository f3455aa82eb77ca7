//! Peer connection seam: negotiation artifacts, state, and events.
//!
//! One peer connection exists per call session, created before any
//! signaling message is sent or processed, and never reused. All
//! connection callbacks are funneled into [`ConnectionSignal`] values on a
//! single channel so the controller's transition function stays the only
//! place state changes happen.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("connection closed")]
    Closed,

    #[error("connection backend error: {0}")]
    Backend(String),
}

/// Whether a description is the opening offer or the answer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DescriptionType {
    Offer,
    Answer,
}

/// A connection description (SDP) exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A piece of network-reachability information (RFC 5245 style).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate string, e.g.
    /// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    /// SDP media stream identification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// Transport state of the peer connection.
///
/// `Connected` raised by the connection is the single source of truth for
/// "call is live"; the controller never infers it from signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// An event raised by a peer connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// A local reachability candidate became available and should be
    /// relayed to the peer.
    LocalCandidate(IceCandidate),
    /// Inbound remote media arrived.
    RemoteTrack(RemoteTrack),
}

/// A connection event tagged with its session.
#[derive(Debug, Clone)]
pub struct ConnectionSignal {
    pub session_id: SessionId,
    pub event: ConnectionEvent,
}

/// Per-call negotiation and transport object.
///
/// Local tracks must be registered before a description is created so the
/// offer/answer reflects what this side intends to send. `create_offer`
/// and `create_answer` also set the local description. `close` is
/// idempotent.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), ConnectionError>;

    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    async fn close(&self);
}

/// Creates one peer connection per session, wired to the controller's
/// event channel.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        session_id: SessionId,
        events: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> Result<Arc<dyn PeerConnection>, ConnectionError>;
}
