//! Signaling message kinds and the wire envelope.
//!
//! Every outbound message carries the session id, sender and recipient
//! identities, and a kind discriminator. The payload enum is internally
//! tagged so the JSON form matches the logical message table:
//! `call-offer`, `call-answer`, `ice-candidate`, `call-end`,
//! `call-reject`, `toggle-notify`.

use crate::connection::{IceCandidate, SessionDescription};
use crate::types::{MediaAspect, MediaKind, PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling message kinds used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Initial call offer, caller to callee. Creates the callee session.
    Offer,
    /// Answer to an offer, callee to caller.
    Answer,
    /// One reachability candidate, either direction, any time after the
    /// offer exists on the sending side.
    IceCandidate,
    /// Call ended, either direction, any state.
    End,
    /// Incoming call declined without an answer ever being created.
    Reject,
    /// Best-effort mute/video-enable notification; never affects state.
    ToggleNotify,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
        Self::End,
        Self::Reject,
        Self::ToggleNotify,
    ];

    /// The kind discriminator used on the wire.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "call-offer",
            Self::Answer => "call-answer",
            Self::IceCandidate => "ice-candidate",
            Self::End => "call-end",
            Self::Reject => "call-reject",
            Self::ToggleNotify => "toggle-notify",
        }
    }

    /// Parse from the wire discriminator.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "call-offer" => Some(Self::Offer),
            "call-answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            "call-end" => Some(Self::End),
            "call-reject" => Some(Self::Reject),
            "toggle-notify" => Some(Self::ToggleNotify),
            _ => None,
        }
    }

    /// Whether this kind drives the session state machine. Loss of a
    /// non-critical message never affects call state.
    pub const fn is_critical(&self) -> bool {
        !matches!(self, Self::IceCandidate | Self::ToggleNotify)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name())
    }
}

/// Kind-specific payload of a signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    CallOffer {
        media_kind: MediaKind,
        description: SessionDescription,
    },
    CallAnswer {
        description: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    CallEnd,
    CallReject,
    ToggleNotify {
        aspect: MediaAspect,
        enabled: bool,
    },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::CallOffer { .. } => SignalKind::Offer,
            Self::CallAnswer { .. } => SignalKind::Answer,
            Self::IceCandidate { .. } => SignalKind::IceCandidate,
            Self::CallEnd => SignalKind::End,
            Self::CallReject => SignalKind::Reject,
            Self::ToggleNotify { .. } => SignalKind::ToggleNotify,
        }
    }
}

/// One signaling message as relayed over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session_id: SessionId,
    pub sender: PeerId,
    pub recipient: PeerId,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn new(
        session_id: SessionId,
        sender: PeerId,
        recipient: PeerId,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id,
            sender,
            recipient,
            payload,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
