//! Core identity and session types shared across the crate.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a call participant on the signaling transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque identifier for one call attempt.
///
/// Generated locally by the initiator. Uniqueness is only required within
/// the pair of participants for the session's lifetime, so a
/// timestamp-derived token with a random tail is sufficient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh session id from the current time plus random bits.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let tail: u32 = rand::rng().random();
        Self(format!("{millis:x}-{tail:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which side of the call this session is. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Media requested for the call. Fixed at creation.
///
/// Audio is always captured; video only for [`MediaKind::VideoAndAudio`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    Audio,
    VideoAndAudio,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::VideoAndAudio)
    }
}

/// One togglable aspect of the local media, used in toggle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaAspect {
    Audio,
    Video,
}

/// Why a session ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Local user hung up.
    HungUp,
    /// Remote side sent `call-end`.
    PeerHungUp,
    /// Local user declined an incoming call.
    Rejected,
    /// Remote side sent `call-reject`.
    PeerRejected,
    /// Outgoing call was never answered within the ringing timeout.
    RingTimeout,
}

/// User-facing classification of a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// User declined the capture permission prompt.
    MediaAcquisitionDenied,
    /// No matching capture hardware, or the device is busy.
    MediaDeviceUnavailable,
    /// A description was malformed or rejected during negotiation.
    NegotiationFailed,
    /// The connection dropped after having been established.
    TransportUnreachable,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MediaAcquisitionDenied => "media acquisition denied",
            Self::MediaDeviceUnavailable => "media device unavailable",
            Self::NegotiationFailed => "negotiation failed",
            Self::TransportUnreachable => "transport unreachable",
        };
        write!(f, "{s}")
    }
}
