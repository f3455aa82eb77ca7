//! Call session state machine.
//!
//! One machine, parameterized by [`CallRole`], covers both the offer path
//! and the answer path; the only role-specific edge is where media
//! readiness leads (`Negotiating` for the caller, `Ringing` for the
//! callee).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::{IceCandidate, PeerConnection};
use crate::media::{LocalMediaStream, RemoteTrack};
use crate::types::{CallRole, EndReason, FailureReason, MediaKind, PeerId, SessionId};

/// Current state of a call session.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Created, nothing requested yet.
    #[default]
    Idle,
    /// Dial intent registered (outgoing) or offer received (incoming).
    Initiating,
    /// Waiting on capture device acquisition.
    AwaitingLocalMedia,
    /// Caller: media ready, producing and sending the offer.
    Negotiating { since: DateTime<Utc> },
    /// Callee only: offer and local media ready, waiting for accept.
    Ringing { received_at: DateTime<Utc> },
    /// Local description sent; reachability discovery in progress.
    Connecting { since: DateTime<Utc> },
    /// The peer connection reported a live transport.
    Connected { connected_at: DateTime<Utc> },
    /// Resource release in progress.
    Ending {
        reason: EndReason,
        connected_at: Option<DateTime<Utc>>,
    },
    /// Terminal: released cleanly.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
    /// Terminal, absorbing: reached from any non-terminal state.
    Failed {
        reason: FailureReason,
        failed_at: DateTime<Utc>,
    },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// True once the local description has been produced and sent.
    pub fn is_past_negotiation(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Connected { .. })
    }
}

/// State transitions for call sessions.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local dial intent (outgoing) or first signaling message (incoming).
    DialStarted,
    /// Media acquisition kicked off.
    MediaRequested,
    /// Capture devices acquired and registered with the connection.
    MediaReady,
    /// Caller sent the offer.
    OfferSent,
    /// Callee accepted and sent the answer.
    AnswerSent,
    /// The peer connection reported a live transport.
    TransportConnected,
    /// Local or remote end/reject; release begins.
    EndRequested { reason: EndReason },
    /// Media stopped and connection closed.
    ReleaseComplete,
    /// Unrecoverable failure; same release obligations as `Ended`.
    Failure { reason: FailureReason },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The aggregate root for one call attempt.
///
/// Exclusively owns its peer connection, its local media, and the queue of
/// candidates that arrived before the remote description. Mutated only by
/// the controller.
pub struct CallSession {
    pub session_id: SessionId,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub peer: PeerId,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Local toggle flags; independent of session state.
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub(crate) local_media: Option<LocalMediaStream>,
    pub(crate) remote_tracks: Vec<RemoteTrack>,
    pub(crate) connection: Option<Arc<dyn PeerConnection>>,
    /// Candidates received before the remote description was set, in
    /// arrival order.
    pub(crate) pending_remote_candidates: VecDeque<IceCandidate>,
    pub(crate) remote_description_set: bool,
}

impl CallSession {
    pub fn new_outgoing(session_id: SessionId, peer: PeerId, media_kind: MediaKind) -> Self {
        Self::new(session_id, peer, media_kind, CallRole::Caller)
    }

    pub fn new_incoming(session_id: SessionId, peer: PeerId, media_kind: MediaKind) -> Self {
        Self::new(session_id, peer, media_kind, CallRole::Callee)
    }

    fn new(session_id: SessionId, peer: PeerId, media_kind: MediaKind, role: CallRole) -> Self {
        Self {
            session_id,
            role,
            media_kind,
            peer,
            state: CallState::Idle,
            created_at: Utc::now(),
            audio_enabled: true,
            video_enabled: media_kind.has_video(),
            local_media: None,
            remote_tracks: Vec::new(),
            connection: None,
            pending_remote_candidates: VecDeque::new(),
            remote_description_set: false,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Caller
    }

    /// Apply a state transition. Returns an error if the transition is not
    /// valid from the current state.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Idle, CallTransition::DialStarted) => CallState::Initiating,
            (CallState::Initiating, CallTransition::MediaRequested) => {
                CallState::AwaitingLocalMedia
            }
            (CallState::AwaitingLocalMedia, CallTransition::MediaReady) => match self.role {
                CallRole::Caller => CallState::Negotiating { since: Utc::now() },
                CallRole::Callee => CallState::Ringing {
                    received_at: Utc::now(),
                },
            },
            (CallState::Negotiating { .. }, CallTransition::OfferSent) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Ringing { .. }, CallTransition::AnswerSent) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Connecting { .. }, CallTransition::TransportConnected) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                }
            }
            (CallState::Connected { connected_at }, CallTransition::EndRequested { reason }) => {
                CallState::Ending {
                    reason,
                    connected_at: Some(*connected_at),
                }
            }
            (
                CallState::Idle
                | CallState::Initiating
                | CallState::AwaitingLocalMedia
                | CallState::Negotiating { .. }
                | CallState::Ringing { .. }
                | CallState::Connecting { .. },
                CallTransition::EndRequested { reason },
            ) => CallState::Ending {
                reason,
                connected_at: None,
            },
            (
                CallState::Ending {
                    reason,
                    connected_at,
                },
                CallTransition::ReleaseComplete,
            ) => {
                let ended_at = Utc::now();
                CallState::Ended {
                    reason: *reason,
                    ended_at,
                    duration_secs: connected_at
                        .map(|at| ended_at.signed_duration_since(at).num_seconds()),
                }
            }
            (current, CallTransition::Failure { reason }) if !current.is_terminal() => {
                CallState::Failed {
                    reason,
                    failed_at: Utc::now(),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }

    /// Observable view of the session for the presentation layer.
    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.session_id.clone(),
            role: self.role,
            media_kind: self.media_kind,
            peer: self.peer.clone(),
            state: self.state.clone(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("media_kind", &self.media_kind)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("audio_enabled", &self.audio_enabled)
            .field("video_enabled", &self.video_enabled)
            .field("has_local_media", &self.local_media.is_some())
            .field("has_connection", &self.connection.is_some())
            .field("pending_candidates", &self.pending_remote_candidates.len())
            .finish()
    }
}

/// Cloneable, observable view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub session_id: SessionId,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub peer: PeerId,
    pub state: CallState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub created_at: DateTime<Utc>,
}
