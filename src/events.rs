//! Observable events for the presentation layer.
//!
//! The presentation surface is a pure consumer: it subscribes to a
//! broadcast feed and renders whatever state the controller publishes.
//! Callers of the controller observe state, never exceptions.

use crate::identity::PeerProfile;
use crate::media::RemoteTrack;
use crate::state::CallState;
use crate::types::{MediaAspect, MediaKind, PeerId, SessionId};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 100;

/// Something the presentation layer may want to render.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A new incoming call session was created from a `call-offer`.
    IncomingCall {
        session_id: SessionId,
        peer: PeerId,
        media_kind: MediaKind,
        /// Best-effort display metadata; `None` when lookup failed.
        profile: Option<PeerProfile>,
    },
    /// A session changed state.
    StateChanged {
        session_id: SessionId,
        state: CallState,
    },
    /// Remote media arrived for a session.
    RemoteMedia {
        session_id: SessionId,
        track: RemoteTrack,
    },
    /// The peer toggled mute or video. Purely presentational.
    PeerToggle {
        session_id: SessionId,
        peer: PeerId,
        aspect: MediaAspect,
        enabled: bool,
    },
}

/// Broadcast feed of call events.
#[derive(Debug)]
pub struct CallEventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl CallEventBus {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn dispatch(&self, event: CallEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
