//! Peer-to-peer call sessions riding on a chat signaling transport.
//!
//! The [`manager::CallManager`] owns every call session and is the only
//! place state transitions happen. It consumes local intent (start,
//! accept, reject, end, toggle), inbound signaling envelopes relayed by
//! the host application, and events from per-session peer connections,
//! and publishes observable [`events::CallEvent`]s for the presentation
//! layer.
//!
//! The seams — [`transport::SignalingTransport`], [`media::MediaSource`],
//! [`connection::ConnectionFactory`], [`identity::IdentityDirectory`] —
//! are traits so hosts can plug in their own backends; [`webrtc`]
//! provides the default connection backend.

pub mod connection;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod media;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod types;
pub mod webrtc;

pub use connection::{ConnectionFactory, ConnectionSignal, PeerConnection};
pub use error::CallError;
pub use events::CallEvent;
pub use manager::{CallManager, CallManagerConfig};
pub use media::{MediaSource, MediaError};
pub use signaling::{SignalEnvelope, SignalKind, SignalPayload};
pub use state::{CallSnapshot, CallState};
pub use transport::SignalingTransport;
pub use types::{CallRole, EndReason, FailureReason, MediaAspect, MediaKind, PeerId, SessionId};

#[cfg(test)]
mod protocol_tests;
