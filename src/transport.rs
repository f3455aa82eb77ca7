//! Signaling transport seam.
//!
//! The chat/messaging transport the call subsystem rides on is an external
//! collaborator. It delivers envelopes at least once, with no ordering
//! guarantee between different message kinds; the controller compensates
//! where ordering matters (candidate buffering).

use crate::signaling::SignalEnvelope;
use crate::types::PeerId;
use async_trait::async_trait;

/// Bidirectional signaling channel between participants.
///
/// Sends are fire-and-forget from the controller's perspective: delivery
/// guarantees (retries, ordering per session) are the transport's problem.
/// Implementations must log and swallow their own delivery failures.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Relay an envelope to its recipient. Never blocks call progress.
    async fn send(&self, envelope: SignalEnvelope);

    /// Whether the peer is currently reachable on the transport.
    ///
    /// Used only to pre-validate call initiation; not authoritative for
    /// session lifecycle.
    async fn is_reachable(&self, peer: &PeerId) -> bool;
}
