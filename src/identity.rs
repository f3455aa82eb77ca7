//! Identity resolution for presentation metadata.

use crate::types::PeerId;
use async_trait::async_trait;

/// Display metadata for a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerProfile {
    pub peer: PeerId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Read-only lookup of participant display metadata.
///
/// Lookup failure never blocks call progress, it only degrades what the
/// presentation layer can show.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup(&self, peer: &PeerId) -> Option<PeerProfile>;
}
