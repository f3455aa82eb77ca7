//! Call-related error types.

use crate::types::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] crate::state::InvalidTransition),

    #[error("too many concurrent calls (limit {0})")]
    TooManyCalls(usize),

    #[error("peer not reachable on signaling transport: {0}")]
    PeerUnreachable(PeerId),

    #[error("media error: {0}")]
    Media(#[from] crate::media::MediaError),

    #[error("connection error: {0}")]
    Connection(#[from] crate::connection::ConnectionError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
