//! Local media acquisition and track lifecycle.
//!
//! A [`MediaSource`] yields a [`LocalMediaStream`] whose tracks are
//! exclusively owned by one call session. Toggling a track operates on its
//! enable flag only: it never stops the capture device and never triggers
//! renegotiation. Stopping releases the hardware and happens exactly once,
//! on the session's terminal transition.

use crate::types::{MediaAspect, MediaKind};
use async_trait::async_trait;
use log::debug;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("no matching capture device")]
    NoDevice,

    #[error("capture device busy")]
    DeviceBusy,

    #[error("media backend error: {0}")]
    Backend(String),
}

impl MediaError {
    /// Map an acquisition failure onto the user-facing classification.
    pub fn classify(&self) -> crate::types::FailureReason {
        match self {
            Self::PermissionDenied => crate::types::FailureReason::MediaAcquisitionDenied,
            Self::NoDevice | Self::DeviceBusy | Self::Backend(_) => {
                crate::types::FailureReason::MediaDeviceUnavailable
            }
        }
    }
}

/// Kind of a single media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn aspect(&self) -> MediaAspect {
        match self {
            Self::Audio => MediaAspect::Audio,
            Self::Video => MediaAspect::Video,
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// One captured local track.
///
/// `enabled` gates whether the capture pipeline feeds samples into the
/// connection; flipping it is cheap and reversible. `stop` releases the
/// underlying device and is latched: only the first call runs the release
/// hook.
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            release: Mutex::new(None),
        }
    }

    /// Attach a hook that releases the capture device; runs once, on stop.
    pub fn with_release(self, release: impl FnOnce() + Send + 'static) -> Self {
        *self.release.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(release));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the track and release the device. Returns true only for the
    /// call that actually performed the stop.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(release) = self
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            release();
        }
        debug!("stopped local {:?} track {}", self.kind, self.id);
        true
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The set of tracks acquired for one session.
#[derive(Debug, Clone, Default)]
pub struct LocalMediaStream {
    tracks: Vec<std::sync::Arc<LocalTrack>>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<std::sync::Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[std::sync::Arc<LocalTrack>] {
        &self.tracks
    }

    /// Flip the enable flag on every track of the given aspect.
    pub fn set_enabled(&self, aspect: MediaAspect, enabled: bool) {
        for track in &self.tracks {
            if track.kind().aspect() == aspect {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop every track. Returns how many were newly stopped.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// A track supplied by the peer connection once negotiation completes.
///
/// The session observes remote tracks, it does not own them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Acquires local capture devices matching a [`MediaKind`].
///
/// Acquisition is asynchronous and may take unbounded time (permission
/// prompts). Audio is always requested; video only for
/// [`MediaKind::VideoAndAudio`].
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMediaStream, MediaError>;
}
