//! Track and stream handles
//!
//! A `MediaTrack` is a cheap clone of shared state: the call session and the
//! peer transport hold the same track, so muting through one handle is seen
//! by every holder without re-acquiring or renegotiating anything.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub Uuid);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Display => TrackKind::Video,
        }
    }
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

struct TrackInner {
    id: TrackId,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
}

/// Handle to one captured track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        let (live, _) = watch::channel(true);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId(Uuid::new_v4()),
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                live,
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mutes/unmutes in place; the device stays acquired
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Releases the underlying device.
    ///
    /// Returns `true` only for the call that actually released it; later
    /// calls are no-ops.
    pub fn stop(&self) -> bool {
        self.inner.live.send_if_modified(|live| {
            let was_live = *live;
            *live = false;
            was_live
        })
    }

    /// Resolves once the track is no longer live, whoever stopped it
    /// (the session, or the platform e.g. the OS "stop sharing" button).
    pub async fn ended(&self) {
        let mut rx = self.inner.live.subscribe();
        // Err means the sender is gone, which can't happen while we hold inner
        let _ = rx.wait_for(|live| !*live).await;
    }

    /// True if both handles point at the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Tracks produced by one acquisition
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: StreamId,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: StreamId(Uuid::new_v4()),
            tracks,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stops every track; returns how many devices were actually released
    pub fn stop(&self) -> usize {
        let released = self.tracks.iter().filter(|t| t.stop()).count();
        tracing::debug!(stream = %self.id, released, "Media stream stopped");
        released
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }
}
