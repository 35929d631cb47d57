//! Capture seam
//!
//! Platform backends (browser bridge, native camera/mic stack) implement
//! `MediaCapture`; the call layer only ever sees streams and errors.

use super::track::MediaStream;
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Which devices an acquisition asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync + 'static {
    /// Acquires microphone and/or camera
    async fn acquire(&self, constraints: MediaConstraints) -> Result<MediaStream, MediaError>;

    /// Acquires a display-capture stream (video only; system audio is not mixed)
    async fn acquire_display(&self) -> Result<MediaStream, MediaError>;
}
