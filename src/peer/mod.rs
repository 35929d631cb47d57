//! Peer Transport capability
//!
//! Offer/answer/ICE exchange and track senders, behind a seam so the call
//! layer never touches a concrete WebRTC stack. Transport callbacks are not
//! exposed as callbacks: every implementation translates them into
//! [`PeerEvent`]s on a single channel that the call manager drains.

mod webrtc_peer;

pub use webrtc_peer::WebRtcTransport;

use crate::media::{MediaTrack, TrackId, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("No sender for {0:?} track")]
    NoSender(TrackKind),

    #[error("Peer session closed")]
    Closed,
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// Google public STUN servers
    pub fn default_stun() -> Vec<Self> {
        vec![IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        }]
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States the call cannot recover from
    pub fn is_fatal(self) -> bool {
        matches!(self, PeerConnectionState::Failed | PeerConnectionState::Closed)
    }
}

/// Everything a transport reports back to the call layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Local ICE candidate to trickle to the remote side
    LocalCandidate(String),
    /// The remote side sends media of this kind. Reported as soon as the
    /// remote description announcing it is applied, without waiting for the
    /// first packet; may repeat. The track itself stays with the transport.
    RemoteTrack { kind: TrackKind },
    ConnectionState(PeerConnectionState),
}

// ============================================================================
// TRANSPORT TRAITS
// ============================================================================

/// A freshly created session plus the channel its events arrive on
pub struct PeerHandle {
    pub session: Box<dyn PeerSession>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<PeerHandle, PeerError>;
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Adds an outbound sender carrying `track`
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    /// Swaps the track feeding the sender of `kind` without renegotiating.
    /// `None` detaches the sender's source.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<&MediaTrack>,
    ) -> Result<(), PeerError>;

    /// Track currently feeding the sender of `kind`, if a sender exists
    fn sender_track(&self, kind: TrackKind) -> Option<TrackId>;

    fn has_sender(&self, kind: TrackKind) -> bool;

    /// Creates and applies the local offer; returns its SDP
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Applies a remote offer, creates and applies the answer; returns its SDP
    async fn accept_offer(&self, sdp: String) -> Result<String, PeerError>;

    async fn accept_answer(&self, sdp: String) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), PeerError>;

    /// Closes the connection; errors are the caller's to swallow
    async fn close(&self) -> Result<(), PeerError>;
}
