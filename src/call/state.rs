//! Call states, reasons and observable snapshots

use crate::media::StreamId;
use crate::types::{CallId, CallKind, UserProfile};
use serde::Serialize;

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Lifecycle of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No session
    Idle,
    /// Outgoing: media acquired, waiting for the callee to accept
    Requesting,
    /// Incoming: waiting for the local user to accept or reject
    Ringing,
    /// Offer/answer/ICE exchange in progress
    Negotiating,
    Active,
    ScreenSharing,
    Ended,
}

impl CallState {
    /// Media flows in both directions
    pub fn is_connected(self) -> bool {
        matches!(self, CallState::Active | CallState::ScreenSharing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Receiver,
}

// ============================================================================
// END REASONS
// ============================================================================

/// Why a session reached `Ended`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    /// Local `end_call`, including cancellation of in-flight work
    Hangup,
    RemoteHangup,
    /// Local user rejected the incoming call
    Declined,
    RemoteDeclined,
    /// The callee is already in a call
    Busy,
    /// The callee is not connected
    Unavailable,
    /// Both parties called each other and this side's attempt gave way
    /// to the other one
    Crossed,
    MediaAccess(String),
    Negotiation(String),
    Transport(String),
}

impl EndReason {
    /// `reason` field of the `call_end` envelope we send
    pub fn wire(&self) -> &'static str {
        match self {
            EndReason::Hangup | EndReason::RemoteHangup | EndReason::Crossed => "hangup",
            EndReason::Declined | EndReason::RemoteDeclined => "declined",
            EndReason::Busy => "busy",
            EndReason::Unavailable => "unavailable",
            EndReason::MediaAccess(_) => "media_error",
            EndReason::Negotiation(_) | EndReason::Transport(_) => "failed",
        }
    }

    /// Interprets a `call_end` received from the other party
    pub fn from_remote(reason: &str) -> Self {
        match reason {
            "declined" => EndReason::RemoteDeclined,
            "busy" => EndReason::Busy,
            "unavailable" => EndReason::Unavailable,
            "failed" => EndReason::Negotiation("remote peer failed".to_string()),
            "media_error" => EndReason::MediaAccess("remote media unavailable".to_string()),
            _ => EndReason::RemoteHangup,
        }
    }

    /// Whether ending for this reason sends a `call_end` to the other party
    pub fn notifies_peer(&self) -> bool {
        !matches!(
            self,
            EndReason::RemoteHangup
                | EndReason::RemoteDeclined
                | EndReason::Busy
                | EndReason::Unavailable
                | EndReason::Crossed
        )
    }
}

// ============================================================================
// OBSERVATION
// ============================================================================

/// What the local preview shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "stream", rename_all = "snake_case")]
pub enum LocalPreview {
    None,
    Camera(StreamId),
    Display(StreamId),
    /// Avatar fallback when no camera is left to show
    Placeholder,
}

/// Read-only copy of the current session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub kind: CallKind,
    pub role: CallRole,
    pub state: CallState,
    /// The other party
    pub peer: UserProfile,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub preview: LocalPreview,
    pub end_reason: Option<EndReason>,
}

/// Broadcast to observers of the call manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged { call_id: CallId, state: CallState },
    Incoming { call_id: CallId, caller: UserProfile, kind: CallKind },
    Ended { call_id: CallId, reason: EndReason },
    /// Transient user-facing notice (busy callers, screen share stopped, ...)
    Notice(String),
}
