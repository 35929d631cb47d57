//! Envelope wire format
//!
//! Every frame on the persistent connection is one JSON envelope: routing
//! fields (`from`, `to`, `timestamp`) plus a body tagged by `"type"`. The bus
//! itself only looks at the tag; payloads are interpreted by subscribers.

use crate::types::{CallId, CallKind, ChannelId, ChannelMessage, UserId, UserProfile};
use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Set by the relay on delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UserId>,
    /// Addressee for call signaling; `None` for broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self {
            from: None,
            to: None,
            timestamp: Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn to(mut self, user: UserId) -> Self {
        self.to = Some(user);
        self
    }

    pub fn from_user(mut self, user: UserId) -> Self {
        self.from = Some(user);
        self
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// Call this envelope refers to, for `call_*` kinds
    pub fn call_id(&self) -> Option<CallId> {
        match &self.body {
            Body::CallIncoming { call_id, .. }
            | Body::CallOffer { call_id, .. }
            | Body::CallAnswer { call_id, .. }
            | Body::CallIceCandidate { call_id, .. }
            | Body::CallEnd { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }
}

// ============================================================================
// BODIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Caller → callee: a call is ringing
    CallIncoming {
        #[serde(rename = "callId")]
        call_id: CallId,
        kind: CallKind,
        caller: UserProfile,
    },

    CallOffer {
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: String,
    },

    CallAnswer {
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: String,
    },

    CallIceCandidate {
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: String,
    },

    /// Hangup, decline, busy, failure
    CallEnd {
        #[serde(rename = "callId")]
        call_id: CallId,
        reason: String,
    },

    NewMessage {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        message: ChannelMessage,
    },

    UserJoined {
        user: UserProfile,
    },

    UserLeft {
        #[serde(rename = "userId")]
        user_id: UserId,
    },

    /// Heartbeat; answered by the relay, never delivered to subscribers
    Ping,

    Pong,
}

impl Body {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Body::CallIncoming { .. } => EnvelopeKind::CallIncoming,
            Body::CallOffer { .. } => EnvelopeKind::CallOffer,
            Body::CallAnswer { .. } => EnvelopeKind::CallAnswer,
            Body::CallIceCandidate { .. } => EnvelopeKind::CallIceCandidate,
            Body::CallEnd { .. } => EnvelopeKind::CallEnd,
            Body::NewMessage { .. } => EnvelopeKind::NewMessage,
            Body::UserJoined { .. } => EnvelopeKind::UserJoined,
            Body::UserLeft { .. } => EnvelopeKind::UserLeft,
            Body::Ping => EnvelopeKind::Ping,
            Body::Pong => EnvelopeKind::Pong,
        }
    }
}

/// The `"type"` tag of an envelope, used for subscriptions and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    CallIncoming,
    CallOffer,
    CallAnswer,
    CallIceCandidate,
    CallEnd,
    NewMessage,
    UserJoined,
    UserLeft,
    Ping,
    Pong,
}

impl EnvelopeKind {
    /// Kinds routed to the call session manager
    pub const CALL: [EnvelopeKind; 5] = [
        EnvelopeKind::CallIncoming,
        EnvelopeKind::CallOffer,
        EnvelopeKind::CallAnswer,
        EnvelopeKind::CallIceCandidate,
        EnvelopeKind::CallEnd,
    ];

    /// Kinds routed to presence & chat delivery
    pub const CHAT: [EnvelopeKind; 3] = [
        EnvelopeKind::NewMessage,
        EnvelopeKind::UserJoined,
        EnvelopeKind::UserLeft,
    ];

    pub fn is_call(self) -> bool {
        Self::CALL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::CallIncoming => "call_incoming",
            EnvelopeKind::CallOffer => "call_offer",
            EnvelopeKind::CallAnswer => "call_answer",
            EnvelopeKind::CallIceCandidate => "call_ice_candidate",
            EnvelopeKind::CallEnd => "call_end",
            EnvelopeKind::NewMessage => "new_message",
            EnvelopeKind::UserJoined => "user_joined",
            EnvelopeKind::UserLeft => "user_left",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
        }
    }
}
