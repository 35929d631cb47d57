use super::state::CallState;
use crate::bus::TransportError;
use crate::media::MediaError;
use crate::peer::PeerError;
use crate::types::CallId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Media access failed: {0}")]
    MediaAccess(#[from] MediaError),

    #[error("{operation} is not valid while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Envelope for unknown or ended call {0}")]
    SignalingOrder(CallId),

    #[error("Signaling transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cancelled by end_call")]
    Cancelled,

    #[error("Call manager stopped")]
    ManagerGone,
}

impl From<PeerError> for CallError {
    fn from(e: PeerError) -> Self {
        CallError::Negotiation(e.to_string())
    }
}
