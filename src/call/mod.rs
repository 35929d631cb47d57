//! Call Session Manager
//!
//! State machine for one peer-to-peer call at a time, driving the Media
//! Capture and Peer Transport capabilities from bus signaling.

mod error;
mod manager;
mod session;
mod state;


pub use error::CallError;
pub use manager::{CallManager, CallManagerHandle};
pub use session::CallSession;
pub use state::{CallEvent, CallRole, CallSnapshot, CallState, EndReason, LocalPreview};
