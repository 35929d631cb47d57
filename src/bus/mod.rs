//! Realtime Event Bus
//!
//! Persistent connection to the coordinating server carrying presence,
//! chat and call signaling envelopes.

mod client;
mod connector;
mod messages;

pub use client::{ConnectionState, EventBus, Subscription, TransportError};
pub use connector::{Connector, FramePipe, WsConnector};
pub use messages::{Body, Envelope, EnvelopeKind};
