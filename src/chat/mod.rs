//! Presence & Chat Delivery

mod api;
mod delivery;
mod presence;
mod timeline;

pub use api::{ChatApi, ChatError, HttpChatApi};
pub use delivery::ChatDelivery;
pub use presence::PresenceRoster;
pub use timeline::ChannelTimeline;
