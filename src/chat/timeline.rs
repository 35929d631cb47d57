//! Message sequence of the active channel

use crate::types::{ChannelId, ChannelMessage, MessageId};
use std::collections::BTreeMap;

/// Messages of one channel, ascending by id.
///
/// Identity is the message id: inserting an id twice keeps the first copy,
/// whichever path (history, local send, bus) delivered it.
#[derive(Debug, Clone)]
pub struct ChannelTimeline {
    channel_id: ChannelId,
    messages: BTreeMap<MessageId, ChannelMessage>,
}

impl ChannelTimeline {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            messages: BTreeMap::new(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Returns `true` if the message was new to this timeline
    pub fn insert(&mut self, message: ChannelMessage) -> bool {
        if message.channel_id != self.channel_id {
            return false;
        }
        match self.messages.entry(message.id) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(message);
                true
            }
        }
    }

    /// Merges a history page; returns how many messages were new
    pub fn extend(&mut self, history: impl IntoIterator<Item = ChannelMessage>) -> usize {
        history.into_iter().map(|m| self.insert(m)).filter(|new| *new).count()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.keys().copied().collect()
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.messages.values().cloned().collect()
    }
}
