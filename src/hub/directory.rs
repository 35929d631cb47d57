//! In-process channel/message store
//!
//! Channels and messages live in memory for the lifetime of the hub. Message
//! ids are assigned here, one counter per channel.

use super::RelayHub;
use crate::bus::{Body, Envelope};
use crate::chat::{ChatApi, ChatError};
use crate::types::{Channel, ChannelId, ChannelMessage, MessageId, MessageKind, PresenceEntry, UserProfile};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;

pub const GENERAL_CHANNEL: &str = "general";

pub(super) struct Directory {
    history_limit: usize,
    channels: Vec<Channel>,
    messages: HashMap<ChannelId, Vec<ChannelMessage>>,
}

impl Directory {
    /// Empty store with the `general` channel seeded
    pub(super) fn new(history_limit: usize) -> Self {
        let mut directory = Self {
            history_limit,
            channels: Vec::new(),
            messages: HashMap::new(),
        };
        directory.create_channel(
            ChannelId::new(GENERAL_CHANNEL),
            GENERAL_CHANNEL,
            Some("General discussion".to_string()),
        );
        directory
    }

    pub(super) fn create_channel(
        &mut self,
        id: ChannelId,
        name: &str,
        description: Option<String>,
    ) -> Channel {
        if let Some(existing) = self.channels.iter().find(|c| c.id == id) {
            return existing.clone();
        }
        let channel = Channel {
            id: id.clone(),
            name: name.to_string(),
            description,
            is_private: false,
        };
        self.channels.push(channel.clone());
        self.messages.insert(id, Vec::new());
        channel
    }

    fn history(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMessage>, ChatError> {
        let messages = self
            .messages
            .get(channel_id)
            .ok_or_else(|| ChatError::UnknownChannel(channel_id.clone()))?;
        let skip = messages.len().saturating_sub(self.history_limit);
        Ok(messages[skip..].to_vec())
    }

    fn append(
        &mut self,
        channel_id: &ChannelId,
        sender: &UserProfile,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError> {
        let messages = self
            .messages
            .get_mut(channel_id)
            .ok_or_else(|| ChatError::UnknownChannel(channel_id.clone()))?;

        let next = messages.last().map(|m| m.id.0 + 1).unwrap_or(1);
        let message = ChannelMessage {
            id: MessageId(next),
            channel_id: channel_id.clone(),
            sender_id: sender.id.clone(),
            sender_username: sender.username.clone(),
            sender_avatar: sender.avatar_url.clone(),
            content: content.to_string(),
            kind,
            timestamp: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }
}

impl RelayHub {
    /// Creates a public channel; returns the existing one if `id` is taken
    pub fn create_channel(&self, id: ChannelId, name: &str, description: Option<String>) -> Channel {
        self.inner.directory.lock().create_channel(id, name, description)
    }

    /// Stores a message and broadcasts it to every connection, sender included
    pub fn post_message(
        &self,
        sender: &UserProfile,
        channel_id: &ChannelId,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let message = self
            .inner
            .directory
            .lock()
            .append(channel_id, sender, content, kind)?;

        tracing::debug!(
            channel = %channel_id,
            id = %message.id,
            user = %sender.id,
            "Message posted"
        );

        self.broadcast(&Envelope::new(Body::NewMessage {
            channel_id: channel_id.clone(),
            message: message.clone(),
        }));
        Ok(message)
    }
}

// ============================================================================
// CHAT API VIEW
// ============================================================================

/// The hub's directory seen by one user
#[derive(Clone)]
pub struct HubDirectory {
    hub: RelayHub,
    user: UserProfile,
}

impl HubDirectory {
    pub fn new(hub: RelayHub, user: UserProfile) -> Self {
        Self { hub, user }
    }
}

#[async_trait]
impl ChatApi for HubDirectory {
    async fn list_channels(&self) -> Result<Vec<Channel>, ChatError> {
        Ok(self.hub.inner.directory.lock().channels.clone())
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMessage>, ChatError> {
        self.hub.inner.directory.lock().history(channel_id)
    }

    async fn post_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError> {
        self.hub.post_message(&self.user, channel_id, content, kind)
    }

    async fn list_online_users(&self) -> Result<Vec<PresenceEntry>, ChatError> {
        Ok(self.hub.online_users())
    }
}
