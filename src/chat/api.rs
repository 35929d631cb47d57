//! Channel/message store and presence query
//!
//! The request/response side of chat. The realtime side (new messages,
//! joins, leaves) arrives over the event bus.

use crate::types::{Channel, ChannelId, ChannelMessage, MessageKind, PresenceEntry, UserId};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("Message content is empty")]
    EmptyContent,
}

// ============================================================================
// CONTRACT
// ============================================================================

#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    async fn list_channels(&self) -> Result<Vec<Channel>, ChatError>;

    /// History of a channel, ascending by message id
    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMessage>, ChatError>;

    /// Stores a message; the server assigns its id and timestamp
    async fn post_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError>;

    /// Snapshot of the online set; later changes arrive as presence events
    async fn list_online_users(&self) -> Result<Vec<PresenceEntry>, ChatError>;
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    content: &'a str,
    message_type: MessageKind,
}

/// User row as returned by the REST API
#[derive(Debug, Deserialize)]
struct OnlineUser {
    id: UserId,
    username: String,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default = "default_online")]
    is_online: bool,
}

fn default_online() -> bool {
    true
}

impl From<OnlineUser> for PresenceEntry {
    fn from(user: OnlineUser) -> Self {
        PresenceEntry {
            user_id: user.id,
            display_name: user.username,
            avatar_url: user.avatar_url,
            online: user.is_online,
        }
    }
}

/// REST client for the channel/message store (`{api_url}/api/...`)
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    http: Client,
    api_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.api_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_channels(&self) -> Result<Vec<Channel>, ChatError> {
        let channels = self
            .authorized(self.http.get(self.endpoint("channels")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(channels)
    }

    async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMessage>, ChatError> {
        let mut messages: Vec<ChannelMessage> = self
            .authorized(
                self.http
                    .get(self.endpoint(&format!("channels/{channel_id}/messages"))),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // The store sorts by timestamp; the timeline orders by id
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    async fn post_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }

        let message = self
            .authorized(
                self.http
                    .post(self.endpoint(&format!("channels/{channel_id}/messages"))),
            )
            .json(&PostMessageRequest {
                content,
                message_type: kind,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn list_online_users(&self) -> Result<Vec<PresenceEntry>, ChatError> {
        let users: Vec<OnlineUser> = self
            .authorized(self.http.get(self.endpoint("users/online")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users.into_iter().map(PresenceEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let api = HttpChatApi::new("http://localhost:8001/", None);
        assert_eq!(
            api.endpoint("channels/general/messages"),
            "http://localhost:8001/api/channels/general/messages"
        );
    }

    #[test]
    fn test_post_body_shape() {
        let body = serde_json::to_value(PostMessageRequest {
            content: "https://media.example/cat.gif",
            message_type: MessageKind::Gif,
        })
        .unwrap();
        assert_eq!(body["message_type"], "gif");
        assert_eq!(body["content"], "https://media.example/cat.gif");
    }

    #[test]
    fn test_online_user_row_maps_to_presence() {
        let row: OnlineUser = serde_json::from_str(
            r#"{"id":"u1","username":"alice","avatar_url":null,"email":"a@x"}"#,
        )
        .unwrap();
        let entry = PresenceEntry::from(row);
        assert_eq!(entry.user_id, UserId::new("u1"));
        assert_eq!(entry.display_name, "alice");
        assert!(entry.online);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_locally() {
        let api = HttpChatApi::new("http://127.0.0.1:9", None);
        let result = api
            .post_message(&ChannelId::new("general"), "   ", MessageKind::Text)
            .await;
        assert!(matches!(result, Err(ChatError::EmptyContent)));
    }
}
