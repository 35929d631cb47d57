//! WebSocket front end
//!
//! `GET /ws?user=<id>&name=<display name>[&avatar=<url>]` upgrades to a frame
//! connection attached to the hub.

use super::RelayHub;
use crate::bus::FramePipe;
use crate::types::UserProfile;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Reads the connecting user's profile from the upgrade query string
pub(super) fn profile_from_query(query: &str) -> Option<UserProfile> {
    let mut user = None;
    let mut name = None;
    let mut avatar = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "user" => user = Some(value.into_owned()),
            "name" => name = Some(value.into_owned()),
            "avatar" => avatar = Some(value.into_owned()),
            _ => {}
        }
    }

    let user = user.filter(|u| !u.is_empty())?;
    let name = name.unwrap_or_else(|| user.clone());
    let profile = UserProfile::new(user, name);
    Some(match avatar {
        Some(url) => profile.with_avatar(url),
        None => profile,
    })
}

impl RelayHub {
    /// Accepts WebSocket connections until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        tracing::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let hub = self.clone();
            tokio::spawn(async move {
                hub.handle_socket(stream, peer).await;
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) {
        let mut query = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_owned);
            Ok(response)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(%peer, "WebSocket handshake failed: {}", e);
                return;
            }
        };

        let Some(profile) = query.as_deref().and_then(profile_from_query) else {
            tracing::warn!(%peer, "Rejecting connection without user");
            let (mut write, _) = ws_stream.split();
            let _ = write.close().await;
            return;
        };

        tracing::info!(%peer, user = %profile.id, "WebSocket connection accepted");

        let FramePipe {
            outbound,
            mut inbound,
        } = self.attach(profile);
        let (mut write, mut read) = ws_stream.split();

        // Hub -> socket
        let writer = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    tracing::debug!("Socket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Socket -> hub
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if outbound.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(%peer, "Socket read failed: {}", e);
                    break;
                }
                _ => {}
            }
        }

        drop(outbound);
        writer.abort();
        tracing::info!(%peer, "WebSocket connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Connector, EnvelopeKind, EventBus, WsConnector};
    use crate::config::ClientConfig;
    use crate::types::UserId;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_profile_from_query() {
        let profile = profile_from_query("user=u1&name=Alice%20B&avatar=https%3A%2F%2Fa%2Fx.png").unwrap();
        assert_eq!(profile.id, UserId::new("u1"));
        assert_eq!(profile.username, "Alice B");
        assert_eq!(profile.avatar_url.as_deref(), Some("https://a/x.png"));
    }

    #[test]
    fn test_profile_requires_user() {
        assert!(profile_from_query("name=alice").is_none());
        assert!(profile_from_query("user=").is_none());
        assert_eq!(profile_from_query("user=bob").unwrap().username, "bob");
    }

    #[tokio::test]
    async fn test_websocket_clients_see_each_other() {
        let hub = RelayHub::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = hub.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(format!("http://{addr}")));
        let config = ClientConfig::default();

        let alice = EventBus::connect(
            Arc::clone(&connector),
            UserProfile::new("alice", "Alice"),
            &config,
        )
        .await
        .unwrap();
        let mut presence = alice.subscribe(&[EnvelopeKind::UserJoined]);

        // Registration happens after the upgrade; wait for it before bob joins
        tokio::time::timeout(Duration::from_secs(2), async {
            while !hub.is_online(&UserId::new("alice")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let _bob = EventBus::connect(connector, UserProfile::new("bob", "Bob"), &config)
            .await
            .unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(2), presence.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.kind(), EnvelopeKind::UserJoined);
    }
}
