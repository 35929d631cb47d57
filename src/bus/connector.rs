//! Connection seam
//!
//! A `Connector` opens one raw text-frame pipe to the coordinating server.
//! The event bus owns everything above it (parsing, queueing, reconnects).

use super::client::TransportError;
use crate::types::UserProfile;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Inbound frames buffered per connection before the reader task waits
const INBOUND_BUFFER: usize = 256;

/// Raw frame channels of one open connection.
///
/// The connection is gone once `inbound` yields `None`.
pub struct FramePipe {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::Receiver<String>,
}

impl FramePipe {
    /// Two pipes wired back to back (the second is the server end)
    pub fn pair() -> (FramePipe, FramePipe) {
        let (client_out, server_in) = mpsc::unbounded_channel::<String>();
        let (server_out, client_in) = mpsc::unbounded_channel::<String>();
        (
            FramePipe {
                outbound: client_out,
                inbound: forward_bounded(client_in),
            },
            FramePipe {
                outbound: server_out,
                inbound: forward_bounded(server_in),
            },
        )
    }
}

fn forward_bounded(mut rx: mpsc::UnboundedReceiver<String>) -> mpsc::Receiver<String> {
    let (tx, out) = mpsc::channel(INBOUND_BUFFER);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    out
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, profile: &UserProfile) -> Result<FramePipe, TransportError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// Connects to the relay over WebSocket (`/ws?user=…`)
#[derive(Debug, Clone)]
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }

    /// `http(s)://host` → `ws(s)://host/ws?user=…&name=…[&avatar=…]`
    pub fn endpoint(&self, profile: &UserProfile) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TransportError::ConnectFailed(format!("invalid server url: {e}")))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::ConnectFailed(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError::ConnectFailed("cannot set ws scheme".to_string()))?;

        url = url
            .join("ws")
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user", profile.id.as_str());
            query.append_pair("name", &profile.username);
            if let Some(avatar) = &profile.avatar_url {
                query.append_pair("avatar", avatar);
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, profile: &UserProfile) -> Result<FramePipe, TransportError> {
        let ws_url = self.endpoint(profile)?;
        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

        // Read task
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        // Write task
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        Ok(FramePipe {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
