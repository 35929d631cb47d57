//! ConvoTalk - realtime core of a chat client
//!
//! - Persistent event bus to the coordinating server (WebSocket)
//! - Presence and channel message delivery
//! - Peer-to-peer audio/video calls with screen sharing (WebRTC)
//! - Relay hub for the server side (`convotalk-relay`)

pub mod bus;
pub mod call;
pub mod chat;
pub mod config;
pub mod hub;
pub mod media;
pub mod peer;
pub mod types;

#[cfg(test)]
mod testing;

use bus::{ConnectionState, Connector, EnvelopeKind, EventBus, TransportError, WsConnector};
use call::{CallError, CallManager, CallManagerHandle, CallState};
use chat::{ChatApi, ChatDelivery, ChatError, HttpChatApi};
use config::{ClientConfig, ConfigError};
use media::MediaCapture;
use peer::{PeerTransport, WebRtcTransport};
use std::sync::Arc;
use thiserror::Error;
use types::{ChannelId, UserProfile};

// ============================================================================
// LOGGING
// ============================================================================

/// Installs the fmt subscriber. `RUST_LOG` wins over the default filter;
/// an already installed subscriber is left alone.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("convotalk=debug,webrtc=warn"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Call(#[from] CallError),
}

// ============================================================================
// SERVICES
// ============================================================================

/// External collaborators a client runs against
#[derive(Clone)]
pub struct Services {
    pub connector: Arc<dyn Connector>,
    pub chat_api: Arc<dyn ChatApi>,
    pub capture: Arc<dyn MediaCapture>,
    pub transport: Arc<dyn PeerTransport>,
}

impl Services {
    /// WebSocket relay, REST store and webrtc-rs from `config`.
    /// Capture is platform specific and always supplied by the caller.
    pub fn networked(config: &ClientConfig, capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            connector: Arc::new(WsConnector::new(config.signaling_url.clone())),
            chat_api: Arc::new(HttpChatApi::new(
                config.api_url.clone(),
                config.auth_token.clone(),
            )),
            capture,
            transport: Arc::new(WebRtcTransport::new()),
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// One logged-in user: the bus connection plus the two components that
/// share it (call manager and chat delivery).
pub struct Client {
    profile: UserProfile,
    bus: EventBus,
    calls: CallManagerHandle,
    chat: ChatDelivery,
}

impl Client {
    /// Connects (with backoff), starts the call manager and loads the
    /// presence snapshot and default channel
    pub async fn start(
        profile: UserProfile,
        config: &ClientConfig,
        services: Services,
    ) -> Result<Self, ClientError> {
        tracing::info!(user = %profile.id, "Starting client...");

        let bus = EventBus::connect_with_retry(services.connector, profile.clone(), config).await?;

        let calls = CallManager::spawn(
            bus.clone(),
            services.capture,
            services.transport,
            config.ice_servers.clone(),
        );

        let chat = ChatDelivery::new(
            services.chat_api,
            ChannelId::new(config.default_channel.clone()),
        );
        // Subscribe before bootstrapping so nothing between snapshot and
        // history is missed
        tokio::spawn(chat.clone().run(bus.subscribe(&EnvelopeKind::CHAT)));
        let sessions = bus.watch_sessions();

        if let Err(e) = chat.bootstrap().await {
            tracing::error!(user = %profile.id, "Bootstrap failed: {}", e);
            bus.close();
            return Err(e.into());
        }

        // Anything broadcast while the bus was reconnecting is gone
        tokio::spawn(chat.clone().follow_reconnects(sessions, bus.watch_state()));

        tracing::info!(user = %profile.id, "Client ready");
        Ok(Self {
            profile,
            bus,
            calls,
            chat,
        })
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn calls(&self) -> &CallManagerHandle {
        &self.calls
    }

    pub fn chat(&self) -> &ChatDelivery {
        &self.chat
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.bus.state()
    }

    /// Ends any call in progress and closes the connection
    pub async fn logout(self) {
        tracing::info!(user = %self.profile.id, "Logging out");

        if !matches!(self.calls.state(), CallState::Idle | CallState::Ended) {
            if let Err(e) = self.calls.end_call().await {
                tracing::warn!("Failed to end call on logout: {}", e);
            }
        }
        self.bus.close();
    }
}
