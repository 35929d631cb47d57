//! Event bus client
//!
//! One persistent connection per authenticated client:
//! - In-order delivery to kind-based subscriptions
//! - Outbound queue while reconnecting, flushed in order on reopen
//! - Automatic reconnection with backoff
//! - Heartbeat keeping

use super::connector::{Connector, FramePipe};
use super::messages::{Body, Envelope, EnvelopeKind};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::types::UserProfile;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to signaling server failed: {0}")]
    ConnectFailed(String),

    #[error("Connection permanently closed")]
    Closed,

    #[error("Outbound queue full ({0} frames)")]
    QueueFull(usize),

    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Liveness of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Lost and reconnecting; sends are queued
    Connecting,
    Open,
    /// Logged out or gave up; sends are rejected
    Closed,
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

struct Subscriber {
    kinds: Vec<EnvelopeKind>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Receiving end of [`EventBus::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<String>>,
    queue: VecDeque<String>,
    closed: bool,
}

struct Shared {
    link: Mutex<Link>,
    subscribers: Mutex<Vec<Subscriber>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Counts successful attaches: 1 after connect, +1 per reconnect
    sessions_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Parses one inbound frame and hands it to every matching subscriber
    fn dispatch(&self, frame: &str) {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Skipping malformed frame: {}", e);
                return;
            }
        };

        let kind = envelope.kind();
        if matches!(kind, EnvelopeKind::Ping | EnvelopeKind::Pong) {
            return;
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for subscriber in subscribers.iter().filter(|s| s.kinds.contains(&kind)) {
            if subscriber.tx.send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::trace!(kind = kind.as_str(), delivered, "Envelope dispatched");
    }

    /// Installs a fresh writer and flushes the queue through it first
    fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        let mut link = self.link.lock();
        if link.closed {
            return;
        }

        let flushed = link.queue.len();
        while let Some(frame) = link.queue.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
                link.queue.push_front(frame);
                tracing::warn!("New connection dropped while flushing queue");
                return;
            }
        }
        if flushed > 0 {
            tracing::info!(flushed, "Flushed queued envelopes");
        }

        link.outbound = Some(outbound);
        drop(link);
        self.sessions_tx.send_modify(|n| *n += 1);
        self.set_state(ConnectionState::Open);
    }

    fn detach(&self) {
        let mut link = self.link.lock();
        link.outbound = None;
        if !link.closed {
            drop(link);
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Permanently closes; queued frames are dropped and reported
    fn close(&self) {
        let dropped = {
            let mut link = self.link.lock();
            link.closed = true;
            link.outbound = None;
            let dropped = link.queue.len();
            link.queue.clear();
            dropped
        };
        if dropped > 0 {
            tracing::warn!(dropped, "Dropping queued envelopes, connection closed");
        }
        // Ends every subscription
        self.subscribers.lock().clear();
        self.set_state(ConnectionState::Closed);
    }

    fn is_closed(&self) -> bool {
        self.link.lock().closed
    }

    /// Writes a frame only if a writer is installed (heartbeats are never queued)
    fn write_now(&self, frame: String) {
        if let Some(outbound) = self.link.lock().outbound.as_ref() {
            let _ = outbound.send(frame);
        }
    }
}

// ============================================================================
// EVENT BUS
// ============================================================================

/// Client end of the realtime connection. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    connection_id: Uuid,
    profile: UserProfile,
    queue_limit: usize,
    shared: Arc<Shared>,
}

impl EventBus {
    /// Opens the connection once. On failure the caller retries with backoff.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        profile: UserProfile,
        config: &ClientConfig,
    ) -> Result<Self, TransportError> {
        let pipe = connector.open(&profile).await?;

        let (state_tx, _) = watch::channel(ConnectionState::Open);
        let (sessions_tx, _) = watch::channel(0);
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            link: Mutex::new(Link::default()),
            subscribers: Mutex::new(Vec::new()),
            state_tx,
            sessions_tx,
            shutdown_tx,
        });

        let FramePipe { outbound, inbound } = pipe;
        shared.attach(outbound);

        let bus = Self {
            connection_id: Uuid::new_v4(),
            profile: profile.clone(),
            queue_limit: config.outbound_queue_limit,
            shared: Arc::clone(&shared),
        };

        tracing::info!(user = %profile.id, connection = %bus.connection_id, "Event bus connected");

        tokio::spawn(drive(
            shared,
            connector,
            profile,
            inbound,
            config.reconnect.clone(),
            config.heartbeat_interval(),
        ));

        Ok(bus)
    }

    /// Retries [`connect`](Self::connect) with the configured backoff
    pub async fn connect_with_retry(
        connector: Arc<dyn Connector>,
        profile: UserProfile,
        config: &ClientConfig,
    ) -> Result<Self, TransportError> {
        let mut attempt = 0;
        loop {
            match Self::connect(Arc::clone(&connector), profile.clone(), config).await {
                Ok(bus) => return Ok(bus),
                Err(e) if attempt < config.reconnect.max_attempts => {
                    attempt += 1;
                    let delay = config.reconnect.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, "Connect failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Bumped each time a connection is (re)established. Envelopes sent by
    /// the server while the bus was reconnecting are lost, so state derived
    /// from them has to be reloaded on every bump.
    pub fn watch_sessions(&self) -> watch::Receiver<u64> {
        self.shared.sessions_tx.subscribe()
    }

    /// Registers for envelopes of the given kinds.
    ///
    /// Delivery never waits on the subscriber: envelopes pile up in the
    /// subscription until it is drained, in arrival order.
    pub fn subscribe(&self, kinds: &[EnvelopeKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(Subscriber {
            kinds: kinds.to_vec(),
            tx,
        });
        Subscription { rx }
    }

    /// Best-effort send: written when open, queued while reconnecting,
    /// rejected once closed.
    pub fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let kind = envelope.kind();
        let frame =
            serde_json::to_string(&envelope).map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut link = self.shared.link.lock();
        if link.closed {
            tracing::warn!(kind = kind.as_str(), "Dropping envelope, connection closed");
            return Err(TransportError::Closed);
        }

        let frame = match link.outbound.as_ref() {
            Some(outbound) => match outbound.send(frame) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => {
                    // Writer gone; the driver will notice and reconnect
                    link.outbound = None;
                    frame
                }
            },
            None => frame,
        };

        if link.queue.len() >= self.queue_limit {
            tracing::warn!(kind = kind.as_str(), "Outbound queue full, dropping envelope");
            return Err(TransportError::QueueFull(self.queue_limit));
        }
        link.queue.push_back(frame);
        tracing::debug!(kind = kind.as_str(), queued = link.queue.len(), "Envelope queued");
        Ok(())
    }

    /// Logs out: closes the connection for good
    pub fn close(&self) {
        tracing::info!(user = %self.profile.id, "Closing event bus");
        self.shared.close();
        self.shared.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("connection_id", &self.connection_id)
            .field("user", &self.profile.id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// DELIVERY LOOP
// ============================================================================

async fn drive(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    profile: UserProfile,
    mut inbound: mpsc::Receiver<String>,
    policy: ReconnectPolicy,
    heartbeat: Duration,
) {
    let mut shutdown = shared.shutdown_tx.subscribe();

    'session: loop {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => shared.dispatch(&text),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Ok(frame) = serde_json::to_string(&Envelope::new(Body::Ping)) {
                        shared.write_now(frame);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }

        if shared.is_closed() {
            return;
        }

        tracing::warn!(user = %profile.id, "Connection lost, reconnecting");
        shared.detach();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            let opened = tokio::select! {
                result = async {
                    tokio::time::sleep(delay).await;
                    connector.open(&profile).await
                } => result,
                _ = shutdown.changed() => return,
            };

            match opened {
                Ok(pipe) => {
                    tracing::info!(attempt, "Reconnected");
                    inbound = pipe.inbound;
                    shared.attach(pipe.outbound);
                    continue 'session;
                }
                Err(e) => tracing::warn!(attempt, "Reconnect failed: {}", e),
            }
        }

        tracing::error!(user = %profile.id, "Giving up on reconnecting");
        shared.close();
        return;
    }
}
