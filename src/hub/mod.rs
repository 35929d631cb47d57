//! Relay hub
//!
//! Routing core of the coordinating server:
//! - Connection registry (one connection per user)
//! - Presence broadcast on attach/detach
//! - Call signaling routed to the addressee
//! - In-process channel/message directory
//!
//! Works in-process (it is a [`Connector`]) and behind a WebSocket listener
//! ([`RelayHub::serve`]).

mod directory;
mod server;

pub use directory::HubDirectory;

use crate::bus::{Body, Connector, Envelope, EnvelopeKind, FramePipe, TransportError};
use crate::config::RelayConfig;
use crate::types::{CallId, PresenceEntry, UserId, UserProfile};
use async_trait::async_trait;
use directory::Directory;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reason sent back when a call is addressed to someone offline
pub const REASON_UNAVAILABLE: &str = "unavailable";

struct Connection {
    id: u64,
    profile: UserProfile,
    tx: mpsc::UnboundedSender<String>,
}

struct HubInner {
    connections: Mutex<HashMap<UserId, Connection>>,
    directory: Mutex<Directory>,
    /// Most recent routed call envelopes, at most `journal_limit`
    journal: Mutex<VecDeque<Envelope>>,
    journal_limit: usize,
    next_connection: AtomicU64,
}

/// Shared hub handle. Cheap to clone.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: Mutex::new(HashMap::new()),
                directory: Mutex::new(Directory::new(config.history_limit)),
                journal: Mutex::new(VecDeque::new()),
                journal_limit: config.journal_limit,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    // ========================================================================
    // CONNECTIONS
    // ========================================================================

    /// Registers a connection for `profile` and returns the client end.
    ///
    /// A second connection for the same user replaces the first one, whose
    /// pipe is closed.
    pub fn attach(&self, profile: UserProfile) -> FramePipe {
        let (client, server) = FramePipe::pair();
        let FramePipe { outbound, mut inbound } = server;
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let user_id = profile.id.clone();

        let replaced = self.inner.connections.lock().insert(
            user_id.clone(),
            Connection {
                id,
                profile: profile.clone(),
                tx: outbound,
            },
        );

        match replaced {
            Some(old) => {
                tracing::info!(user = %user_id, old = old.id, new = id, "Connection replaced")
            }
            None => {
                tracing::info!(user = %user_id, connection = id, "User connected");
                self.broadcast_except(
                    &user_id,
                    &Envelope::new(Body::UserJoined {
                        user: profile.clone(),
                    }),
                );
            }
        }

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                hub.handle_frame(&profile, &frame);
            }
            hub.detach(&profile.id, id);
        });

        client
    }

    fn detach(&self, user_id: &UserId, connection: u64) {
        let removed = {
            let mut connections = self.inner.connections.lock();
            match connections.get(user_id) {
                Some(current) if current.id == connection => connections.remove(user_id),
                _ => None,
            }
        };

        if removed.is_some() {
            tracing::info!(user = %user_id, connection, "User disconnected");
            self.broadcast_except(
                user_id,
                &Envelope::new(Body::UserLeft {
                    user_id: user_id.clone(),
                }),
            );
        }
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.connections.lock().contains_key(user_id)
    }

    /// Connected users, sorted by display name
    pub fn online_users(&self) -> Vec<PresenceEntry> {
        let mut users: Vec<PresenceEntry> = self
            .inner
            .connections
            .lock()
            .values()
            .map(|c| PresenceEntry::from(c.profile.clone()))
            .collect();
        users.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        users
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    fn handle_frame(&self, sender: &UserProfile, frame: &str) {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(user = %sender.id, "Dropping malformed frame: {}", e);
                return;
            }
        };

        match envelope.kind() {
            EnvelopeKind::Ping => self.send_to(&sender.id, &Envelope::new(Body::Pong)),
            EnvelopeKind::Pong => {}
            kind if kind.is_call() => self.route_call(sender, envelope),
            kind => {
                tracing::debug!(
                    user = %sender.id,
                    kind = kind.as_str(),
                    "Ignoring client-originated envelope"
                );
            }
        }
    }

    fn route_call(&self, sender: &UserProfile, envelope: Envelope) {
        let Some(target) = envelope.to.clone() else {
            tracing::warn!(user = %sender.id, "Call envelope without addressee");
            return;
        };
        let Some(call_id) = envelope.call_id() else {
            return;
        };

        let routed = envelope.from_user(sender.id.clone());
        self.record(&routed);

        let frame = match serde_json::to_string(&routed) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode routed envelope: {}", e);
                return;
            }
        };

        let delivered = self
            .inner
            .connections
            .lock()
            .get(&target)
            .map(|c| c.tx.send(frame).is_ok())
            .unwrap_or(false);

        if delivered {
            tracing::debug!(
                call_id = %call_id,
                from = %sender.id,
                to = %target,
                kind = routed.kind().as_str(),
                "Routed call envelope"
            );
        } else if !matches!(routed.body, Body::CallEnd { .. }) {
            tracing::info!(call_id = %call_id, to = %target, "Call target offline");
            self.send_to(&sender.id, &unavailable(call_id, target));
        }
    }

    fn send_to(&self, user_id: &UserId, envelope: &Envelope) {
        let Ok(frame) = serde_json::to_string(envelope) else {
            return;
        };
        if let Some(connection) = self.inner.connections.lock().get(user_id) {
            let _ = connection.tx.send(frame);
        }
    }

    fn broadcast_except(&self, skip: &UserId, envelope: &Envelope) {
        let Ok(frame) = serde_json::to_string(envelope) else {
            return;
        };
        for (user_id, connection) in self.inner.connections.lock().iter() {
            if user_id != skip {
                let _ = connection.tx.send(frame.clone());
            }
        }
    }

    fn broadcast(&self, envelope: &Envelope) {
        let Ok(frame) = serde_json::to_string(envelope) else {
            return;
        };
        for connection in self.inner.connections.lock().values() {
            let _ = connection.tx.send(frame.clone());
        }
    }

    fn record(&self, routed: &Envelope) {
        if self.inner.journal_limit == 0 {
            return;
        }
        let mut journal = self.inner.journal.lock();
        while journal.len() >= self.inner.journal_limit {
            journal.pop_front();
        }
        journal.push_back(routed.clone());
    }

    /// Most recently routed call envelopes, in routing order
    pub fn journal(&self) -> Vec<Envelope> {
        self.inner.journal.lock().iter().cloned().collect()
    }

    /// Directory view acting as `user`
    pub fn directory_for(&self, user: UserProfile) -> HubDirectory {
        HubDirectory::new(self.clone(), user)
    }
}

fn unavailable(call_id: CallId, target: UserId) -> Envelope {
    Envelope::new(Body::CallEnd {
        call_id,
        reason: REASON_UNAVAILABLE.to_string(),
    })
    .from_user(target)
}

#[async_trait]
impl Connector for RelayHub {
    async fn open(&self, profile: &UserProfile) -> Result<FramePipe, TransportError> {
        Ok(self.attach(profile.clone()))
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}
