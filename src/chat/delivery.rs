//! Presence & chat delivery
//!
//! Keeps the two views a UI renders from: the online-user set and the
//! active channel's message sequence. Both are fed from a one-time fetch
//! and then kept current by bus events.

use super::api::{ChatApi, ChatError};
use super::presence::PresenceRoster;
use super::timeline::ChannelTimeline;
use crate::bus::{Body, ConnectionState, Envelope, Subscription};
use crate::types::{ChannelId, ChannelMessage, MessageKind, PresenceEntry};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

struct DeliveryState {
    roster: PresenceRoster,
    timeline: ChannelTimeline,
    /// Bumped on every channel switch; history fetched under an older
    /// selection is discarded
    selection: u64,
}

/// Shared view store. Cheap to clone.
#[derive(Clone)]
pub struct ChatDelivery {
    api: Arc<dyn ChatApi>,
    default_channel: ChannelId,
    state: Arc<RwLock<DeliveryState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl ChatDelivery {
    pub fn new(api: Arc<dyn ChatApi>, default_channel: ChannelId) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            api,
            state: Arc::new(RwLock::new(DeliveryState {
                roster: PresenceRoster::new(),
                timeline: ChannelTimeline::new(default_channel.clone()),
                selection: 0,
            })),
            default_channel,
            revision: Arc::new(revision),
        }
    }

    fn touch(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Fetches the online snapshot and selects the default channel
    pub async fn bootstrap(&self) -> Result<(), ChatError> {
        self.refresh_presence().await?;
        self.select_channel(self.default_channel.clone()).await
    }

    /// Reloads both views after the connection came back: events sent
    /// while it was down are not replayed by the server.
    pub async fn resync(&self) -> Result<(), ChatError> {
        self.refresh_presence().await?;
        self.select_channel(self.active_channel()).await
    }

    async fn refresh_presence(&self) -> Result<(), ChatError> {
        self.state.write().roster.begin_refresh();
        let online = match self.api.list_online_users().await {
            Ok(online) => online,
            Err(e) => {
                self.state.write().roster.abandon_refresh();
                return Err(e);
            }
        };

        let count = online.len();
        self.state.write().roster.seed(online);
        tracing::info!(online = count, "Presence snapshot loaded");
        self.touch();
        Ok(())
    }

    /// Switches the active channel: the sequence is discarded and re-seeded
    /// from history. Bus messages for the new channel that arrive while the
    /// history is in flight are kept.
    pub async fn select_channel(&self, channel_id: ChannelId) -> Result<(), ChatError> {
        let selection = {
            let mut state = self.state.write();
            state.selection += 1;
            state.timeline = ChannelTimeline::new(channel_id.clone());
            state.selection
        };
        self.touch();

        let history = self.api.list_messages(&channel_id).await?;

        let added = {
            let mut state = self.state.write();
            if state.selection != selection {
                tracing::debug!(channel = %channel_id, "Discarding stale history");
                return Ok(());
            }
            state.timeline.extend(history)
        };
        tracing::debug!(channel = %channel_id, added, "Channel history loaded");
        self.touch();
        Ok(())
    }

    /// Posts to the active channel and appends the stored message once the
    /// server acknowledged it. The bus echo of the same id is a no-op.
    pub async fn send_message(
        &self,
        content: &str,
        kind: MessageKind,
    ) -> Result<ChannelMessage, ChatError> {
        let channel_id = self.active_channel();
        let message = self.api.post_message(&channel_id, content, kind).await?;

        if self.state.write().timeline.insert(message.clone()) {
            self.touch();
        }
        Ok(message)
    }

    /// Applies one bus envelope to the views
    pub fn apply(&self, envelope: &Envelope) {
        let changed = {
            let mut state = self.state.write();
            match &envelope.body {
                Body::NewMessage {
                    channel_id,
                    message,
                } if channel_id == state.timeline.channel_id() => {
                    state.timeline.insert(message.clone())
                }
                Body::NewMessage { .. } => false,
                Body::UserJoined { user } => {
                    tracing::debug!(user = %user.id, "User joined");
                    state.roster.join(user.clone());
                    true
                }
                Body::UserLeft { user_id } => {
                    tracing::debug!(user = %user_id, "User left");
                    state.roster.leave(user_id)
                }
                _ => false,
            }
        };
        if changed {
            self.touch();
        }
    }

    /// Drains a bus subscription until it closes
    pub async fn run(self, mut events: Subscription) {
        while let Some(envelope) = events.recv().await {
            self.apply(&envelope);
        }
        tracing::debug!("Chat delivery stopped");
    }

    /// Resyncs on every bus session `sessions` has not seen yet, until the
    /// bus is closed
    pub async fn follow_reconnects(
        self,
        mut sessions: watch::Receiver<u64>,
        mut connection: watch::Receiver<ConnectionState>,
    ) {
        loop {
            tokio::select! {
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = *sessions.borrow_and_update();
                    tracing::info!(session, "Bus reconnected, resyncing chat");
                    if let Err(e) = self.resync().await {
                        tracing::warn!(session, "Resync failed: {}", e);
                    }
                }
                _ = async {
                    let _ = connection.wait_for(|s| *s == ConnectionState::Closed).await;
                } => break,
            }
        }
        tracing::debug!("Stopped following reconnects");
    }

    pub fn active_channel(&self) -> ChannelId {
        self.state.read().timeline.channel_id().clone()
    }

    pub fn messages(&self) -> Vec<ChannelMessage> {
        self.state.read().timeline.messages()
    }

    pub fn online_users(&self) -> Vec<PresenceEntry> {
        self.state.read().roster.entries()
    }

    /// Changes whenever either view changes
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::RelayHub;
    use crate::types::{Channel, MessageId, UserId, UserProfile};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use tokio::sync::Notify;

    fn message(channel: &str, id: u64) -> ChannelMessage {
        ChannelMessage {
            id: MessageId(id),
            channel_id: ChannelId::new(channel),
            sender_id: UserId::new("bob"),
            sender_username: "bob".to_string(),
            sender_avatar: None,
            content: format!("m{id}"),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
        }
    }

    fn new_message(channel: &str, id: u64) -> Envelope {
        Envelope::new(Body::NewMessage {
            channel_id: ChannelId::new(channel),
            message: message(channel, id),
        })
    }

    /// Serves fixed histories; `slow` channels (and the presence snapshot,
    /// with `slow_presence`) wait for `release`
    #[derive(Default)]
    struct ScriptedApi {
        histories: HashMap<String, Vec<ChannelMessage>>,
        slow: Vec<String>,
        slow_presence: bool,
        release: Notify,
    }

    #[async_trait]
    impl ChatApi for ScriptedApi {
        async fn list_channels(&self) -> Result<Vec<Channel>, ChatError> {
            Ok(Vec::new())
        }

        async fn list_messages(&self, channel_id: &ChannelId) -> Result<Vec<ChannelMessage>, ChatError> {
            if self.slow.iter().any(|c| c == channel_id.as_str()) {
                self.release.notified().await;
            }
            Ok(self
                .histories
                .get(channel_id.as_str())
                .cloned()
                .unwrap_or_default())
        }

        async fn post_message(
            &self,
            _channel_id: &ChannelId,
            _content: &str,
            _kind: MessageKind,
        ) -> Result<ChannelMessage, ChatError> {
            Err(ChatError::EmptyContent)
        }

        async fn list_online_users(&self) -> Result<Vec<PresenceEntry>, ChatError> {
            if self.slow_presence {
                self.release.notified().await;
            }
            Ok(vec![UserProfile::new("bob", "bob").into()])
        }
    }

    fn ids(delivery: &ChatDelivery) -> Vec<u64> {
        delivery.messages().iter().map(|m| m.id.0).collect()
    }

    #[tokio::test]
    async fn test_history_gap_filled_by_bus() {
        let mut api = ScriptedApi::default();
        api.histories
            .insert("general".to_string(), vec![message("general", 1), message("general", 3)]);
        let delivery = ChatDelivery::new(Arc::new(api), ChannelId::new("general"));

        delivery.bootstrap().await.unwrap();
        assert_eq!(ids(&delivery), vec![1, 3]);

        delivery.apply(&new_message("general", 2));
        assert_eq!(ids(&delivery), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_other_channel_events_filtered() {
        let delivery = ChatDelivery::new(Arc::new(ScriptedApi::default()), ChannelId::new("general"));
        delivery.bootstrap().await.unwrap();

        delivery.apply(&new_message("random", 1));
        assert!(delivery.messages().is_empty());
    }

    #[tokio::test]
    async fn test_presence_follows_events() {
        let delivery = ChatDelivery::new(Arc::new(ScriptedApi::default()), ChannelId::new("general"));
        delivery.bootstrap().await.unwrap();
        assert_eq!(delivery.online_users().len(), 1);

        delivery.apply(&Envelope::new(Body::UserJoined {
            user: UserProfile::new("carol", "carol"),
        }));
        delivery.apply(&Envelope::new(Body::UserLeft {
            user_id: UserId::new("bob"),
        }));

        let online: Vec<UserId> = delivery.online_users().into_iter().map(|e| e.user_id).collect();
        assert_eq!(online, vec![UserId::new("carol")]);
    }

    fn online(delivery: &ChatDelivery) -> Vec<UserId> {
        delivery.online_users().into_iter().map(|e| e.user_id).collect()
    }

    #[tokio::test]
    async fn test_join_before_bootstrap_survives_snapshot() {
        let delivery = ChatDelivery::new(Arc::new(ScriptedApi::default()), ChannelId::new("general"));
        delivery.apply(&Envelope::new(Body::UserJoined {
            user: UserProfile::new("carol", "carol"),
        }));

        delivery.bootstrap().await.unwrap();
        assert_eq!(online(&delivery), vec![UserId::new("bob"), UserId::new("carol")]);
    }

    #[tokio::test]
    async fn test_presence_events_during_snapshot_fetch_kept() {
        let api = Arc::new(ScriptedApi {
            slow_presence: true,
            ..ScriptedApi::default()
        });
        let delivery = ChatDelivery::new(api.clone(), ChannelId::new("general"));

        let pending = {
            let delivery = delivery.clone();
            tokio::spawn(async move { delivery.bootstrap().await })
        };
        tokio::task::yield_now().await;

        // The snapshot still lists bob and misses carol
        delivery.apply(&Envelope::new(Body::UserJoined {
            user: UserProfile::new("carol", "carol"),
        }));
        delivery.apply(&Envelope::new(Body::UserLeft {
            user_id: UserId::new("bob"),
        }));
        api.release.notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(online(&delivery), vec![UserId::new("carol")]);
    }

    #[tokio::test]
    async fn test_resync_reloads_active_channel() {
        let hub = RelayHub::default();
        let alice = UserProfile::new("alice", "alice");
        let bob = hub.directory_for(UserProfile::new("bob", "bob"));
        let delivery = ChatDelivery::new(
            Arc::new(hub.directory_for(alice)),
            ChannelId::new("general"),
        );
        delivery.bootstrap().await.unwrap();

        // Posted without a bus, as if the connection were down
        let missed = bob
            .post_message(&ChannelId::new("general"), "while away", MessageKind::Text)
            .await
            .unwrap();
        assert!(delivery.messages().is_empty());

        delivery.resync().await.unwrap();
        assert_eq!(ids(&delivery), vec![missed.id.0]);
        assert_eq!(delivery.active_channel(), ChannelId::new("general"));
    }

    #[tokio::test]
    async fn test_stale_history_discarded_after_switch() {
        let mut api = ScriptedApi::default();
        api.histories.insert("slow".to_string(), vec![message("slow", 1)]);
        api.histories.insert("fast".to_string(), vec![message("fast", 5)]);
        api.slow.push("slow".to_string());
        let api = Arc::new(api);
        let delivery = ChatDelivery::new(api.clone(), ChannelId::new("general"));

        let pending = {
            let delivery = delivery.clone();
            tokio::spawn(async move { delivery.select_channel(ChannelId::new("slow")).await })
        };
        tokio::task::yield_now().await;

        delivery.select_channel(ChannelId::new("fast")).await.unwrap();
        api.release.notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(delivery.active_channel(), ChannelId::new("fast"));
        assert_eq!(ids(&delivery), vec![5]);
    }

    #[tokio::test]
    async fn test_local_send_not_duplicated_by_echo() {
        let hub = RelayHub::default();
        let alice = UserProfile::new("alice", "alice");
        let delivery = ChatDelivery::new(
            Arc::new(hub.directory_for(alice.clone())),
            ChannelId::new("general"),
        );
        delivery.bootstrap().await.unwrap();

        let sent = delivery.send_message("hello", MessageKind::Text).await.unwrap();
        assert_eq!(ids(&delivery), vec![sent.id.0]);

        delivery.apply(&Envelope::new(Body::NewMessage {
            channel_id: ChannelId::new("general"),
            message: sent.clone(),
        }));
        assert_eq!(delivery.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_revision_bumps_on_change() {
        let delivery = ChatDelivery::new(Arc::new(ScriptedApi::default()), ChannelId::new("general"));
        let rx = delivery.watch_revision();
        let before = *rx.borrow();
        delivery.apply(&Envelope::new(Body::UserJoined {
            user: UserProfile::new("dave", "dave"),
        }));
        assert!(*rx.borrow() > before);
    }
}
