//! Online-user set

use crate::types::{PresenceEntry, UserId, UserProfile};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Change {
    Joined(UserProfile),
    Left(UserId),
}

/// Users currently online, keyed by user id.
///
/// Events seen while a snapshot is being fetched are applied right away and
/// also kept, then replayed on top of the snapshot once it is seeded. A new
/// roster starts out waiting for its first snapshot.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    entries: HashMap<UserId, PresenceEntry>,
    pending: Option<Vec<Change>>,
}

impl Default for PresenceRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            pending: Some(Vec::new()),
        }
    }

    /// A snapshot fetch is starting
    pub fn begin_refresh(&mut self) {
        self.pending.get_or_insert_with(Vec::new);
    }

    /// The fetch failed; stop recording
    pub fn abandon_refresh(&mut self) {
        self.pending = None;
    }

    pub fn is_refreshing(&self) -> bool {
        self.pending.is_some()
    }

    /// Replaces the set with a fresh snapshot, then replays the events
    /// recorded since the fetch began
    pub fn seed(&mut self, snapshot: Vec<PresenceEntry>) {
        self.entries = snapshot
            .into_iter()
            .filter(|e| e.online)
            .map(|e| (e.user_id.clone(), e))
            .collect();

        for change in self.pending.take().unwrap_or_default() {
            match change {
                Change::Joined(profile) => {
                    self.entries.insert(profile.id.clone(), profile.into());
                }
                Change::Left(user_id) => {
                    self.entries.remove(&user_id);
                }
            }
        }
    }

    /// `user_joined`; an existing entry is refreshed
    pub fn join(&mut self, profile: UserProfile) {
        if let Some(pending) = self.pending.as_mut() {
            pending.push(Change::Joined(profile.clone()));
        }
        self.entries.insert(profile.id.clone(), profile.into());
    }

    /// `user_left`; returns whether the user was known
    pub fn leave(&mut self, user_id: &UserId) -> bool {
        if let Some(pending) = self.pending.as_mut() {
            pending.push(Change::Left(user_id.clone()));
        }
        self.entries.remove(user_id).is_some()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by display name, then id
    pub fn entries(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        entries
    }
}
