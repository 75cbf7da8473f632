//! Per-user liveness tracking and the per-user snapshot cache.
//!
//! Presence is independent of any connection: a user is active while their
//! last heartbeat or data push is younger than the inactivity timeout.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::snapshot::{UserId, UserSnapshot};

#[derive(Debug, Clone)]
pub struct UserPresence {
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// `userData` last submitted from the Mini App
    pub profile: Option<Value>,
    pub last_payload_type: Option<String>,
    pub snapshot: Option<UserSnapshot>,
    pub snapshot_at: Option<DateTime<Utc>>,
}

impl UserPresence {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            registered_at: now,
            last_seen: now,
            profile: None,
            last_payload_type: None,
            snapshot: None,
            snapshot_at: None,
        }
    }
}

/// One row of [`PresenceTracker::active_list`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payload_type: Option<String>,
}

pub struct PresenceTracker {
    users: DashMap<UserId, UserPresence>,
    inactivity_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(inactivity_timeout: Duration) -> Self {
        Self {
            users: DashMap::new(),
            inactivity_timeout,
        }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// Creates or refreshes a user's presence. Idempotent.
    pub fn register(&self, user: UserId) {
        self.register_at(user, Utc::now());
    }

    pub fn register_at(&self, user: UserId, now: DateTime<Utc>) {
        self.users
            .entry(user)
            .and_modify(|p| p.last_seen = now)
            .or_insert_with(|| UserPresence::new(now));
    }

    /// Refreshes last-seen. Returns `false` (not an error) for unknown users.
    pub fn heartbeat(&self, user: UserId) -> bool {
        self.heartbeat_at(user, Utc::now())
    }

    pub fn heartbeat_at(&self, user: UserId, now: DateTime<Utc>) -> bool {
        match self.users.get_mut(&user) {
            Some(mut presence) => {
                presence.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, user: UserId) -> bool {
        self.is_active_at(user, Utc::now())
    }

    pub fn is_active_at(&self, user: UserId, now: DateTime<Utc>) -> bool {
        self.users
            .get(&user)
            .is_some_and(|p| self.active_since(p.last_seen, now))
    }

    fn active_since(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_seen < self.inactivity_timeout
    }

    /// Lazily yields every tracked user with a derived activity flag.
    ///
    /// Recomputed on each call; nothing is cached between calls.
    pub fn active_list(&self) -> impl Iterator<Item = PresenceEntry> + '_ {
        self.active_list_at(Utc::now())
    }

    pub fn active_list_at(&self, now: DateTime<Utc>) -> impl Iterator<Item = PresenceEntry> + '_ {
        self.users.iter().map(move |entry| PresenceEntry {
            user_id: *entry.key(),
            registered_at: entry.registered_at,
            last_seen: entry.last_seen,
            is_active: self.active_since(entry.last_seen, now),
            last_payload_type: entry.last_payload_type.clone(),
        })
    }

    /// Stores the Mini App profile of a user and refreshes their presence.
    pub fn record_profile_at(&self, user: UserId, profile: Value, payload_type: Option<String>, now: DateTime<Utc>) {
        let mut presence = self.users.entry(user).or_insert_with(|| UserPresence::new(now));
        presence.last_seen = now;
        presence.profile = Some(profile);
        presence.last_payload_type = payload_type;
    }

    /// Swaps in a new snapshot, refreshing presence, and returns the previous one.
    pub fn replace_snapshot_at(&self, user: UserId, snapshot: UserSnapshot, now: DateTime<Utc>) -> Option<UserSnapshot> {
        let mut presence = self.users.entry(user).or_insert_with(|| UserPresence::new(now));
        presence.last_seen = now;
        presence.snapshot_at = Some(now);
        presence.snapshot.replace(snapshot)
    }

    /// Cached snapshot if it is younger than `max_age`.
    pub fn fresh_snapshot_at(&self, user: UserId, max_age: Duration, now: DateTime<Utc>) -> Option<UserSnapshot> {
        let presence = self.users.get(&user)?;
        let taken_at = presence.snapshot_at?;
        if now - taken_at < max_age {
            presence.snapshot.clone()
        } else {
            None
        }
    }

    pub fn profile(&self, user: UserId) -> Option<Value> {
        self.users.get(&user)?.profile.clone()
    }

    /// Removes every user that is no longer active and returns their ids.
    pub fn evict_inactive_at(&self, now: DateTime<Utc>) -> Vec<UserId> {
        self.evict_inactive_with(now, |_| {})
    }

    /// Like [`evict_inactive_at`](Self::evict_inactive_at), running `on_evict`
    /// for each user while their entry is still locked.
    ///
    /// A register or heartbeat for that user blocks until `on_evict` returns
    /// and the entry is gone, so cleanup can never hit a fresh session.
    /// `on_evict` must not call back into this tracker.
    pub fn evict_inactive_with<F>(&self, now: DateTime<Utc>, mut on_evict: F) -> Vec<UserId>
    where
        F: FnMut(UserId),
    {
        let stale: Vec<UserId> = self
            .users
            .iter()
            .filter(|entry| !self.active_since(entry.last_seen, now))
            .map(|entry| *entry.key())
            .collect();

        // Re-check under the shard lock so a heartbeat racing the sweep wins.
        stale
            .into_iter()
            .filter(|&user| match self.users.entry(user) {
                Entry::Occupied(entry) if !self.active_since(entry.get().last_seen, now) => {
                    on_evict(user);
                    entry.remove();
                    true
                }
                _ => false,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn active_count_at(&self, now: DateTime<Utc>) -> usize {
        self.active_list_at(now).filter(|e| e.is_active).count()
    }
}
