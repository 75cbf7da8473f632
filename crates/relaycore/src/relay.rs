//! The shared-state handle the HTTP layer drives.
//!
//! `Relay` owns the store, presence tracker and broadcaster and is injected
//! into request handlers behind an `Arc`. Every operation finishes its state
//! changes before any outbound notifier call is awaited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broadcast::{Audience, Broadcaster, Subscription};
use crate::category::Category;
use crate::changes::detect_changes;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventKind, NotificationLevel, RelayEvent};
use crate::maintenance::Maintainer;
use crate::notifier::{truncate_chars, Notifier, NotifyOutcome, WebAppAnswer, MAX_ANSWER_CHARS};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::record::Record;
use crate::snapshot::{UserId, UserSnapshot};
use crate::store::{CategoryValue, IdGenerator, RecordStore, UpsertOutcome};

/// Body of a Mini App submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebAppSubmission {
    #[serde(default)]
    pub init_data: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub query_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebAppReceipt {
    pub category: Category,
    pub outcome: UpsertOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Change events derived from an attached snapshot
    pub events: Vec<&'static str>,
    pub notifier: NotifyOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub category: Category,
    pub count: usize,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReceipt {
    pub user_id: UserId,
    pub events: Vec<&'static str>,
    pub delivered: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryView {
    pub category: Category,
    pub data: Value,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub categories: BTreeMap<Category, usize>,
    pub total: usize,
    pub users_tracked: usize,
    pub users_active: usize,
    pub live_channels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataDump {
    pub data: BTreeMap<Category, Value>,
    pub stats: Stats,
}

/// `userData.id` as Telegram sends it (a number) or as some clients relay
/// it (a numeric string).
fn profile_user_id(id: &Value) -> Option<UserId> {
    match id {
        Value::Number(n) => n.as_i64().map(UserId),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub struct Relay {
    store: Arc<RecordStore>,
    presence: Arc<PresenceTracker>,
    broadcaster: Arc<Broadcaster>,
    maintainer: Arc<Maintainer>,
    notifier: Arc<dyn Notifier>,
    sequence: IdGenerator,
    config: RelayConfig,
}

impl Relay {
    /// Builds empty relay state. Fails on an out-of-range time window or an
    /// invalid category override.
    pub fn new(config: RelayConfig, notifier: Arc<dyn Notifier>) -> RelayResult<Self> {
        config.validate()?;
        let store = Arc::new(RecordStore::new(config.policy_table()?));
        let presence = Arc::new(PresenceTracker::new(config.inactivity_timeout()));
        let broadcaster = Arc::new(Broadcaster::new(config.pending_queue_cap));
        let maintainer = Arc::new(Maintainer::new(
            Arc::clone(&store),
            Arc::clone(&presence),
            Arc::clone(&broadcaster),
            config.clone(),
        ));

        Ok(Self {
            store,
            presence,
            broadcaster,
            maintainer,
            notifier,
            sequence: IdGenerator::new(),
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn maintainer(&self) -> Arc<Maintainer> {
        Arc::clone(&self.maintainer)
    }

    fn stamp(&self, kind: EventKind, now: DateTime<Utc>) -> RelayEvent {
        RelayEvent::new(self.sequence.next_id(), now, kind)
    }

    fn announce_update(&self, category: Category, now: DateTime<Utc>) {
        let count = self.store.count(category);
        let report = self
            .broadcaster
            .publish_global(&self.stamp(EventKind::DataUpdate { category, count }, now));
        debug!(%category, count, delivered = report.delivered, "data_update published");
    }

    // ==================== Ingestion ====================

    pub async fn ingest_webapp(&self, submission: WebAppSubmission) -> RelayResult<WebAppReceipt> {
        self.ingest_webapp_at(submission, Utc::now()).await
    }

    /// Records a Mini App submission, then acknowledges it through the notifier.
    ///
    /// The payload is fully validated before any state is touched.
    pub async fn ingest_webapp_at(&self, submission: WebAppSubmission, now: DateTime<Utc>) -> RelayResult<WebAppReceipt> {
        let payload = match submission.payload {
            Some(Value::Object(payload)) => payload,
            Some(Value::Null) | None => return Err(RelayError::validation("no payload")),
            Some(_) => return Err(RelayError::validation("payload must be a JSON object")),
        };

        let payload_type = payload.get("type").and_then(Value::as_str).map(str::to_string);
        let category = payload_type
            .as_deref()
            .and_then(Category::from_payload_type)
            .unwrap_or(Category::Updates);
        debug_assert!(!self.store.policies().is_scalar(category));

        let profile = payload.get("userData").filter(|v| !v.is_null()).cloned();
        let user = profile.as_ref().and_then(|p| p.get("id")).and_then(profile_user_id);
        let snapshot = match payload.get("snapshot") {
            Some(Value::Null) | None => None,
            Some(raw) => Some(serde_json::from_value::<UserSnapshot>(raw.clone())?),
        };
        if snapshot.is_some() && user.is_none() {
            return Err(RelayError::validation("snapshot requires userData.id"));
        }
        let record = Record::from_object(record_body(&payload, now))?;

        // State changes.
        let outcome = self.store.upsert_one(category, record);
        if outcome.changed() {
            self.announce_update(category, now);
        }
        if let (Some(user), Some(profile)) = (user, profile) {
            self.presence.record_profile_at(user, profile, payload_type.clone(), now);
        }
        let events = match (user, snapshot) {
            (Some(user), Some(snapshot)) => self.ingest_user_snapshot_at(user, snapshot, now).events,
            _ => Vec::new(),
        };
        info!(%category, ?outcome, user_id = ?user.map(|u| u.0), "webapp data received");

        // Outbound call, with no shared state held.
        let text = serde_json::to_string_pretty(&Value::Object(payload)).unwrap_or_default();
        let notifier = match submission.query_id.as_deref().filter(|q| !q.is_empty()) {
            Some(query_id) => {
                let answer = WebAppAnswer::echo(self.store.next_id().to_string(), "Data received", &text);
                let outcome = self.notifier.answer_web_app_query(query_id, answer).await;
                if let (NotifyOutcome::Delivered, Some(user)) = (&outcome, user) {
                    let ack = EventKind::Notification {
                        level: NotificationLevel::Success,
                        message: "Data delivered to the bot".to_string(),
                    };
                    self.broadcaster.publish(user, self.stamp(ack, Utc::now()));
                }
                outcome
            }
            None => {
                let header = format!("Mini App data ({})\n", payload_type.as_deref().unwrap_or("unknown"));
                let body = truncate_chars(&text, MAX_ANSWER_CHARS.saturating_sub(header.chars().count()));
                self.notifier.notify_admin(&format!("{}{}", header, body)).await
            }
        };
        if let NotifyOutcome::Failed(reason) = &notifier {
            warn!(%category, "notifier failed: {}", reason);
        }

        Ok(WebAppReceipt {
            category,
            outcome,
            user_id: user,
            events,
            notifier,
        })
    }

    pub fn ingest_bot_data(&self, category: &str, data: Value) -> RelayResult<IngestReceipt> {
        self.ingest_bot_data_at(category, data, Utc::now())
    }

    /// Folds bot-sourced data into a category per its declared policy.
    ///
    /// Scalar categories take the value as-is; sequence categories take an
    /// array (merged as a batch) or a single object (upserted).
    pub fn ingest_bot_data_at(&self, category: &str, data: Value, now: DateTime<Utc>) -> RelayResult<IngestReceipt> {
        let category = Category::parse(category)?;
        if data.is_null() {
            return Err(RelayError::validation("no data"));
        }

        let changed = if self.store.policies().is_scalar(category) {
            self.store.set_scalar(category, data)?
        } else {
            match data {
                Value::Array(items) => {
                    let records = items
                        .into_iter()
                        .map(|item| match item {
                            Value::Object(object) => Ok(Record::from_object(object)?),
                            _ => Err(RelayError::validation("records must be JSON objects")),
                        })
                        .collect::<RelayResult<Vec<_>>>()?;
                    self.store.merge_batch(category, records)?.changed
                }
                Value::Object(object) => self.store.upsert_one(category, Record::from_object(object)?).changed(),
                _ => return Err(RelayError::validation("records must be JSON objects")),
            }
        };

        let count = self.store.count(category);
        if changed {
            self.announce_update(category, now);
        }
        info!(%category, count, changed, "bot data ingested");
        Ok(IngestReceipt {
            category,
            count,
            changed,
        })
    }

    pub fn ingest_user_snapshot(&self, user: UserId, snapshot: UserSnapshot) -> SnapshotReceipt {
        self.ingest_user_snapshot_at(user, snapshot, Utc::now())
    }

    /// Refreshes presence, diffs against the previous snapshot and pushes
    /// the derived events to the user.
    pub fn ingest_user_snapshot_at(&self, user: UserId, snapshot: UserSnapshot, now: DateTime<Utc>) -> SnapshotReceipt {
        let previous = self.presence.replace_snapshot_at(user, snapshot.clone(), now);
        let changes = detect_changes(previous.as_ref(), &snapshot);

        let mut receipt = SnapshotReceipt {
            user_id: user,
            events: Vec::with_capacity(changes.len()),
            delivered: 0,
            queued: 0,
        };
        for kind in changes {
            receipt.events.push(kind.name());
            let report = self.broadcaster.publish(user, self.stamp(kind, now));
            receipt.delivered += report.delivered;
            receipt.queued += usize::from(report.queued);
        }

        if !receipt.events.is_empty() {
            info!(user_id = user.0, events = ?receipt.events, "snapshot changes published");
        }
        receipt
    }

    // ==================== Queries ====================

    pub fn category(&self, name: &str) -> RelayResult<CategoryView> {
        let category = Category::parse(name)?;
        let value = self.store.get_category(category);
        Ok(CategoryView {
            category,
            count: value.len(),
            data: value.to_json(),
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> Stats {
        let categories: BTreeMap<Category, usize> = self.store.counts().into_iter().collect();
        Stats {
            total: categories.values().sum(),
            categories,
            users_tracked: self.presence.len(),
            users_active: self.presence.active_count_at(now),
            live_channels: self.broadcaster.channel_count(),
        }
    }

    /// Every category's contents plus stats.
    pub fn dump(&self) -> DataDump {
        let data = self
            .store
            .all()
            .into_iter()
            .map(|(category, value): (Category, CategoryValue)| (category, value.to_json()))
            .collect();
        DataDump {
            data,
            stats: self.stats(),
        }
    }

    pub fn cached_snapshot(&self, user: UserId) -> Option<UserSnapshot> {
        self.cached_snapshot_at(user, Utc::now())
    }

    /// The user's cached snapshot if fresher than the staleness window.
    pub fn cached_snapshot_at(&self, user: UserId, now: DateTime<Utc>) -> Option<UserSnapshot> {
        self.presence
            .fresh_snapshot_at(user, self.config.snapshot_staleness(), now)
    }

    // ==================== Presence ====================

    pub fn register(&self, user: UserId) {
        self.register_at(user, Utc::now());
    }

    pub fn register_at(&self, user: UserId, now: DateTime<Utc>) {
        self.presence.register_at(user, now);
        debug!(user_id = user.0, "user registered");
    }

    pub fn heartbeat(&self, user: UserId) -> bool {
        self.presence.heartbeat(user)
    }

    pub fn heartbeat_at(&self, user: UserId, now: DateTime<Utc>) -> bool {
        self.presence.heartbeat_at(user, now)
    }

    pub fn is_active(&self, user: UserId) -> bool {
        self.presence.is_active(user)
    }

    pub fn active_users(&self) -> Vec<PresenceEntry> {
        self.active_users_at(Utc::now())
    }

    pub fn active_users_at(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.presence.active_list_at(now).collect();
        entries.sort_by_key(|e| e.user_id);
        entries
    }

    pub fn profile(&self, user: UserId) -> Option<Value> {
        self.presence.profile(user)
    }

    // ==================== Commands ====================

    /// Clears one named category, or every category for `None`.
    pub fn clear(&self, category: Option<&str>) -> RelayResult<()> {
        let category = category.map(Category::parse).transpose()?;
        self.store.clear(category);
        Ok(())
    }

    // ==================== Delivery ====================

    /// Opens a live channel; the first frame is a `connected` event.
    pub fn subscribe(&self, audience: Audience) -> Subscription {
        let greeting = self.stamp(
            EventKind::Connected {
                audience: audience.to_string(),
            },
            Utc::now(),
        );
        self.broadcaster.subscribe(audience, &greeting)
    }

    /// Drains the user's pending queue. Polling counts as a heartbeat.
    pub fn poll(&self, user: UserId) -> Vec<RelayEvent> {
        self.presence.heartbeat(user);
        self.broadcaster.drain_queue(user)
    }

    pub fn pending_count(&self, user: UserId) -> usize {
        self.broadcaster.pending_count(user)
    }

    pub fn channel_count(&self) -> usize {
        self.broadcaster.channel_count()
    }
}

/// Record body of a Mini App payload: `payload.data` when it is an object,
/// otherwise the payload without its routing keys.
fn record_body(payload: &Map<String, Value>, now: DateTime<Utc>) -> Map<String, Value> {
    let mut body = match payload.get("data") {
        Some(Value::Object(data)) => data.clone(),
        _ => {
            let mut body = payload.clone();
            for key in ["type", "userData", "snapshot"] {
                body.remove(key);
            }
            body
        }
    };
    body.entry("timestamp")
        .or_insert_with(|| Value::String(now.to_rfc3339()));
    body
}
