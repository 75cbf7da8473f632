//! Integration tests for full relay flows (ingest -> store -> detect -> fan-out)
//!
//! Run with: cargo test -p relaycore --test relay_flow_test

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use relaycore::notifier::{Notifier, NotifyOutcome, WebAppAnswer};
use relaycore::{Audience, Relay, RelayConfig, UserId, UserSnapshot, WebAppSubmission};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Answer { query_id: String, text: String },
    Admin(String),
}

/// Notifier that records every call and answers with a fixed outcome.
struct RecordingNotifier {
    calls: Mutex<Vec<Call>>,
    outcome: NotifyOutcome,
}

impl RecordingNotifier {
    fn new(outcome: NotifyOutcome) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            outcome,
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn answer_web_app_query(&self, query_id: &str, answer: WebAppAnswer) -> NotifyOutcome {
        self.calls.lock().push(Call::Answer {
            query_id: query_id.to_string(),
            text: answer.text,
        });
        self.outcome.clone()
    }

    async fn notify_admin(&self, text: &str) -> NotifyOutcome {
        self.calls.lock().push(Call::Admin(text.to_string()));
        self.outcome.clone()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
}

fn relay_with(config: RelayConfig, notifier: Arc<RecordingNotifier>) -> Relay {
    Relay::new(config, notifier).unwrap()
}

fn relay() -> (Relay, Arc<RecordingNotifier>) {
    let notifier = RecordingNotifier::new(NotifyOutcome::Delivered);
    (relay_with(RelayConfig::default(), Arc::clone(&notifier)), notifier)
}

fn frame_json(data: &str) -> Value {
    serde_json::from_str(data).unwrap()
}

// ============================================================================
// Record Ingestion Tests
// ============================================================================

mod ingestion_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identical_review_with_later_timestamp_is_not_an_update() {
        let (relay, _) = relay();
        let mut global = relay.subscribe(Audience::Global);
        global.try_recv();

        let first = relay
            .ingest_bot_data_at(
                "reviews",
                json!({"id": 7, "rating": 5, "timestamp": "2024-07-01T09:00:00Z"}),
                t0(),
            )
            .unwrap();
        assert!(first.changed);
        assert_eq!(global.try_recv().unwrap().event, "data_update");

        let second = relay
            .ingest_bot_data_at(
                "reviews",
                json!({"id": 7, "rating": 5, "timestamp": "2024-07-01T10:00:00Z"}),
                t0(),
            )
            .unwrap();
        assert!(!second.changed);
        assert!(global.try_recv().is_none());

        let view = relay.category("reviews").unwrap();
        assert_eq!(view.count, 1);
        assert_eq!(view.data[0]["id"], json!(7));
        assert_eq!(view.data[0]["rating"], json!(5));
    }

    #[test]
    fn test_batches_keep_newest_regardless_of_order() {
        let older = json!({"id": "r1", "text": "old", "timestamp": "2024-07-01T09:00:00Z"});
        let newer = json!({"id": "r1", "text": "new", "timestamp": "2024-07-01T11:00:00Z"});

        for batches in [[older.clone(), newer.clone()], [newer.clone(), older.clone()]] {
            let (relay, _) = relay();
            for batch in batches {
                relay.ingest_bot_data("requests", json!([batch])).unwrap();
            }
            let view = relay.category("requests").unwrap();
            assert_eq!(view.count, 1);
            assert_eq!(view.data[0]["text"], json!("new"));
        }
    }

    #[test]
    fn test_orders_are_replaced_wholesale() {
        let (relay, _) = relay();
        relay
            .ingest_bot_data("orders", json!([{"id": 1}, {"id": 2}, {"id": 3}]))
            .unwrap();
        relay.ingest_bot_data("orders", json!([{"id": 4}])).unwrap();

        let view = relay.category("orders").unwrap();
        assert_eq!(view.count, 1);
        assert_eq!(view.data[0]["id"], json!(4));
    }

    #[test]
    fn test_stats_and_dump_agree() {
        let (relay, _) = relay();
        relay.ingest_bot_data("reviews", json!([{"id": 1}, {"id": 2}])).unwrap();
        relay.ingest_bot_data("rating", json!(4.9)).unwrap();

        let dump = relay.dump();
        assert_eq!(dump.stats.total, 3);
        assert_eq!(dump.data[&relaycore::Category::Rating], json!(4.9));
        assert_eq!(dump.data[&relaycore::Category::Orders], json!([]));
        assert_eq!(dump.stats, relay.stats());
    }
}

// ============================================================================
// Change Detection & Delivery Tests
// ============================================================================

mod delivery_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(orders_count: u64, messages_count: u64) -> UserSnapshot {
        UserSnapshot {
            orders_count,
            messages_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_changes_fan_out_to_every_channel() {
        let (relay, _) = relay();
        let user = UserId(100);
        let mut tabs: Vec<_> = (0..3).map(|_| relay.subscribe(Audience::User(user))).collect();
        for tab in tabs.iter_mut() {
            assert_eq!(tab.try_recv().unwrap().event, "connected");
        }

        relay.ingest_user_snapshot(user, snapshot(2, 0));
        let receipt = relay.ingest_user_snapshot(user, snapshot(5, 0));
        assert_eq!(receipt.events, vec!["new_orders"]);
        assert_eq!(receipt.delivered, 3);

        for tab in tabs.iter_mut() {
            assert_eq!(tab.try_recv().unwrap().event, "data_ready");
            let frame = tab.try_recv().unwrap();
            assert_eq!(frame.event, "new_orders");
            assert_eq!(frame_json(&frame.data)["count"], json!(3));
        }
    }

    #[test]
    fn test_closed_tab_does_not_stop_siblings() {
        let (relay, _) = relay();
        let user = UserId(7);
        let mut a = relay.subscribe(Audience::User(user));
        let closed = relay.subscribe(Audience::User(user));
        let mut c = relay.subscribe(Audience::User(user));
        drop(closed);
        assert_eq!(relay.channel_count(), 2);

        let receipt = relay.ingest_user_snapshot(user, snapshot(1, 0));
        assert_eq!(receipt.delivered, 2);
        assert_eq!(receipt.queued, 0);
        for tab in [&mut a, &mut c] {
            tab.try_recv();
            assert_eq!(tab.try_recv().unwrap().event, "data_ready");
        }
    }

    #[test]
    fn test_poll_drains_queue_once() {
        let (relay, _) = relay();
        let user = UserId(55);

        relay.ingest_user_snapshot(user, snapshot(1, 1));
        relay.ingest_user_snapshot(user, snapshot(1, 4));

        let first: Vec<&str> = relay.poll(user).iter().map(|e| e.kind.name()).collect();
        assert_eq!(first, vec!["data_ready", "new_messages"]);
        assert!(relay.poll(user).is_empty());
    }

    #[test]
    fn test_unchanged_snapshot_publishes_nothing() {
        let (relay, _) = relay();
        let user = UserId(1);
        relay.ingest_user_snapshot(user, snapshot(3, 3));
        relay.poll(user);

        let receipt = relay.ingest_user_snapshot(user, snapshot(3, 3));
        assert!(receipt.events.is_empty());
        assert_eq!(relay.pending_count(user), 0);
    }

    #[test]
    fn test_user_events_do_not_reach_global_channels() {
        let (relay, _) = relay();
        let mut global = relay.subscribe(Audience::Global);
        global.try_recv();

        relay.ingest_user_snapshot(UserId(1), snapshot(1, 0));
        assert!(global.try_recv().is_none());
    }
}

// ============================================================================
// Mini App Submission Tests
// ============================================================================

mod webapp_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_query_answer_and_success_notification() {
        let (relay, notifier) = relay();
        let user = UserId(585028258);
        let mut tab = relay.subscribe(Audience::User(user));
        tab.try_recv();

        let receipt = relay
            .ingest_webapp(WebAppSubmission {
                init_data: Some("query_id=AAH".into()),
                payload: Some(json!({
                    "type": "review",
                    "id": 7,
                    "rating": 5,
                    "userData": {"id": 585028258, "first_name": "Ann"}
                })),
                query_id: Some("AAH".into()),
            })
            .await
            .unwrap();

        assert!(receipt.notifier.is_delivered());
        assert_eq!(relay.category("reviews").unwrap().count, 1);

        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Answer { query_id, text } => {
                assert_eq!(query_id, "AAH");
                assert!(text.contains("\"rating\": 5"));
            }
            other => panic!("unexpected call {:?}", other),
        }

        let frame = tab.try_recv().unwrap();
        assert_eq!(frame.event, "notification");
        assert_eq!(frame_json(&frame.data)["level"], json!("success"));
    }

    #[tokio::test]
    async fn test_without_query_id_admin_is_notified() {
        let (relay, notifier) = relay();
        relay
            .ingest_webapp(WebAppSubmission {
                payload: Some(json!({"type": "feedback", "text": "hello"})),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(relay.category("updates").unwrap().count, 1);
        match notifier.calls().as_slice() {
            [Call::Admin(text)] => assert!(text.starts_with("Mini App data (feedback)")),
            other => panic!("unexpected calls {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_answer_is_reported_not_raised() {
        let notifier = RecordingNotifier::new(NotifyOutcome::Failed("query is too old".into()));
        let relay = relay_with(RelayConfig::default(), Arc::clone(&notifier));
        let user = UserId(3);
        let mut tab = relay.subscribe(Audience::User(user));
        tab.try_recv();

        let receipt = relay
            .ingest_webapp(WebAppSubmission {
                payload: Some(json!({"type": "order", "id": 1, "userData": {"id": 3}})),
                query_id: Some("Q".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(receipt.notifier, NotifyOutcome::Failed("query is too old".into()));
        assert!(tab.try_recv().is_none());
        assert_eq!(relay.category("orders").unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_attached_snapshot_runs_change_detection() {
        let (relay, _) = relay();
        let receipt = relay
            .ingest_webapp(WebAppSubmission {
                payload: Some(json!({
                    "type": "request",
                    "id": "q1",
                    "userData": {"id": 9},
                    "snapshot": {"orders_count": 1, "messages_count": 0}
                })),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(receipt.events, vec!["data_ready"]);
        assert_eq!(relay.poll(UserId(9)).len(), 1);
    }
}

// ============================================================================
// Maintenance Tests
// ============================================================================

mod maintenance_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_presence_timeout_removes_user_and_channels() {
        let (relay, _) = relay();
        relay.register_at(UserId(1), t0());
        relay.register_at(UserId(2), t0() + Duration::minutes(10));
        let mut tab = relay.subscribe(Audience::User(UserId(1)));
        tab.try_recv();

        let report = relay.maintainer().presence_sweep_at(t0() + Duration::minutes(20));
        assert_eq!(report.evicted, vec![UserId(1)]);
        assert_eq!(relay.channel_count(), 0);
        assert!(tab.try_recv().is_none());

        let active: Vec<UserId> = relay
            .active_users_at(t0() + Duration::minutes(20))
            .iter()
            .map(|e| e.user_id)
            .collect();
        assert_eq!(active, vec![UserId(2)]);
    }

    #[test]
    fn test_retention_evicts_to_cap_keeping_newest() {
        let notifier = RecordingNotifier::new(NotifyOutcome::Delivered);
        let relay = relay_with(
            RelayConfig {
                category_cap: 2,
                ..Default::default()
            },
            notifier,
        );
        relay
            .ingest_bot_data(
                "chat_messages",
                json!([
                    {"id": 1, "timestamp": "2024-07-01T09:03:00Z"},
                    {"id": 2, "timestamp": "2024-07-01T09:01:00Z"},
                    {"id": 3, "timestamp": "2024-07-01T09:02:00Z"},
                    {"timestamp": "2024-06-01T09:00:00Z"}
                ]),
            )
            .unwrap();

        let report = relay.maintainer().retention_sweep_at(t0() + Duration::hours(1));
        assert_eq!(report.expired, 1);
        assert_eq!(report.capped, 1);

        let ids: Vec<Value> = relay
            .category("chat_messages")
            .unwrap()
            .data
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(3)]);
    }
}
