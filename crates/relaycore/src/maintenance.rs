//! Background cache maintenance: presence purge, dedup and retention sweeps.
//!
//! Each sweep is a synchronous unit of work over shared state; the scheduler
//! only decides when to run them. Tests call the `*_at` variants directly.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::Broadcaster;
use crate::config::RelayConfig;
use crate::presence::PresenceTracker;
use crate::record::Record;
use crate::snapshot::UserId;
use crate::store::{dedup_by_id, RecordStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceSweepReport {
    pub evicted: Vec<UserId>,
    pub channels_closed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub duplicates: usize,
    pub expired: usize,
    pub capped: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.duplicates + self.expired + self.capped
    }
}

pub struct Maintainer {
    store: Arc<RecordStore>,
    presence: Arc<PresenceTracker>,
    broadcaster: Arc<Broadcaster>,
    config: RelayConfig,
}

impl Maintainer {
    pub fn new(
        store: Arc<RecordStore>,
        presence: Arc<PresenceTracker>,
        broadcaster: Arc<Broadcaster>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            presence,
            broadcaster,
            config,
        }
    }

    pub fn presence_sweep(&self) -> PresenceSweepReport {
        self.presence_sweep_at(Utc::now())
    }

    /// Evicts inactive users, closing their channels and dropping their queues.
    ///
    /// Channels are closed while the user's presence entry is still locked,
    /// so a user re-registering mid-sweep keeps the tab they open afterwards.
    pub fn presence_sweep_at(&self, now: DateTime<Utc>) -> PresenceSweepReport {
        let mut channels_closed = 0;
        let evicted = self
            .presence
            .evict_inactive_with(now, |user| channels_closed += self.broadcaster.disconnect_user(user));

        if evicted.is_empty() {
            debug!("presence sweep: nothing to evict");
        } else {
            info!(users = evicted.len(), channels_closed, "presence sweep evicted inactive users");
        }
        PresenceSweepReport {
            evicted,
            channels_closed,
        }
    }

    /// Collapses same-identifier records in every sequence category.
    pub fn dedup_sweep(&self) -> usize {
        let mut removed = 0;
        self.store.rewrite_sequences(|_, records| {
            let (records, dropped) = dedup_by_id(records);
            removed += dropped;
            records
        });

        if removed > 0 {
            info!(removed, "dedup sweep collapsed duplicate records");
        } else {
            debug!("dedup sweep: no duplicates");
        }
        removed
    }

    pub fn retention_sweep(&self) -> RetentionReport {
        self.retention_sweep_at(Utc::now())
    }

    /// Dedups, drops records past the retention window, then caps each
    /// category, in that order, so capping never evicts newer data ahead
    /// of older duplicates.
    pub fn retention_sweep_at(&self, now: DateTime<Utc>) -> RetentionReport {
        let cutoff = now
            .checked_sub_signed(self.config.retention_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let cap = self.config.category_cap;
        let mut report = RetentionReport::default();

        self.store.rewrite_sequences(|_, records| {
            let (records, duplicates) = dedup_by_id(records);
            report.duplicates += duplicates;

            let before = records.len();
            let records: Vec<Record> = records.into_iter().filter(|r| r.timestamp >= cutoff).collect();
            report.expired += before - records.len();

            let (records, capped) = cap_oldest(records, cap);
            report.capped += capped;
            records
        });

        if report.total() > 0 {
            info!(
                duplicates = report.duplicates,
                expired = report.expired,
                capped = report.capped,
                "retention sweep trimmed records"
            );
        } else {
            debug!("retention sweep: nothing to trim");
        }
        report
    }

    /// Starts the three sweep schedules. They stop when `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let presence_every = self.config.presence_sweep_interval();
        let dedup_every = self.config.dedup_sweep_interval();
        let retention_every = self.config.retention_sweep_interval();
        info!(
            presence_secs = presence_every.as_secs(),
            dedup_secs = dedup_every.as_secs(),
            retention_secs = retention_every.as_secs(),
            "maintenance scheduler started"
        );

        let presence = Arc::clone(&self);
        let dedup = Arc::clone(&self);
        vec![
            schedule(presence_every, shutdown.clone(), move || {
                presence.presence_sweep();
            }),
            schedule(dedup_every, shutdown.clone(), move || {
                dedup.dedup_sweep();
            }),
            schedule(retention_every, shutdown, move || {
                self.retention_sweep();
            }),
        ]
    }
}

fn schedule<F>(every: std::time::Duration, shutdown: CancellationToken, mut sweep: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sweeping an empty cache at boot is pointless.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => sweep(),
            }
        }
    })
}

/// Removes the oldest records by timestamp until at most `cap` remain.
/// Survivors keep their relative order; ties evict the earlier position.
fn cap_oldest(records: Vec<Record>, cap: usize) -> (Vec<Record>, usize) {
    if records.len() <= cap {
        return (records, 0);
    }
    let excess = records.len() - cap;
    let mut by_age: Vec<usize> = (0..records.len()).collect();
    by_age.sort_by_key(|&i| (records[i].timestamp, i));
    let doomed: HashSet<usize> = by_age.into_iter().take(excess).collect();

    let kept = records
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !doomed.contains(i))
        .map(|(_, r)| r)
        .collect();
    (kept, excess)
}
