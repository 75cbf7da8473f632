use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::category::{Category, MergeStrategy, PolicyTable};
use crate::error::{RelayError, RelayResult};

/// Reference defaults
pub mod defaults {
    /// A user without heartbeat or data push for this long is inactive
    pub const INACTIVITY_TIMEOUT_SECS: u64 = 15 * 60;

    /// Cached per-user snapshots older than this are reported as stale
    pub const SNAPSHOT_STALENESS_SECS: u64 = 5 * 60;

    pub const PRESENCE_SWEEP_SECS: u64 = 5 * 60;
    pub const DEDUP_SWEEP_SECS: u64 = 10 * 60;
    pub const RETENTION_SWEEP_SECS: u64 = 30 * 60;

    /// Records older than this are dropped by the retention sweep
    pub const RETENTION_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

    /// Maximum records kept per sequence category
    pub const CATEGORY_CAP: usize = 1000;

    /// Maximum undelivered events kept per user
    pub const PENDING_QUEUE_CAP: usize = 500;
}

/// Relay tunables. Every field has a default; a config file only needs the
/// keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub inactivity_timeout_secs: u64,
    pub snapshot_staleness_secs: u64,
    pub presence_sweep_secs: u64,
    pub dedup_sweep_secs: u64,
    pub retention_sweep_secs: u64,
    pub retention_window_secs: u64,
    pub category_cap: usize,
    pub pending_queue_cap: usize,
    /// Per-category merge strategy overrides
    pub categories: HashMap<Category, MergeStrategy>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: defaults::INACTIVITY_TIMEOUT_SECS,
            snapshot_staleness_secs: defaults::SNAPSHOT_STALENESS_SECS,
            presence_sweep_secs: defaults::PRESENCE_SWEEP_SECS,
            dedup_sweep_secs: defaults::DEDUP_SWEEP_SECS,
            retention_sweep_secs: defaults::RETENTION_SWEEP_SECS,
            retention_window_secs: defaults::RETENTION_WINDOW_SECS,
            category_cap: defaults::CATEGORY_CAP,
            pending_queue_cap: defaults::PENDING_QUEUE_CAP,
            categories: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        secs_to_chrono(self.inactivity_timeout_secs)
    }

    pub fn snapshot_staleness(&self) -> chrono::Duration {
        secs_to_chrono(self.snapshot_staleness_secs)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        secs_to_chrono(self.retention_window_secs)
    }

    pub fn presence_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence_sweep_secs.max(1))
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dedup_sweep_secs.max(1))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs.max(1))
    }

    /// Rejects time windows that cannot be subtracted from the current time.
    pub fn validate(&self) -> RelayResult<()> {
        self.validate_at(Utc::now())
    }

    pub fn validate_at(&self, now: DateTime<Utc>) -> RelayResult<()> {
        let windows = [
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("snapshot_staleness_secs", self.snapshot_staleness_secs),
            ("retention_window_secs", self.retention_window_secs),
        ];
        for (key, secs) in windows {
            let in_range = try_secs_to_chrono(secs)
                .and_then(|window| now.checked_sub_signed(window))
                .is_some();
            if !in_range {
                return Err(RelayError::validation(format!("{} is out of range: {}", key, secs)));
            }
        }
        Ok(())
    }

    /// Resolves the policy table, rejecting overrides that change a category's shape.
    pub fn policy_table(&self) -> RelayResult<PolicyTable> {
        PolicyTable::with_overrides(&self.categories)
    }
}

fn try_secs_to_chrono(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

fn secs_to_chrono(secs: u64) -> chrono::Duration {
    try_secs_to_chrono(secs).unwrap_or(chrono::Duration::MAX)
}
