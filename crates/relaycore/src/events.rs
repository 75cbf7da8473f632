//! Event vocabulary pushed to live channels and poll queues.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use strum::IntoStaticStr;

use crate::category::Category;
use crate::record::RecordId;
use crate::snapshot::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub order_id: RecordId,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
}

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    /// First frame on every freshly opened channel
    Connected { audience: String },
    DataUpdate { category: Category, count: usize },
    NewOrders { count: u64, orders: Vec<Order> },
    NewMessages { count: u64 },
    StatusChanges { changes: Vec<StatusChange> },
    DataReady { orders_count: u64, messages_count: u64 },
    Notification { level: NotificationLevel, message: String },
}

impl EventKind {
    /// Global events go to every global channel in addition to the user's own.
    pub fn is_global(&self) -> bool {
        matches!(self, EventKind::DataUpdate { .. })
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// An event stamped with its sequence number and creation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RelayEvent {
    pub fn new(seq: u64, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self { seq, at, kind }
    }

    /// Serializes once for fan-out to any number of channels.
    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        Ok(Frame {
            event: self.kind.name(),
            data: serde_json::to_string(self)?.into(),
        })
    }
}

/// A serialized event ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Event name (the `type` tag), used as the SSE event field
    pub event: &'static str,
    pub data: Arc<str>,
}
