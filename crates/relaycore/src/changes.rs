//! Derives discrete push events from two consecutive user snapshots.

use std::collections::HashMap;

use crate::events::{EventKind, StatusChange};
use crate::record::RecordId;
use crate::snapshot::UserSnapshot;

/// Compares `previous` to `current` and returns the events to push.
///
/// Emission order is fixed: `new_orders`, `new_messages`, `status_changes`.
/// A first observation (no previous snapshot) yields a single `data_ready`
/// instead, unless the snapshot carries no data at all.
pub fn detect_changes(previous: Option<&UserSnapshot>, current: &UserSnapshot) -> Vec<EventKind> {
    let Some(previous) = previous else {
        if current.is_empty() {
            return Vec::new();
        }
        return vec![EventKind::DataReady {
            orders_count: current.orders_count,
            messages_count: current.messages_count,
        }];
    };

    let mut events = Vec::new();

    let new_orders = current.orders_count.saturating_sub(previous.orders_count);
    if new_orders > 0 {
        events.push(EventKind::NewOrders {
            count: new_orders,
            orders: current.orders.clone(),
        });
    }

    let new_messages = current.messages_count.saturating_sub(previous.messages_count);
    if new_messages > 0 {
        events.push(EventKind::NewMessages { count: new_messages });
    }

    let changes = status_changes(previous, current);
    if !changes.is_empty() {
        events.push(EventKind::StatusChanges { changes });
    }

    events
}

/// Orders present in both snapshots whose status differs, in current order.
fn status_changes(previous: &UserSnapshot, current: &UserSnapshot) -> Vec<StatusChange> {
    let old: HashMap<&RecordId, &Option<String>> = previous.orders.iter().map(|o| (&o.id, &o.status)).collect();

    current
        .orders
        .iter()
        .filter_map(|order| {
            let old_status = old.get(&order.id)?;
            (**old_status != order.status).then(|| StatusChange {
                order_id: order.id.clone(),
                old_status: (*old_status).clone(),
                new_status: order.status.clone(),
            })
        })
        .collect()
}
