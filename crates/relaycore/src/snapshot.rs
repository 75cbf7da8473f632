use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;
use crate::record::RecordId;

/// Telegram user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RelayError::validation("no user_id"));
        }
        s.parse::<i64>()
            .map(UserId)
            .map_err(|_| RelayError::validation(format!("invalid user_id '{}'", s)))
    }
}

/// One order as the bot reports it inside a user snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: RecordId,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Full per-user data snapshot pushed by the bot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    #[serde(default)]
    pub orders_count: u64,
    #[serde(default)]
    pub messages_count: u64,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserSnapshot {
    /// True when the snapshot carries no data at all.
    pub fn is_empty(&self) -> bool {
        self.orders_count == 0 && self.messages_count == 0 && self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_id_parse() {
        assert_eq!("585028258".parse::<UserId>().unwrap(), UserId(585028258));
        assert!("".parse::<UserId>().is_err());
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn test_snapshot_defaults_and_extra_fields() {
        let snapshot: UserSnapshot = serde_json::from_value(json!({
            "orders_count": 2,
            "orders": [{"id": 10, "status": "new", "total": 300}],
            "balance": 12
        }))
        .unwrap();

        assert_eq!(snapshot.orders_count, 2);
        assert_eq!(snapshot.messages_count, 0);
        assert_eq!(snapshot.orders[0].status.as_deref(), Some("new"));
        assert_eq!(snapshot.orders[0].details.get("total"), Some(&json!(300)));
        assert_eq!(snapshot.extra.get("balance"), Some(&json!(12)));
        assert!(!snapshot.is_empty());
        assert!(UserSnapshot::default().is_empty());
    }
}
