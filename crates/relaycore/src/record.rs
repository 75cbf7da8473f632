use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Record identifier as sent by the bot or the Mini App (`7` or `"r-7"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{}", n),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Text(s.to_string())
    }
}

/// One stored unit of data.
///
/// On the wire a record is a flat JSON object: `id` and `timestamp` are
/// lifted out, every other field is the opaque payload. A missing timestamp
/// defaults to receipt time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(default = "Utc::now", deserialize_with = "flexible_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// RFC 3339 text or integer epoch milliseconds (`Date.now()` on the client).
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(#[serde(with = "chrono::serde::ts_milliseconds")] DateTime<Utc>),
    Text(DateTime<Utc>),
}

fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match WireTimestamp::deserialize(deserializer) {
        Ok(WireTimestamp::Millis(ts) | WireTimestamp::Text(ts)) => Ok(ts),
        Err(_) => Err(serde::de::Error::custom(
            "timestamp must be an RFC 3339 string or epoch milliseconds",
        )),
    }
}

impl Record {
    pub fn new(id: Option<RecordId>, timestamp: DateTime<Utc>, payload: Map<String, Value>) -> Self {
        Self { id, timestamp, payload }
    }

    /// Builds a record from a JSON object, dropping routing-only keys.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, serde_json::Error> {
        object.remove("category");
        serde_json::from_value(Value::Object(object))
    }

    /// Value equality used by upserts: the timestamp is metadata, not content.
    pub fn same_content(&self, other: &Record) -> bool {
        self.id == other.id && self.payload == other.payload
    }

    /// Identifier resolution rule: a strictly later timestamp wins, ties keep
    /// the record already held.
    pub fn supersedes(&self, held: &Record) -> bool {
        self.timestamp > held.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_record_from_flat_object() {
        let value = json!({
            "category": "reviews",
            "id": 7,
            "rating": 5,
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let Value::Object(object) = value else { unreachable!() };
        let record = Record::from_object(object).unwrap();

        assert_eq!(record.id, Some(RecordId::Int(7)));
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert_eq!(record.payload.get("rating"), Some(&json!(5)));
        assert!(!record.payload.contains_key("category"));
    }

    #[test]
    fn test_text_id_and_missing_timestamp() {
        let record: Record = serde_json::from_value(json!({"id": "r-1", "text": "hi"})).unwrap();
        assert_eq!(record.id, Some(RecordId::Text("r-1".into())));
        assert!(record.timestamp <= Utc::now());
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let record: Record =
            serde_json::from_value(json!({"id": 1, "rating": 5, "timestamp": 1719824400000_i64})).unwrap();
        assert_eq!(record.timestamp, Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap());
        assert_eq!(record.payload.get("rating"), Some(&json!(5)));
    }

    #[test]
    fn test_unparseable_timestamp_is_rejected() {
        let err = serde_json::from_value::<Record>(json!({"id": 1, "timestamp": "yesterday"})).unwrap_err();
        assert!(err.to_string().contains("epoch milliseconds"));
        assert!(serde_json::from_value::<Record>(json!({"id": 1, "timestamp": true})).is_err());
    }

    #[test]
    fn test_null_id_is_identifier_less() {
        let record: Record = serde_json::from_value(json!({"id": null, "text": "hi"})).unwrap();
        assert_eq!(record.id, None);
    }

    #[test]
    fn test_serializes_flat() {
        let mut payload = Map::new();
        payload.insert("rating".into(), json!(4));
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let record = Record::new(Some(1.into()), ts, payload);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value, json!({"id": 1, "timestamp": "2024-01-02T03:04:05Z", "rating": 4}));
    }

    #[test]
    fn test_same_content_ignores_timestamp() {
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut payload = Map::new();
        payload.insert("rating".into(), json!(5));

        let a = Record::new(Some(7.into()), t1, payload.clone());
        let b = Record::new(Some(7.into()), t2, payload);
        assert!(a.same_content(&b));
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
        assert!(!a.supersedes(&a.clone()));
    }
}
