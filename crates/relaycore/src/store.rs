//! Typed in-memory record store.
//!
//! Every category lives behind one `RwLock` so that a whole-store `clear`
//! or a sweep over all categories is atomic with respect to readers. Every
//! mutation computes the new category value first and assigns it in one
//! step; no reader can observe a half-merged category.

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::category::{Category, MergeStrategy, PolicyTable};
use crate::error::{RelayError, RelayResult};
use crate::record::{Record, RecordId};

/// Current contents of a category.
#[derive(Debug, Clone, PartialEq)]
pub enum CategoryValue {
    Sequence(Vec<Record>),
    Scalar(Option<Value>),
}

impl CategoryValue {
    fn empty_for(strategy: MergeStrategy) -> Self {
        if strategy.is_scalar() {
            CategoryValue::Scalar(None)
        } else {
            CategoryValue::Sequence(Vec::new())
        }
    }

    /// Number of records; a scalar counts as one once it is set.
    pub fn len(&self) -> usize {
        match self {
            CategoryValue::Sequence(records) => records.len(),
            CategoryValue::Scalar(value) => usize::from(value.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> Value {
        match self {
            CategoryValue::Sequence(records) => serde_json::to_value(records).unwrap_or(Value::Array(Vec::new())),
            CategoryValue::Scalar(value) => value.clone().unwrap_or(Value::Null),
        }
    }
}

/// Result of [`RecordStore::upsert_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// Category cannot take single records; logged, nothing stored
    Ignored,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

/// Result of [`RecordStore::merge_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub category: Category,
    pub strategy: MergeStrategy,
    pub inserted: usize,
    pub replaced: usize,
    pub count: usize,
    pub changed: bool,
}

/// Monotonic identifier source owned by the store.
///
/// Used for event sequence numbers and outbound result ids where
/// timestamp-derived ids could collide under load.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecordStore {
    categories: RwLock<HashMap<Category, CategoryValue>>,
    policies: PolicyTable,
    ids: IdGenerator,
}

impl RecordStore {
    /// Creates a store with every category present and empty.
    pub fn new(policies: PolicyTable) -> Self {
        let categories = policies
            .iter()
            .map(|p| (p.category, CategoryValue::empty_for(p.merge)))
            .collect();
        Self {
            categories: RwLock::new(categories),
            policies,
            ids: IdGenerator::new(),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn next_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Inserts or replaces a single record.
    ///
    /// Identifier-less records are always appended. A record whose id is
    /// already stored replaces it only when the content differs.
    pub fn upsert_one(&self, category: Category, record: Record) -> UpsertOutcome {
        let mut categories = self.categories.write();
        let Some(CategoryValue::Sequence(records)) = categories.get_mut(&category) else {
            warn!(%category, "upsert ignored: category is not a record sequence");
            return UpsertOutcome::Ignored;
        };

        let Some(id) = record.id.clone() else {
            records.push(record);
            return UpsertOutcome::Inserted;
        };

        match records.iter_mut().find(|r| r.id.as_ref() == Some(&id)) {
            Some(existing) if existing.same_content(&record) => {
                debug!(%category, %id, "upsert: content unchanged");
                UpsertOutcome::Unchanged
            }
            Some(existing) => {
                *existing = record;
                info!(%category, %id, "record updated");
                UpsertOutcome::Updated
            }
            None => {
                records.push(record);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Folds a bot-sourced batch into a sequence category per its policy.
    pub fn merge_batch(&self, category: Category, incoming: Vec<Record>) -> RelayResult<MergeSummary> {
        let strategy = self.policies.policy(category).merge;
        if strategy.is_scalar() {
            return Err(RelayError::UnsupportedOperation {
                category: category.to_string(),
                operation: "merge_batch",
            });
        }

        let mut categories = self.categories.write();
        let current = match categories.get(&category) {
            Some(CategoryValue::Sequence(records)) => records.as_slice(),
            _ => &[][..],
        };

        let (next, inserted, replaced) = match strategy {
            MergeStrategy::UnionById => union_by_id(current, incoming),
            _ => {
                let inserted = incoming.len();
                (dedup_by_id(incoming).0, inserted, 0)
            }
        };
        let changed = next.as_slice() != current;
        let count = next.len();
        categories.insert(category, CategoryValue::Sequence(next));
        drop(categories);

        debug!(%category, %strategy, inserted, replaced, count, "batch merged");
        Ok(MergeSummary {
            category,
            strategy,
            inserted,
            replaced,
            count,
            changed,
        })
    }

    /// Sets the snapshot value of a scalar category. Returns whether it changed.
    pub fn set_scalar(&self, category: Category, value: Value) -> RelayResult<bool> {
        if !self.policies.is_scalar(category) {
            return Err(RelayError::UnsupportedOperation {
                category: category.to_string(),
                operation: "set_scalar",
            });
        }
        let mut categories = self.categories.write();
        let slot = categories.entry(category).or_insert(CategoryValue::Scalar(None));
        let next = CategoryValue::Scalar(Some(value));
        let changed = *slot != next;
        *slot = next;
        Ok(changed)
    }

    pub fn get_category(&self, category: Category) -> CategoryValue {
        let strategy = self.policies.policy(category).merge;
        self.categories
            .read()
            .get(&category)
            .cloned()
            .unwrap_or_else(|| CategoryValue::empty_for(strategy))
    }

    pub fn count(&self, category: Category) -> usize {
        self.categories.read().get(&category).map_or(0, CategoryValue::len)
    }

    /// Contents of every category, read under one lock.
    pub fn all(&self) -> Vec<(Category, CategoryValue)> {
        let categories = self.categories.read();
        self.policies
            .iter()
            .map(|p| {
                let value = categories
                    .get(&p.category)
                    .cloned()
                    .unwrap_or_else(|| CategoryValue::empty_for(p.merge));
                (p.category, value)
            })
            .collect()
    }

    /// Counts for every category, in enumeration order.
    pub fn counts(&self) -> Vec<(Category, usize)> {
        let categories = self.categories.read();
        Category::all()
            .map(|c| (c, categories.get(&c).map_or(0, CategoryValue::len)))
            .collect()
    }

    /// Resets one category, or every category when `None`, under one write lock.
    pub fn clear(&self, category: Option<Category>) {
        let mut categories = self.categories.write();
        match category {
            Some(category) => {
                let strategy = self.policies.policy(category).merge;
                categories.insert(category, CategoryValue::empty_for(strategy));
                info!(%category, "category cleared");
            }
            None => {
                for policy in self.policies.iter() {
                    categories.insert(policy.category, CategoryValue::empty_for(policy.merge));
                }
                info!("all categories cleared");
            }
        }
    }

    /// Rewrites every sequence category with `f` under a single write lock.
    ///
    /// `f` receives the current records and returns the replacement; the
    /// result is assigned in one step per category.
    pub(crate) fn rewrite_sequences<F>(&self, mut f: F)
    where
        F: FnMut(Category, Vec<Record>) -> Vec<Record>,
    {
        let mut categories = self.categories.write();
        for (category, value) in categories.iter_mut() {
            if let CategoryValue::Sequence(records) = value {
                let current = std::mem::take(records);
                *records = f(*category, current);
            }
        }
    }
}

/// Collapses same-identifier records, keeping the latest by timestamp.
///
/// The survivor takes the position of the first occurrence; ties keep the
/// earlier record. Identifier-less records pass through untouched.
/// Returns the collapsed sequence and how many records were dropped.
pub fn dedup_by_id(records: Vec<Record>) -> (Vec<Record>, usize) {
    let before = records.len();
    let mut out: Vec<Record> = Vec::with_capacity(before);
    let mut slots: HashMap<RecordId, usize> = HashMap::new();

    for record in records {
        let Some(id) = record.id.clone() else {
            out.push(record);
            continue;
        };
        match slots.entry(id) {
            Entry::Occupied(slot) => {
                let held = &mut out[*slot.get()];
                if record.supersedes(held) {
                    *held = record;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(record);
            }
        }
    }

    let removed = before - out.len();
    (out, removed)
}

/// Union of `current` and `incoming` by identifier.
///
/// Matching ids resolve with the newest-timestamp rule; unmatched and
/// identifier-less incoming records are appended in arrival order.
/// Returns `(merged, inserted, replaced)`.
fn union_by_id(current: &[Record], incoming: Vec<Record>) -> (Vec<Record>, usize, usize) {
    let (mut merged, _) = dedup_by_id(current.to_vec());
    let mut slots: HashMap<RecordId, usize> = merged
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.id.clone().map(|id| (id, i)))
        .collect();
    let mut inserted = 0;
    let mut replaced = 0;

    for record in incoming {
        let Some(id) = record.id.clone() else {
            merged.push(record);
            inserted += 1;
            continue;
        };
        match slots.get(&id) {
            Some(&i) => {
                if record.supersedes(&merged[i]) {
                    merged[i] = record;
                    replaced += 1;
                }
            }
            None => {
                slots.insert(id, merged.len());
                merged.push(record);
                inserted += 1;
            }
        }
    }

    (merged, inserted, replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn rec(id: Option<i64>, hour: u32, text: &str) -> Record {
        let mut payload = Map::new();
        payload.insert("text".into(), json!(text));
        Record::new(id.map(RecordId::Int), ts(hour), payload)
    }

    fn texts(store: &RecordStore, category: Category) -> Vec<String> {
        match store.get_category(category) {
            CategoryValue::Sequence(records) => records
                .iter()
                .map(|r| r.payload["text"].as_str().unwrap_or_default().to_string())
                .collect(),
            CategoryValue::Scalar(_) => panic!("expected sequence"),
        }
    }

    #[test]
    fn test_new_store_has_every_category_empty() {
        let store = RecordStore::new(PolicyTable::default());
        for (category, count) in store.counts() {
            assert_eq!(count, 0, "{category} should start empty");
        }
        assert_eq!(store.get_category(Category::Rating), CategoryValue::Scalar(None));
    }

    #[test]
    fn test_upsert_appends_identifier_less() {
        let store = RecordStore::new(PolicyTable::default());
        assert_eq!(store.upsert_one(Category::Updates, rec(None, 1, "a")), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_one(Category::Updates, rec(None, 1, "a")), UpsertOutcome::Inserted);
        assert_eq!(store.count(Category::Updates), 2);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = RecordStore::new(PolicyTable::default());
        let record = rec(Some(7), 1, "five stars");

        assert_eq!(store.upsert_one(Category::Reviews, record.clone()), UpsertOutcome::Inserted);
        let once = store.get_category(Category::Reviews);
        assert_eq!(store.upsert_one(Category::Reviews, record), UpsertOutcome::Unchanged);
        assert_eq!(store.get_category(Category::Reviews), once);
    }

    #[test]
    fn test_upsert_replaces_when_content_differs() {
        let store = RecordStore::new(PolicyTable::default());
        store.upsert_one(Category::Reviews, rec(Some(7), 1, "ok"));
        assert_eq!(
            store.upsert_one(Category::Reviews, rec(Some(7), 2, "great")),
            UpsertOutcome::Updated
        );
        assert_eq!(texts(&store, Category::Reviews), vec!["great"]);
    }

    #[test]
    fn test_upsert_equal_content_newer_timestamp_keeps_original() {
        let store = RecordStore::new(PolicyTable::default());
        store.upsert_one(Category::Reviews, rec(Some(7), 1, "same"));
        assert_eq!(
            store.upsert_one(Category::Reviews, rec(Some(7), 5, "same")),
            UpsertOutcome::Unchanged
        );
        let CategoryValue::Sequence(records) = store.get_category(Category::Reviews) else {
            panic!("expected sequence");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timestamp, ts(1));
    }

    #[test]
    fn test_upsert_into_scalar_is_ignored() {
        let store = RecordStore::new(PolicyTable::default());
        assert_eq!(store.upsert_one(Category::Rating, rec(Some(1), 1, "x")), UpsertOutcome::Ignored);
        assert_eq!(store.count(Category::Rating), 0);
    }

    #[test]
    fn test_merge_keeps_newest_regardless_of_order() {
        let forward = RecordStore::new(PolicyTable::default());
        forward.merge_batch(Category::ChatMessages, vec![rec(Some(1), 1, "old")]).unwrap();
        forward.merge_batch(Category::ChatMessages, vec![rec(Some(1), 3, "new")]).unwrap();

        let backward = RecordStore::new(PolicyTable::default());
        backward.merge_batch(Category::ChatMessages, vec![rec(Some(1), 3, "new")]).unwrap();
        let summary = backward
            .merge_batch(Category::ChatMessages, vec![rec(Some(1), 1, "old")])
            .unwrap();

        assert_eq!(texts(&forward, Category::ChatMessages), vec!["new"]);
        assert_eq!(texts(&backward, Category::ChatMessages), vec!["new"]);
        assert!(!summary.changed);
    }

    #[test]
    fn test_merge_union_appends_unmatched() {
        let store = RecordStore::new(PolicyTable::default());
        store
            .merge_batch(Category::Requests, vec![rec(Some(1), 1, "a"), rec(Some(2), 1, "b")])
            .unwrap();
        let summary = store
            .merge_batch(
                Category::Requests,
                vec![rec(Some(2), 2, "b2"), rec(Some(3), 1, "c"), rec(None, 1, "loose")],
            )
            .unwrap();

        assert_eq!(texts(&store, Category::Requests), vec!["a", "b2", "c", "loose"]);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.count, 4);
        assert!(summary.changed);
    }

    #[test]
    fn test_merge_replace_swaps_collection() {
        let store = RecordStore::new(PolicyTable::default());
        store
            .merge_batch(Category::Orders, vec![rec(Some(1), 1, "a"), rec(Some(2), 1, "b")])
            .unwrap();
        let summary = store.merge_batch(Category::Orders, vec![rec(Some(9), 1, "z")]).unwrap();

        assert_eq!(texts(&store, Category::Orders), vec!["z"]);
        assert_eq!(summary.strategy, MergeStrategy::Replace);
        assert_eq!(summary.count, 1);
    }

    #[test]
    fn test_merge_into_scalar_rejected() {
        let store = RecordStore::new(PolicyTable::default());
        let err = store.merge_batch(Category::Rating, vec![rec(Some(1), 1, "x")]).unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_scalar_set_and_clear() {
        let store = RecordStore::new(PolicyTable::default());
        assert!(store.set_scalar(Category::Rating, json!({"average": 4.5})).unwrap());
        assert!(!store.set_scalar(Category::Rating, json!({"average": 4.5})).unwrap());
        assert_eq!(store.get_category(Category::Rating).to_json(), json!({"average": 4.5}));
        assert_eq!(store.count(Category::Rating), 1);

        store.clear(Some(Category::Rating));
        assert_eq!(store.get_category(Category::Rating).to_json(), Value::Null);
        assert!(store.set_scalar(Category::Reviews, json!(1)).is_err());
    }

    #[test]
    fn test_clear_all() {
        let store = RecordStore::new(PolicyTable::default());
        store.upsert_one(Category::Reviews, rec(Some(1), 1, "a"));
        store.upsert_one(Category::Updates, rec(None, 1, "b"));
        store.set_scalar(Category::Rating, json!(5)).unwrap();

        store.clear(None);
        assert!(store.counts().iter().all(|(_, n)| *n == 0));
    }

    #[test]
    fn test_dedup_by_id_keeps_latest_and_first_position() {
        let (out, removed) = dedup_by_id(vec![
            rec(Some(1), 1, "a-old"),
            rec(Some(2), 1, "b"),
            rec(None, 1, "x"),
            rec(Some(1), 4, "a-new"),
            rec(Some(1), 4, "a-tie"),
        ]);
        let got: Vec<&str> = out.iter().map(|r| r.payload["text"].as_str().unwrap()).collect();
        assert_eq!(got, vec!["a-new", "b", "x"]);
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let store = RecordStore::new(PolicyTable::default());
        let a = store.next_id();
        let b = store.next_id();
        assert!(b > a);
    }
}
