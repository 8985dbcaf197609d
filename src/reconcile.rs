//! Cross-tier reconciliation
//!
//! Loading a document reads every tier concurrently and merges the copies
//! record by record:
//!
//! ```text
//! Primary: [t1 "A" 2024-01-01]
//! Volume:  [t1 "B" 2024-02-01, t2 "C"]      merged: [t1 "B", t2 "C"]
//! Legacy:  (missing)                         stale:  Primary, Legacy
//! ```
//!
//! The latest timestamp wins; ties and undated records fall back to tier
//! precedence. A tier that lacks a record never deletes it. Tiers that fail
//! to answer are reported, never fatal.

use crate::document::{record_timestamp, supersedes, DocKey, RecordKey, RecordSet, Shape};
use crate::storage::{Tier, TierSet};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// What one tier returned for a document
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotContent {
    Document(Value),
    Missing,
    /// Unreachable, timed out, or unparseable
    Failed(String),
}

/// One tier's copy of a document, as read
#[derive(Debug, Clone, PartialEq)]
pub struct TierSnapshot {
    pub tier: Tier,
    pub content: SnapshotContent,
}

impl TierSnapshot {
    pub fn document(tier: Tier, value: Value) -> Self {
        TierSnapshot {
            tier,
            content: SnapshotContent::Document(value),
        }
    }

    pub fn missing(tier: Tier) -> Self {
        TierSnapshot {
            tier,
            content: SnapshotContent::Missing,
        }
    }

    pub fn failed(tier: Tier, reason: impl Into<String>) -> Self {
        TierSnapshot {
            tier,
            content: SnapshotContent::Failed(reason.into()),
        }
    }

    /// Decode raw tier bytes; undecodable JSON counts as a failed read
    pub fn from_bytes(tier: Tier, bytes: &[u8]) -> Self {
        match serde_json::from_slice(bytes) {
            Ok(value) => TierSnapshot::document(tier, value),
            Err(e) => TierSnapshot::failed(tier, format!("unparseable JSON: {}", e)),
        }
    }
}

/// Per-tier read status reported alongside a merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierRead {
    Found,
    Missing,
    Failed(String),
}

/// Result of reconciling one document across tiers
#[derive(Debug, Clone)]
pub struct ReconciliationOutcome {
    pub doc_key: DocKey,
    /// Merged document; `None` when no tier has it
    pub payload: Option<Value>,
    /// Tier that supplied each surviving record
    pub sources: BTreeMap<RecordKey, Tier>,
    /// Tier that supplied the whole document when it was merged opaquely
    pub whole_source: Option<Tier>,
    pub reads: BTreeMap<Tier, TierRead>,
    /// Tiers whose copy differs from `payload` or could not be read
    pub stale: BTreeMap<Tier, bool>,
}

impl ReconciliationOutcome {
    pub fn is_found(&self) -> bool {
        self.payload.is_some()
    }

    pub fn stale_tiers(&self) -> Vec<Tier> {
        self.stale
            .iter()
            .filter(|(_, stale)| **stale)
            .map(|(tier, _)| *tier)
            .collect()
    }

    pub fn failed_tiers(&self) -> Vec<Tier> {
        self.reads
            .iter()
            .filter(|(_, read)| matches!(read, TierRead::Failed(_)))
            .map(|(tier, _)| *tier)
            .collect()
    }

    /// Stale tiers that were read successfully. A tier whose read failed
    /// may hold records the merge never saw, so it is never a repair target.
    pub fn repairable_tiers(&self) -> Vec<Tier> {
        self.stale_tiers()
            .into_iter()
            .filter(|tier| !matches!(self.reads.get(tier), Some(TierRead::Failed(_))))
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.stale.values().all(|stale| !stale)
    }
}

/// Reads and merges documents across a `TierSet`
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    tiers: TierSet,
}

impl ReconciliationEngine {
    pub fn new(tiers: TierSet) -> Self {
        ReconciliationEngine { tiers }
    }

    pub fn tiers(&self) -> &TierSet {
        &self.tiers
    }

    /// Read every tier concurrently, in precedence order
    pub async fn snapshot(&self, doc_key: &DocKey) -> Vec<TierSnapshot> {
        let reads = self.tiers.iter().map(|store| async move {
            match store.read(doc_key).await {
                Ok(Some(bytes)) => TierSnapshot::from_bytes(store.tier(), &bytes),
                Ok(None) => TierSnapshot::missing(store.tier()),
                Err(e) => TierSnapshot::failed(store.tier(), e.to_string()),
            }
        });
        join_all(reads).await
    }

    /// Load and reconcile `doc_key` from every configured tier
    pub async fn load(&self, doc_key: &DocKey) -> ReconciliationOutcome {
        let snapshots = self.snapshot(doc_key).await;
        let outcome = Self::merge(doc_key, snapshots);
        debug!(
            doc_key = %doc_key,
            found = outcome.is_found(),
            records = outcome.sources.len(),
            stale = ?outcome.stale_tiers(),
            "Reconciled document"
        );
        outcome
    }

    /// Merge already-read snapshots. Pure: no I/O, deterministic.
    pub fn merge(doc_key: &DocKey, mut snapshots: Vec<TierSnapshot>) -> ReconciliationOutcome {
        snapshots.sort_by_key(|s| s.tier);

        let mut reads = BTreeMap::new();
        for snapshot in &snapshots {
            let read = match &snapshot.content {
                SnapshotContent::Document(_) => TierRead::Found,
                SnapshotContent::Missing => TierRead::Missing,
                SnapshotContent::Failed(reason) => {
                    warn!(doc_key = %doc_key, tier = %snapshot.tier, error = %reason, "Tier read failed");
                    TierRead::Failed(reason.clone())
                }
            };
            reads.insert(snapshot.tier, read);
        }

        let documents: Vec<(Tier, &Value)> = snapshots
            .iter()
            .filter_map(|s| match &s.content {
                SnapshotContent::Document(value) => Some((s.tier, value)),
                _ => None,
            })
            .collect();

        if documents.is_empty() {
            // Nothing to propagate: only failed reads count as stale.
            let stale = snapshots
                .iter()
                .map(|s| (s.tier, matches!(s.content, SnapshotContent::Failed(_))))
                .collect();
            return ReconciliationOutcome {
                doc_key: doc_key.clone(),
                payload: None,
                sources: BTreeMap::new(),
                whole_source: None,
                reads,
                stale,
            };
        }

        let sets: Vec<(Tier, RecordSet, usize)> = documents
            .iter()
            .map(|(tier, value)| (*tier, RecordSet::decompose((*value).clone()), stored_len(value)))
            .collect();

        let shape = sets[0].1.shape;
        let uniform = sets.iter().all(|(_, set, _)| set.shape == shape);
        if !uniform {
            warn!(
                doc_key = %doc_key,
                tiers = ?documents.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
                "Document shape differs across tiers, merging whole documents by precedence"
            );
        }

        let (payload, sources, whole_source) = if uniform && shape != Shape::Opaque {
            let (merged, sources) = merge_records(&sets);
            (RecordSet::compose(shape, merged), sources, None)
        } else {
            let (tier, value) = documents[0];
            (value.clone(), BTreeMap::new(), Some(tier))
        };

        let stale = stale_map(&snapshots, &sets, &payload, whole_source.is_some());

        ReconciliationOutcome {
            doc_key: doc_key.clone(),
            payload: Some(payload),
            sources,
            whole_source,
            reads,
            stale,
        }
    }
}

/// Record count as stored, before in-document deduplication
fn stored_len(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}

/// Per-record recency merge. `sets` must be in precedence order.
fn merge_records(sets: &[(Tier, RecordSet, usize)]) -> (Vec<(RecordKey, Value)>, BTreeMap<RecordKey, Tier>) {
    struct Winner<'a> {
        tier: Tier,
        value: &'a Value,
        at: Option<DateTime<Utc>>,
    }

    let mut order: Vec<&RecordKey> = Vec::new();
    let mut winners: HashMap<&RecordKey, Winner<'_>> = HashMap::new();

    for (tier, set, _) in sets {
        for (key, value) in &set.records {
            let at = record_timestamp(value);
            match winners.get_mut(key) {
                Some(incumbent) => {
                    if supersedes(at, incumbent.at) {
                        *incumbent = Winner {
                            tier: *tier,
                            value,
                            at,
                        };
                    }
                }
                None => {
                    order.push(key);
                    winners.insert(
                        key,
                        Winner {
                            tier: *tier,
                            value,
                            at,
                        },
                    );
                }
            }
        }
    }

    let mut sources = BTreeMap::new();
    let merged = order
        .into_iter()
        .filter_map(|key| {
            winners.get(key).map(|w| {
                sources.insert(key.clone(), w.tier);
                (key.clone(), w.value.clone())
            })
        })
        .collect();
    (merged, sources)
}

fn stale_map(
    snapshots: &[TierSnapshot],
    sets: &[(Tier, RecordSet, usize)],
    payload: &Value,
    whole: bool,
) -> BTreeMap<Tier, bool> {
    let merged = RecordSet::decompose(payload.clone());
    let merged_keyed = merged.keyed();

    snapshots
        .iter()
        .map(|snapshot| {
            let stale = match &snapshot.content {
                SnapshotContent::Failed(_) | SnapshotContent::Missing => true,
                SnapshotContent::Document(value) if whole => value != payload,
                SnapshotContent::Document(_) => match sets.iter().find(|(t, _, _)| *t == snapshot.tier) {
                    Some((_, set, len)) => {
                        *len != set.records.len() || set.keyed() != merged_keyed
                    }
                    None => true,
                },
            };
            (snapshot.tier, stale)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> DocKey {
        DocKey::new("templates").unwrap()
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Primary, json!([{"id": "t1", "name": "A", "updatedAt": "2024-01-01"}])),
                TierSnapshot::document(Tier::Volume, json!([{"id": "t1", "name": "B", "updatedAt": "2024-02-01"}])),
                TierSnapshot::missing(Tier::Legacy),
            ],
        );

        assert_eq!(outcome.payload, Some(json!([{"id": "t1", "name": "B", "updatedAt": "2024-02-01"}])));
        assert_eq!(outcome.sources.get(&RecordKey::id("t1")), Some(&Tier::Volume));
        assert_eq!(outcome.stale_tiers(), vec![Tier::Primary, Tier::Legacy]);
    }

    #[test]
    fn test_tie_broken_by_precedence() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Legacy, json!([{"id": 1, "v": "legacy", "updatedAt": "2024-03-01"}])),
                TierSnapshot::document(Tier::Volume, json!([{"id": 1, "v": "volume", "updatedAt": "2024-03-01"}])),
            ],
        );
        assert_eq!(outcome.payload.as_ref().unwrap()[0]["v"], "volume");
        assert_eq!(outcome.stale_tiers(), vec![Tier::Legacy]);
    }

    #[test]
    fn test_undated_record_loses_to_dated() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Primary, json!([{"id": 1, "v": "undated"}])),
                TierSnapshot::document(Tier::Legacy, json!([{"id": "1", "v": "dated", "createdAt": "2020-01-01"}])),
            ],
        );
        assert_eq!(outcome.payload.unwrap()[0]["v"], "dated");
        assert_eq!(outcome.sources.get(&RecordKey::id("1")), Some(&Tier::Legacy));
    }

    #[test]
    fn test_union_keeps_first_appearance_order() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Primary, json!([{"id": "b"}, {"id": "a"}])),
                TierSnapshot::document(Tier::Volume, json!([{"id": "c"}, {"id": "a"}, {"id": "d"}])),
                TierSnapshot::document(Tier::Legacy, json!([])),
            ],
        );
        let ids: Vec<_> = outcome.payload.unwrap().as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("a"), json!("c"), json!("d")]);
        assert!(outcome.stale.values().all(|s| *s));
    }

    #[test]
    fn test_reordered_copy_is_not_stale() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Primary, json!([{"id": 1}, {"id": 2}])),
                TierSnapshot::document(Tier::Volume, json!([{"id": 2}, {"id": 1}])),
            ],
        );
        assert!(outcome.is_consistent());
    }

    #[test]
    fn test_failed_tier_is_stale_but_not_fatal() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::failed(Tier::Primary, "timed out"),
                TierSnapshot::document(Tier::Volume, json!([{"id": 1}])),
            ],
        );
        assert_eq!(outcome.payload, Some(json!([{"id": 1}])));
        assert_eq!(outcome.failed_tiers(), vec![Tier::Primary]);
        assert_eq!(outcome.stale_tiers(), vec![Tier::Primary]);
    }

    #[test]
    fn test_missing_everywhere() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![TierSnapshot::missing(Tier::Volume), TierSnapshot::failed(Tier::Legacy, "offline")],
        );
        assert!(!outcome.is_found());
        assert_eq!(outcome.stale_tiers(), vec![Tier::Legacy]);
    }

    #[test]
    fn test_object_documents_merge_per_member() {
        let outcome = ReconciliationEngine::merge(
            &DocKey::new("sessions").unwrap(),
            vec![
                TierSnapshot::document(Tier::Primary, json!({"s1": {"user": "a", "updatedAt": "2024-01-01"}})),
                TierSnapshot::document(
                    Tier::Volume,
                    json!({"s1": {"user": "a2", "updatedAt": "2024-01-02"}, "s2": {"user": "b"}}),
                ),
            ],
        );
        assert_eq!(
            outcome.payload,
            Some(json!({"s1": {"user": "a2", "updatedAt": "2024-01-02"}, "s2": {"user": "b"}}))
        );
    }

    #[test]
    fn test_shape_mismatch_falls_back_to_precedence() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Volume, json!({"t1": {}})),
                TierSnapshot::document(Tier::Legacy, json!([{"id": "t1"}])),
            ],
        );
        assert_eq!(outcome.payload, Some(json!({"t1": {}})));
        assert_eq!(outcome.whole_source, Some(Tier::Volume));
        assert_eq!(outcome.stale_tiers(), vec![Tier::Legacy]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let snapshots = vec![
            TierSnapshot::document(Tier::Primary, json!([{"id": 1, "updatedAt": "2024-01-01"}, {"id": 3}])),
            TierSnapshot::document(Tier::Volume, json!([{"id": 2}, {"id": 1, "updatedAt": "2024-06-01"}])),
        ];
        let first = ReconciliationEngine::merge(&key(), snapshots.clone()).payload.unwrap();
        let second = ReconciliationEngine::merge(&key(), snapshots).payload.unwrap();
        assert_eq!(first, second);

        // Merging the merged result with itself changes nothing.
        let again = ReconciliationEngine::merge(
            &key(),
            vec![
                TierSnapshot::document(Tier::Primary, first.clone()),
                TierSnapshot::document(Tier::Volume, first.clone()),
            ],
        );
        assert_eq!(again.payload, Some(first));
        assert!(again.is_consistent());
    }

    #[test]
    fn test_duplicate_ids_within_tier_mark_it_stale() {
        let outcome = ReconciliationEngine::merge(
            &key(),
            vec![TierSnapshot::document(Tier::Volume, json!([{"id": 1}, {"id": "1"}]))],
        );
        assert_eq!(outcome.payload, Some(json!([{"id": 1}])));
        assert_eq!(outcome.stale_tiers(), vec![Tier::Volume]);
    }

    #[test]
    fn test_unparseable_bytes_are_a_failed_read() {
        let snapshot = TierSnapshot::from_bytes(Tier::Legacy, b"{not json");
        assert!(matches!(snapshot.content, SnapshotContent::Failed(_)));
    }
}
