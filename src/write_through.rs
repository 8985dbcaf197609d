//! Best-effort write-through to every tier
//!
//! A write is serialized once and sent to all tiers concurrently. Each tier
//! succeeds or fails on its own; the caller gets a `PerTierResult` and
//! decides what partial durability means. Writes to the same document are
//! serialized by a per-(tier, document) lock held across read-modify-write.

use crate::document::{validate_payload, DocKey, RecordKey, RecordSet, Shape};
use crate::error::ValidationError;
use crate::reconcile::{
    ReconciliationEngine, ReconciliationOutcome, SnapshotContent, TierRead, TierSnapshot,
};
use crate::storage::{Tier, TierError, TierSet, TierStore};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

// ============================================================================
// Lock table
// ============================================================================

/// Lazily created async locks, one per (tier, document)
#[derive(Debug, Clone, Default)]
pub struct DocLockTable {
    locks: Arc<Mutex<HashMap<(Tier, DocKey), Arc<AsyncMutex<()>>>>>,
}

/// Holds the locks of one document on every tier it was taken for
#[derive(Debug)]
pub struct DocGuard {
    doc_key: DocKey,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl DocGuard {
    pub fn doc_key(&self) -> &DocKey {
        &self.doc_key
    }
}

impl DocLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, tier: Tier, doc_key: &DocKey) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry((tier, doc_key.clone()))
            .or_default()
            .clone()
    }

    /// Lock `doc_key` on each of `tiers`, always in precedence order
    pub async fn lock_all(&self, tiers: &[Tier], doc_key: &DocKey) -> DocGuard {
        let mut ordered = tiers.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for tier in ordered {
            guards.push(self.lock_for(tier, doc_key).lock_owned().await);
        }
        DocGuard {
            doc_key: doc_key.clone(),
            _guards: guards,
        }
    }

    /// Number of (tier, document) locks created so far
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of writing one document to one tier
#[derive(Debug)]
pub struct TierWriteOutcome {
    pub tier: Tier,
    /// Bytes sent to the tier (0 when nothing needed writing)
    pub bytes: u64,
    pub result: Result<(), TierError>,
}

/// Outcome of a multi-tier write; never an aggregate error
#[derive(Debug)]
pub struct PerTierResult {
    pub doc_key: DocKey,
    pub outcomes: Vec<TierWriteOutcome>,
}

impl PerTierResult {
    fn empty(doc_key: &DocKey) -> Self {
        PerTierResult {
            doc_key: doc_key.clone(),
            outcomes: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> Vec<Tier> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.tier)
            .collect()
    }

    pub fn failed(&self) -> Vec<(Tier, &TierError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.tier, e)))
            .collect()
    }

    /// At least one tier holds the write
    pub fn is_durable(&self) -> bool {
        self.outcomes.iter().any(|o| o.result.is_ok())
    }

    /// Every attempted tier holds the write
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// What a heal pass found and repaired
#[derive(Debug)]
pub struct HealReport {
    pub outcome: ReconciliationOutcome,
    /// Writes to the stale tiers; `None` when nothing needed repair
    pub repair: Option<PerTierResult>,
}

impl HealReport {
    pub fn repaired(&self) -> Vec<Tier> {
        self.repair.as_ref().map(|r| r.succeeded()).unwrap_or_default()
    }

    pub fn still_stale(&self) -> Vec<Tier> {
        self.repair
            .as_ref()
            .map(|r| r.failed().into_iter().map(|(t, _)| t).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Serialize a document the way tiers store it
pub(crate) fn encode_document(payload: &Value) -> Vec<u8> {
    serde_json::to_vec_pretty(payload).unwrap_or_else(|_| payload.to_string().into_bytes())
}

/// Applies documents to every configured tier
#[derive(Debug, Clone)]
pub struct WriteThroughCoordinator {
    engine: ReconciliationEngine,
    locks: DocLockTable,
}

impl WriteThroughCoordinator {
    pub fn new(tiers: TierSet) -> Self {
        WriteThroughCoordinator {
            engine: ReconciliationEngine::new(tiers),
            locks: DocLockTable::new(),
        }
    }

    pub fn tiers(&self) -> &TierSet {
        self.engine.tiers()
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn locks(&self) -> &DocLockTable {
        &self.locks
    }

    async fn lock(&self, doc_key: &DocKey) -> DocGuard {
        self.locks.lock_all(&self.tiers().tiers(), doc_key).await
    }

    /// Reconciled read without taking the document lock
    pub async fn load(&self, doc_key: &DocKey) -> ReconciliationOutcome {
        self.engine.load(doc_key).await
    }

    /// Write `payload` to every tier. The payload is not validated here.
    pub async fn apply(&self, doc_key: &DocKey, payload: &Value) -> PerTierResult {
        let _guard = self.lock(doc_key).await;
        self.write_locked(doc_key, payload, self.tiers().iter().collect())
            .await
    }

    /// Load, then rewrite the merged document to the tiers that disagree.
    /// Tiers whose read failed are reported as still stale, never overwritten.
    pub async fn heal(&self, doc_key: &DocKey) -> HealReport {
        let _guard = self.lock(doc_key).await;
        let outcome = self.engine.load(doc_key).await;

        let payload = match outcome.payload.clone() {
            Some(payload) if !outcome.is_consistent() => payload,
            _ => {
                return HealReport {
                    outcome,
                    repair: None,
                }
            }
        };

        let repairable = outcome.repairable_tiers();
        let targets: Vec<&TierStore> = self
            .tiers()
            .iter()
            .filter(|s| repairable.contains(&s.tier()))
            .collect();
        let mut repair = self.write_locked(doc_key, &payload, targets).await;
        repair.outcomes.extend(unread_outcomes(&outcome));
        repair.outcomes.sort_by_key(|o| o.tier);
        info!(
            doc_key = %doc_key,
            repaired = ?repair.succeeded(),
            failed = repair.failed().len(),
            "Healed stale tiers"
        );
        HealReport {
            outcome,
            repair: Some(repair),
        }
    }

    /// Locked read-modify-write: `f` sees the reconciled document (or `None`).
    /// Only tiers that were read are written; unreadable tiers come back as
    /// failed so a later load merges their records back in.
    pub async fn update<F>(&self, doc_key: &DocKey, f: F) -> Result<PerTierResult, ValidationError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let _guard = self.lock(doc_key).await;
        let outcome = self.engine.load(doc_key).await;
        let next = f(outcome.payload.clone());
        validate_payload(doc_key, &next)?;

        let unread = outcome.failed_tiers();
        let targets: Vec<&TierStore> = self
            .tiers()
            .iter()
            .filter(|s| !unread.contains(&s.tier()))
            .collect();
        let mut result = self.write_locked(doc_key, &next, targets).await;
        result.outcomes.extend(unread_outcomes(&outcome));
        result.outcomes.sort_by_key(|o| o.tier);
        Ok(result)
    }

    /// Remove records from every tier's own copy. A tier without the
    /// document, or without any of the ids, is left untouched.
    pub async fn delete_records(&self, doc_key: &DocKey, ids: &[RecordKey]) -> PerTierResult {
        let _guard = self.lock(doc_key).await;
        let ids: HashSet<&RecordKey> = ids.iter().collect();
        if ids.is_empty() {
            return PerTierResult::empty(doc_key);
        }

        let snapshots = self.engine.snapshot(doc_key).await;
        let writes = self
            .tiers()
            .iter()
            .zip(snapshots)
            .map(|(store, snapshot)| {
                let ids = &ids;
                async move { delete_from_tier(store, doc_key, snapshot, ids).await }
            });
        let outcomes = join_all(writes).await;

        let result = PerTierResult {
            doc_key: doc_key.clone(),
            outcomes,
        };
        info!(
            doc_key = %doc_key,
            ids = ids.len(),
            rewritten = result.outcomes.iter().filter(|o| o.bytes > 0 && o.result.is_ok()).count(),
            failed = result.failed().len(),
            "Deleted records"
        );
        result
    }

    async fn write_locked(&self, doc_key: &DocKey, payload: &Value, targets: Vec<&TierStore>) -> PerTierResult {
        let bytes = encode_document(payload);
        let size = bytes.len() as u64;

        let writes = targets.into_iter().map(|store| {
            let bytes = &bytes;
            async move {
                let result = store.write(doc_key, bytes).await;
                if let Err(e) = &result {
                    warn!(doc_key = %doc_key, tier = %store.tier(), error = %e, "Tier write failed");
                }
                TierWriteOutcome {
                    tier: store.tier(),
                    bytes: size,
                    result,
                }
            }
        });
        let result = PerTierResult {
            doc_key: doc_key.clone(),
            outcomes: join_all(writes).await,
        };

        if result.outcomes.is_empty() {
            debug!(doc_key = %doc_key, "No tiers to write");
        } else if !result.is_durable() {
            error!(doc_key = %doc_key, size, "Write failed on every tier");
        } else {
            debug!(
                doc_key = %doc_key,
                size,
                succeeded = ?result.succeeded(),
                "Wrote document"
            );
        }
        result
    }
}

/// A tier skipped because its read failed
fn unread_outcome(tier: Tier, reason: &str) -> TierWriteOutcome {
    TierWriteOutcome {
        tier,
        bytes: 0,
        result: Err(TierError::Io {
            tier,
            op: "read",
            source: std::io::Error::new(std::io::ErrorKind::Other, reason.to_string()),
        }),
    }
}

fn unread_outcomes(outcome: &ReconciliationOutcome) -> Vec<TierWriteOutcome> {
    outcome
        .reads
        .iter()
        .filter_map(|(tier, read)| match read {
            TierRead::Failed(reason) => Some(unread_outcome(*tier, reason)),
            _ => None,
        })
        .collect()
}

async fn delete_from_tier(
    store: &TierStore,
    doc_key: &DocKey,
    snapshot: TierSnapshot,
    ids: &HashSet<&RecordKey>,
) -> TierWriteOutcome {
    let untouched = |result: Result<(), TierError>| TierWriteOutcome {
        tier: store.tier(),
        bytes: 0,
        result,
    };

    let value = match snapshot.content {
        SnapshotContent::Document(value) => value,
        SnapshotContent::Missing => return untouched(Ok(())),
        SnapshotContent::Failed(reason) => {
            warn!(doc_key = %doc_key, tier = %store.tier(), error = %reason, "Cannot delete from unreadable tier");
            return unread_outcome(store.tier(), &reason);
        }
    };

    let set = RecordSet::decompose(value);
    if set.shape == Shape::Opaque {
        return untouched(Ok(()));
    }
    let before = set.records.len();
    let kept: Vec<(RecordKey, Value)> = set
        .records
        .into_iter()
        .filter(|(key, _)| !ids.contains(key))
        .collect();
    if kept.len() == before {
        return untouched(Ok(()));
    }

    let bytes = encode_document(&RecordSet::compose(set.shape, kept));
    let result = store.write(doc_key, &bytes).await;
    if let Err(e) = &result {
        warn!(doc_key = %doc_key, tier = %store.tier(), error = %e, "Tier write failed");
    }
    TierWriteOutcome {
        tier: store.tier(),
        bytes: bytes.len() as u64,
        result,
    }
}
