//! Storage tiers
//!
//! A `TierStore` is one independently-failing backend holding a copy of the
//! logical documents. It maps `DocKey`s onto object keys of an `ObjectStore`
//! and bounds every call with a timeout: a tier that hangs is a failed tier
//! for that call, never a stalled caller.

use crate::document::DocKey;
use crate::storage::object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

/// Object probed by `TierStore::ping`; never written
const PING_KEY: &str = "__tiervault_ping__";

/// Physical tier, declared in trust precedence order (Primary first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Relational store
    Primary,
    /// Durable volume-backed file store
    Volume,
    /// Compatibility file store
    Legacy,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Primary, Tier::Volume, Tier::Legacy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Volume => "volume",
            Tier::Legacy => "legacy",
        }
    }

    /// True when this tier's copy wins ties against `other`
    pub fn outranks(&self, other: Tier) -> bool {
        *self < other
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reaching one tier
#[derive(Debug)]
pub enum TierError {
    /// The operation did not complete within the tier timeout
    Timeout {
        tier: Tier,
        op: &'static str,
        after: Duration,
    },
    /// The backend reported an I/O error
    Io {
        tier: Tier,
        op: &'static str,
        source: IoError,
    },
}

impl TierError {
    pub fn tier(&self) -> Tier {
        match self {
            TierError::Timeout { tier, .. } | TierError::Io { tier, .. } => *tier,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TierError::Timeout { .. })
    }
}

impl std::fmt::Display for TierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierError::Timeout { tier, op, after } => {
                write!(f, "{} tier {} timed out after {:?}", tier, op, after)
            }
            TierError::Io { tier, op, source } => {
                write!(f, "{} tier {} failed: {}", tier, op, source)
            }
        }
    }
}

impl std::error::Error for TierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TierError::Io { source, .. } => Some(source),
            TierError::Timeout { .. } => None,
        }
    }
}

/// One configured tier: a store plus its identity and timeout
#[derive(Clone)]
pub struct TierStore {
    tier: Tier,
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl std::fmt::Debug for TierStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierStore")
            .field("tier", &self.tier)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TierStore {
    pub fn new(tier: Tier, store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        TierStore {
            tier,
            store,
            timeout,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, TierError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(TierError::Io {
                tier: self.tier,
                op,
                source,
            }),
            Err(_) => Err(TierError::Timeout {
                tier: self.tier,
                op,
                after: self.timeout,
            }),
        }
    }

    /// Read a document; `Ok(None)` when the tier does not have it
    pub async fn read(&self, doc_key: &DocKey) -> Result<Option<Vec<u8>>, TierError> {
        let key = doc_key.object_key();
        match self.bounded("read", self.store.get(&key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(TierError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Overwrite a document with `data`
    pub async fn write(&self, doc_key: &DocKey, data: &[u8]) -> Result<(), TierError> {
        let key = doc_key.object_key();
        self.bounded("write", self.store.put(&key, data)).await
    }

    pub async fn exists(&self, doc_key: &DocKey) -> Result<bool, TierError> {
        let key = doc_key.object_key();
        self.bounded("exists", self.store.exists(&key)).await
    }

    pub async fn delete(&self, doc_key: &DocKey) -> Result<(), TierError> {
        let key = doc_key.object_key();
        self.bounded("delete", self.store.delete(&key)).await
    }

    /// Documents nested under `dir` (any depth), sorted by key
    pub async fn list_documents(&self, dir: &DocKey) -> Result<Vec<DocKey>, TierError> {
        let prefix = dir.directory_prefix();
        let objects = self.bounded("list", self.store.list(&prefix)).await?;
        Ok(objects
            .iter()
            .filter_map(|meta| DocKey::from_object_key(&meta.key))
            .collect())
    }

    /// Health probe: the tier answers a metadata request in time
    pub async fn ping(&self) -> Result<(), TierError> {
        match self.bounded("ping", self.store.head(PING_KEY)).await {
            Ok(_) => Ok(()),
            Err(TierError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// The configured tiers, kept in precedence order, at most one per `Tier`
#[derive(Debug, Clone, Default)]
pub struct TierSet {
    stores: Vec<TierStore>,
}

impl TierSet {
    /// Build from any order; a later store for an already present tier is dropped
    pub fn new(stores: Vec<TierStore>) -> Self {
        let mut unique: Vec<TierStore> = Vec::with_capacity(stores.len());
        for store in stores {
            if unique.iter().all(|s| s.tier != store.tier) {
                unique.push(store);
            }
        }
        unique.sort_by_key(|s| s.tier);
        TierSet { stores: unique }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierStore> {
        self.stores.iter()
    }

    pub fn get(&self, tier: Tier) -> Option<&TierStore> {
        self.stores.iter().find(|s| s.tier == tier)
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.stores.iter().map(|s| s.tier).collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
