//! Multi-tier document persistence
//!
//! Logical JSON documents are kept on up to three independently failing
//! tiers (a relational primary, a durable volume, a legacy directory).
//! Reads reconcile the copies record by record with last-write-wins,
//! writes go to every tier best-effort, and backups capture the essential
//! documents with checksummed manifests and safety-netted restores.

pub mod backup;
pub mod config;
pub mod document;
pub mod error;
pub mod observability;
pub mod reconcile;
pub mod service;
pub mod storage;
pub mod write_through;

pub use backup::{
    BackupManager, BackupManifest, RestoreOptions, RestoreOrchestrator, RestoreResult,
    StorageStats, VerifyReport,
};
pub use config::{BackupConfig, BackupStorageKind, StorageConfig};
pub use document::{DocKey, RecordKey};
pub use error::{ErrorKind, PersistError, ValidationError};
pub use reconcile::{ReconciliationEngine, ReconciliationOutcome, TierSnapshot};
pub use service::PersistenceService;
pub use storage::{Tier, TierSet, TierStore};
pub use write_through::{HealReport, PerTierResult, WriteThroughCoordinator};
