//! Backups and restores
//!
//! - `manifest`: manifest format and the catalog over the backup store
//! - `manager`: create, list, verify, delete, retention, stats
//! - `restore`: safety-netted restore through write-through

pub mod manager;
pub mod manifest;
pub mod restore;

pub use manager::{
    generate_backup_id, BackupManager, BackupOptions, ItemStatus, ItemVerification, StorageStats,
    VerifyReport,
};
pub use manifest::{
    is_valid_backup_id, BackupCatalog, BackupError, BackupFile, BackupManifest, FileType,
    ManifestMetadata,
};
pub use restore::{
    IntegrityWarning, RestoreError, RestoreFailure, RestoreOptions, RestoreOrchestrator,
    RestoreResult, RestoredDocument,
};
