//! Restore from a backup
//!
//! ## Restore sequence
//!
//! 1. Resolve the manifest
//! 2. Take a protected, strict safety-net backup of the current state: any
//!    item that cannot be read or stored fails it, and the restore stops
//!    before touching any tier
//! 3. Apply each item through write-through, recording per-item outcomes
//!
//! Checksums are checked but never block: tiers that re-serialize JSON
//! change bytes without changing meaning.

use crate::backup::manager::{BackupManager, BackupOptions};
use crate::backup::manifest::{BackupError, BackupFile};
use crate::config::USERS_DOCUMENT;
use crate::document::DocKey;
use crate::storage::{ChecksumCodec, Tier};
use crate::write_through::WriteThroughCoordinator;
use serde_json::Value;
use tracing::{info, warn};

/// Error type for restore operations
#[derive(Debug)]
pub enum RestoreError {
    /// No backup with this id
    NotFound(String),
    /// The safety-net snapshot failed; no tier was modified
    Aborted { backup_id: String, reason: String },
    /// The manifest could not be read
    Lookup(BackupError),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::NotFound(id) => write!(f, "Backup not found: {}", id),
            RestoreError::Aborted { backup_id, reason } => {
                write!(f, "Restore of {} aborted: {}", backup_id, reason)
            }
            RestoreError::Lookup(e) => write!(f, "Backup lookup failed: {}", e),
        }
    }
}

impl std::error::Error for RestoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RestoreError::Lookup(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackupError> for RestoreError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::NotFound(id) => RestoreError::NotFound(id),
            other => RestoreError::Lookup(other),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Also restore the authentication principals document
    pub include_users: bool,
}

/// A document written back to the tiers
#[derive(Debug, Clone)]
pub struct RestoredDocument {
    pub doc_key: DocKey,
    pub tiers: Vec<Tier>,
    /// Every configured tier accepted the write
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreFailure {
    pub item: String,
    pub reason: String,
}

/// Stored bytes that no longer hash to the manifest checksum
#[derive(Debug, Clone)]
pub struct IntegrityWarning {
    pub item: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub backup_id: String,
    pub safety_backup_id: String,
    pub restored: Vec<RestoredDocument>,
    /// Items left alone on purpose (e.g. `users.json`)
    pub skipped: Vec<String>,
    pub failed: Vec<RestoreFailure>,
    pub warnings: Vec<IntegrityWarning>,
}

impl RestoreResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Restores backups through the write-through path
#[derive(Debug, Clone)]
pub struct RestoreOrchestrator {
    backups: BackupManager,
    coordinator: WriteThroughCoordinator,
}

impl RestoreOrchestrator {
    pub fn new(backups: BackupManager, coordinator: WriteThroughCoordinator) -> Self {
        RestoreOrchestrator {
            backups,
            coordinator,
        }
    }

    pub async fn restore(&self, backup_id: &str, options: RestoreOptions) -> Result<RestoreResult, RestoreError> {
        let manifest = self.backups.get_backup(backup_id).await?;

        let safety = self
            .backups
            .create_backup_retaining(
                BackupOptions::new(format!(
                    "Pre-restore safety snapshot before restoring {}",
                    backup_id
                ))
                .protected()
                .strict(),
                &[backup_id],
            )
            .await
            .map_err(|e| {
                warn!(backup_id, error = %e, "Safety snapshot failed, restore aborted");
                RestoreError::Aborted {
                    backup_id: backup_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let mut result = RestoreResult {
            backup_id: backup_id.to_string(),
            safety_backup_id: safety.backup_id,
            restored: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
        };

        for file in &manifest.files {
            if file.is_directory() {
                self.restore_directory(backup_id, file, &mut result).await;
            } else {
                self.restore_file(backup_id, file, options, &mut result).await;
            }
        }

        info!(
            backup_id,
            safety_backup_id = %result.safety_backup_id,
            restored = result.restored.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            warnings = result.warnings.len(),
            "Restore finished"
        );
        Ok(result)
    }

    async fn restore_file(&self, backup_id: &str, file: &BackupFile, options: RestoreOptions, result: &mut RestoreResult) {
        let doc_key = match DocKey::from_object_key(&file.name) {
            Some(key) => key,
            None => {
                result.failed.push(RestoreFailure {
                    item: file.name.clone(),
                    reason: "item name is not a document key".to_string(),
                });
                return;
            }
        };
        if doc_key.as_str() == USERS_DOCUMENT && !options.include_users {
            info!(backup_id, item = %file.name, "Skipping user records");
            result.skipped.push(file.name.clone());
            return;
        }

        let bytes = match self.backups.catalog().get_item(backup_id, &file.name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                result.failed.push(RestoreFailure {
                    item: file.name.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        let actual = ChecksumCodec::hash(&bytes);
        if !actual.eq_ignore_ascii_case(&file.checksum) {
            warn!(backup_id, item = %file.name, "Checksum mismatch, restoring anyway");
            result.warnings.push(IntegrityWarning {
                item: file.name.clone(),
                expected: file.checksum.clone(),
                actual,
            });
        }

        self.apply(&file.name, doc_key, &bytes, result).await;
    }

    async fn restore_directory(&self, backup_id: &str, file: &BackupFile, result: &mut RestoreResult) {
        let catalog = self.backups.catalog();
        let members = match catalog.list_directory(backup_id, &file.name).await {
            Ok(members) if !members.is_empty() => members,
            Ok(_) => {
                result.failed.push(RestoreFailure {
                    item: file.name.clone(),
                    reason: "no stored members".to_string(),
                });
                return;
            }
            Err(e) => {
                result.failed.push(RestoreFailure {
                    item: file.name.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let item = format!("{}/{}", file.name, member);
            let bytes = match catalog.get_item(backup_id, &item).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    result.failed.push(RestoreFailure {
                        item,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            entries.push((member, ChecksumCodec::hash(&bytes)));

            match DocKey::from_object_key(&item) {
                Some(doc_key) => self.apply(&item, doc_key, &bytes, result).await,
                None => result.failed.push(RestoreFailure {
                    item,
                    reason: "item name is not a document key".to_string(),
                }),
            }
        }

        entries.sort();
        let actual = ChecksumCodec::hash_directory(entries.iter().map(|(n, c)| (n.as_str(), c.as_str())));
        if !actual.eq_ignore_ascii_case(&file.checksum) {
            warn!(backup_id, item = %file.name, "Directory checksum mismatch, restored anyway");
            result.warnings.push(IntegrityWarning {
                item: file.name.clone(),
                expected: file.checksum.clone(),
                actual,
            });
        }
    }

    async fn apply(&self, item: &str, doc_key: DocKey, bytes: &[u8], result: &mut RestoreResult) {
        let payload: Value = match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                result.failed.push(RestoreFailure {
                    item: item.to_string(),
                    reason: format!("unparseable JSON: {}", e),
                });
                return;
            }
        };

        let write = self.coordinator.apply(&doc_key, &payload).await;
        if write.is_durable() {
            result.restored.push(RestoredDocument {
                doc_key,
                tiers: write.succeeded(),
                complete: write.is_complete(),
            });
        } else {
            result.failed.push(RestoreFailure {
                item: item.to_string(),
                reason: "no tier accepted the write".to_string(),
            });
        }
    }
}
