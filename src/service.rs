//! The persistence boundary used by request handlers
//!
//! `PersistenceService` is the only type callers need: it owns the tier set,
//! the write-through coordinator and the backup machinery, all assembled from
//! one `StorageConfig`. Authentication and transport mapping stay with the
//! caller; `PersistError::kind` tells them which response to produce.

use crate::backup::{
    BackupCatalog, BackupManager, BackupManifest, BackupOptions, RestoreOptions,
    RestoreOrchestrator, RestoreResult, StorageStats, VerifyReport,
};
use crate::config::{BackupConfig, BackupStorageKind, StorageConfig};
use crate::document::{validate_payload, DocKey, RecordKey};
use crate::error::{PersistError, ValidationError};
use crate::storage::{
    LocalFsObjectStore, ObjectStore, SqliteObjectStore, SqliteTable, Tier, TierSet, TierStore,
};
use crate::write_through::{HealReport, PerTierResult, WriteThroughCoordinator};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PersistenceService {
    coordinator: WriteThroughCoordinator,
    backups: BackupManager,
    restorer: RestoreOrchestrator,
    heal_on_load: bool,
}

impl PersistenceService {
    /// Assemble tiers and the backup store described by `config`
    pub async fn open(config: &StorageConfig) -> Result<Self, PersistError> {
        let mut stores = Vec::new();

        let primary = match &config.primary_path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        PersistError::Configuration(format!("{}: {}", parent.display(), e))
                    })?;
                }
                let db = SqliteObjectStore::open(path).map_err(|e| {
                    PersistError::Configuration(format!("cannot open {}: {}", path.display(), e))
                })?;
                stores.push(TierStore::new(Tier::Primary, Arc::new(db.clone()), config.tier_timeout));
                Some(db)
            }
            None => None,
        };
        if let Some(path) = &config.volume_path {
            stores.push(TierStore::new(
                Tier::Volume,
                Arc::new(LocalFsObjectStore::new(path.clone())),
                config.tier_timeout,
            ));
        }
        if let Some(path) = &config.legacy_path {
            stores.push(TierStore::new(
                Tier::Legacy,
                Arc::new(LocalFsObjectStore::new(path.clone())),
                config.tier_timeout,
            ));
        }
        if stores.is_empty() {
            return Err(PersistError::Configuration(
                "no storage tier is enabled".to_string(),
            ));
        }

        let backup_store: Arc<dyn ObjectStore> = match (config.backup.storage, primary) {
            (BackupStorageKind::Filesystem, _) => {
                Arc::new(LocalFsObjectStore::new(config.backup.root.clone()))
            }
            (BackupStorageKind::Primary, Some(db)) => {
                Arc::new(db.table(SqliteTable::BackupObjects).map_err(|e| {
                    PersistError::Configuration(format!("cannot prepare backup table: {}", e))
                })?)
            }
            (BackupStorageKind::Primary, None) => {
                return Err(PersistError::Configuration(
                    "backup storage 'primary' needs a database".to_string(),
                ))
            }
        };

        let tiers = TierSet::new(stores);
        info!(
            tiers = ?tiers.tiers(),
            backup_storage = ?config.backup.storage,
            timeout_ms = config.tier_timeout.as_millis() as u64,
            "Persistence service ready"
        );
        Ok(Self::from_parts(
            tiers,
            backup_store,
            config.backup.clone(),
            config.heal_on_load,
        ))
    }

    /// Build from already constructed stores (tests, embedding)
    pub fn from_parts(
        tiers: TierSet,
        backup_store: Arc<dyn ObjectStore>,
        backup_config: BackupConfig,
        heal_on_load: bool,
    ) -> Self {
        let coordinator = WriteThroughCoordinator::new(tiers.clone());
        let backups = BackupManager::new(tiers, BackupCatalog::new(backup_store), backup_config);
        let restorer = RestoreOrchestrator::new(backups.clone(), coordinator.clone());
        PersistenceService {
            coordinator,
            backups,
            restorer,
            heal_on_load,
        }
    }

    pub fn tiers(&self) -> &TierSet {
        self.coordinator.tiers()
    }

    pub fn coordinator(&self) -> &WriteThroughCoordinator {
        &self.coordinator
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// Reconciled document, or `None` when no tier has it
    pub async fn load_document(&self, doc_key: &str) -> Result<Option<Value>, PersistError> {
        let doc_key = DocKey::new(doc_key)?;
        let outcome = if self.heal_on_load {
            self.coordinator.heal(&doc_key).await.outcome
        } else {
            self.coordinator.load(&doc_key).await
        };
        Ok(outcome.payload)
    }

    /// Validate and write to every tier. Partial tier failure is reported
    /// in the result, not as an error.
    pub async fn save_document(&self, doc_key: &str, payload: Value) -> Result<PerTierResult, PersistError> {
        let doc_key = DocKey::new(doc_key)?;
        validate_payload(&doc_key, &payload)?;
        Ok(self.coordinator.apply(&doc_key, &payload).await)
    }

    /// Locked read-modify-write of one document
    pub async fn update_document<F>(&self, doc_key: &str, f: F) -> Result<PerTierResult, PersistError>
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let doc_key = DocKey::new(doc_key)?;
        Ok(self.coordinator.update(&doc_key, f).await?)
    }

    /// Remove records by id from every tier
    pub async fn delete_records(&self, doc_key: &str, ids: &[Value]) -> Result<PerTierResult, PersistError> {
        let doc_key = DocKey::new(doc_key)?;
        let keys = ids
            .iter()
            .map(|id| {
                RecordKey::from_id(id).ok_or_else(|| ValidationError::InvalidDocument {
                    doc_key: doc_key.to_string(),
                    reason: format!("{} is not a record id", id),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.coordinator.delete_records(&doc_key, &keys).await)
    }

    pub async fn heal_document(&self, doc_key: &str) -> Result<HealReport, PersistError> {
        let doc_key = DocKey::new(doc_key)?;
        Ok(self.coordinator.heal(&doc_key).await)
    }

    pub async fn create_backup(&self, description: &str) -> Result<BackupManifest, PersistError> {
        Ok(self.backups.create_backup(description).await?)
    }

    pub async fn create_protected_backup(&self, description: &str) -> Result<BackupManifest, PersistError> {
        Ok(self
            .backups
            .create_backup_with(BackupOptions::new(description).protected())
            .await?)
    }

    /// Newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>, PersistError> {
        Ok(self.backups.list_backups().await?)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupManifest, PersistError> {
        Ok(self.backups.get_backup(backup_id).await?)
    }

    pub async fn delete_backup(&self, backup_id: &str, force: bool) -> Result<(), PersistError> {
        Ok(self.backups.delete_backup(backup_id, force).await?)
    }

    pub async fn verify_backup(&self, backup_id: &str) -> Result<VerifyReport, PersistError> {
        Ok(self.backups.verify_backup(backup_id).await?)
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, PersistError> {
        Ok(self.backups.get_storage_stats().await?)
    }

    /// Restore with default options (user records are left alone)
    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreResult, PersistError> {
        self.restore_backup_with(backup_id, RestoreOptions::default()).await
    }

    pub async fn restore_backup_with(
        &self,
        backup_id: &str,
        options: RestoreOptions,
    ) -> Result<RestoreResult, PersistError> {
        Ok(self.restorer.restore(backup_id, options).await?)
    }
}
