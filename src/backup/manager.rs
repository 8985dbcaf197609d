//! Backup creation, listing, verification and retention
//!
//! A backup copies the essential documents and directories from one source
//! tier into a new unit of the backup store. The manifest is committed last,
//! so a crash mid-backup leaves only unreferenced data objects behind.

use crate::backup::manifest::{BackupCatalog, BackupError, BackupFile, BackupManifest, FileType};
use crate::config::BackupConfig;
use crate::document::{record_count, DocKey};
use crate::storage::{ChecksumCodec, Tier, TierError, TierSet, TierStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for `BackupManager::create_backup_with`
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub description: String,
    /// Exempt the backup from retention
    pub protected: bool,
    /// Fail the whole backup instead of skipping an item that cannot be
    /// read from the source tier or stored
    pub strict: bool,
}

impl BackupOptions {
    pub fn new(description: impl Into<String>) -> Self {
        BackupOptions {
            description: description.into(),
            protected: false,
            strict: false,
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// Backup store usage against the configured budget
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_backups: u64,
    pub total_size: u64,
    pub available_space: u64,
    pub usage_percentage: f64,
}

/// Result of checking one stored item against its manifest entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Intact,
    ChecksumMismatch { expected: String, actual: String },
    Missing(String),
}

#[derive(Debug, Clone)]
pub struct ItemVerification {
    pub name: String,
    pub status: ItemStatus,
}

/// Audit of a stored backup. Informational: restores proceed regardless.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub backup_id: String,
    pub items: Vec<ItemVerification>,
    /// Manifest metadata that disagrees with its own file list
    pub manifest_problem: Option<String>,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.manifest_problem.is_none() && self.items.iter().all(|i| i.status == ItemStatus::Intact)
    }
}

/// `backup-{YYYYMMDDTHHMMSSfffZ}-{8 hex}`
pub fn generate_backup_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("backup-{}-{}", at.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

/// Creates and manages backup units
#[derive(Debug, Clone)]
pub struct BackupManager {
    tiers: TierSet,
    catalog: BackupCatalog,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(tiers: TierSet, catalog: BackupCatalog, config: BackupConfig) -> Self {
        BackupManager {
            tiers,
            catalog,
            config,
        }
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// First tier in precedence order that answers its health probe and
    /// serves a document read
    async fn source_tier(&self) -> Result<&TierStore, BackupError> {
        for store in self.tiers.iter() {
            match self.probe_source(store).await {
                Ok(()) => return Ok(store),
                Err(e) => warn!(tier = %store.tier(), error = %e, "Skipping unavailable backup source"),
            }
        }
        Err(BackupError::NoSource)
    }

    async fn probe_source(&self, store: &TierStore) -> Result<(), TierError> {
        store.ping().await?;
        if let Some(doc_key) = self.config.essential_documents.first() {
            store.read(doc_key).await?;
        }
        Ok(())
    }

    pub async fn create_backup(&self, description: &str) -> Result<BackupManifest, BackupError> {
        self.create_backup_with(BackupOptions::new(description)).await
    }

    pub async fn create_backup_with(&self, options: BackupOptions) -> Result<BackupManifest, BackupError> {
        self.create_backup_retaining(options, &[]).await
    }

    /// Create a backup; retention afterwards spares the new backup and `retain`
    pub(crate) async fn create_backup_retaining(
        &self,
        options: BackupOptions,
        retain: &[&str],
    ) -> Result<BackupManifest, BackupError> {
        let source = self.source_tier().await?;
        let now = Utc::now();
        let mut manifest = BackupManifest::new(generate_backup_id(now), now, options.description);
        manifest.protected = options.protected;
        manifest.source_tier = Some(source.tier());

        if let Err(e) = self.capture_all(&mut manifest, source, options.strict).await {
            warn!(backup_id = %manifest.backup_id, error = %e, "Backup abandoned");
            if let Err(cleanup) = self.catalog.delete_backup(&manifest.backup_id).await {
                warn!(backup_id = %manifest.backup_id, error = %cleanup, "Failed to remove partial backup");
            }
            return Err(e);
        }

        self.catalog.save_manifest(&manifest).await?;
        info!(
            backup_id = %manifest.backup_id,
            source = %source.tier(),
            files = manifest.metadata.file_count,
            directories = manifest.metadata.directory_count,
            total_size = manifest.metadata.total_size,
            protected = manifest.protected,
            "Backup created"
        );

        let mut keep: Vec<&str> = retain.to_vec();
        keep.push(&manifest.backup_id);
        if let Err(e) = self.enforce_retention(self.config.max_backups, &keep).await {
            warn!(error = %e, "Retention pass failed");
        }
        Ok(manifest)
    }

    async fn capture_all(&self, manifest: &mut BackupManifest, source: &TierStore, strict: bool) -> Result<(), BackupError> {
        let backup_id = manifest.backup_id.clone();
        let doc_type = if source.tier() == Tier::Primary {
            FileType::TierDump
        } else {
            FileType::File
        };

        for doc_key in &self.config.essential_documents {
            if let Some(file) = self.capture_document(&backup_id, source, doc_key, doc_type, strict).await? {
                manifest.add_file(file);
            }
        }
        for dir in &self.config.essential_directories {
            if let Some(file) = self.capture_directory(&backup_id, source, dir, strict).await? {
                manifest.add_file(file);
            }
        }
        Ok(())
    }

    async fn capture_document(
        &self,
        backup_id: &str,
        source: &TierStore,
        doc_key: &DocKey,
        file_type: FileType,
        strict: bool,
    ) -> Result<Option<BackupFile>, BackupError> {
        let name = doc_key.object_key();
        let bytes = match source.read(doc_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(doc_key = %doc_key, "Document absent, not backed up");
                return Ok(None);
            }
            Err(e) => {
                tolerate(strict, &name, e)?;
                return Ok(None);
            }
        };

        if let Err(e) = self.catalog.put_item(backup_id, &name, &bytes).await {
            tolerate(strict, &name, e)?;
            return Ok(None);
        }
        let digest = ChecksumCodec::describe(&bytes);
        Ok(Some(BackupFile {
            name,
            file_type,
            size: digest.size,
            checksum: digest.checksum,
            item_count: count_records(&bytes),
        }))
    }

    async fn capture_directory(
        &self,
        backup_id: &str,
        source: &TierStore,
        dir: &DocKey,
        strict: bool,
    ) -> Result<Option<BackupFile>, BackupError> {
        let members = match source.list_documents(dir).await {
            Ok(members) => members,
            Err(e) => {
                tolerate(strict, dir.as_str(), e)?;
                return Ok(None);
            }
        };
        if members.is_empty() {
            debug!(directory = %dir, "Directory empty, not backed up");
            return Ok(None);
        }

        let prefix = dir.directory_prefix();
        let mut entries: Vec<(String, String)> = Vec::with_capacity(members.len());
        let mut size = 0u64;
        for member in &members {
            let object_key = member.object_key();
            let bytes = match source.read(member).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tolerate(strict, &object_key, e)?;
                    continue;
                }
            };
            let relative = object_key.strip_prefix(&prefix).unwrap_or(&object_key).to_string();
            if let Err(e) = self.catalog.put_item(backup_id, &object_key, &bytes).await {
                tolerate(strict, &object_key, e)?;
                continue;
            }
            size += ChecksumCodec::size(&bytes);
            entries.push((relative, ChecksumCodec::hash(&bytes)));
        }
        if entries.is_empty() {
            return Ok(None);
        }

        entries.sort();
        Ok(Some(BackupFile {
            name: dir.to_string(),
            file_type: FileType::Directory,
            size,
            checksum: ChecksumCodec::hash_directory(entries.iter().map(|(n, c)| (n.as_str(), c.as_str()))),
            item_count: entries.len() as u64,
        }))
    }

    /// Every readable backup, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupManifest>, BackupError> {
        let mut manifests = Vec::new();
        for id in self.catalog.list_ids().await? {
            match self.catalog.load_manifest(&id).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(backup_id = %id, error = %e, "Skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.backup_id.cmp(&a.backup_id))
        });
        Ok(manifests)
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<BackupManifest, BackupError> {
        self.catalog.load_manifest(backup_id).await
    }

    /// Delete a backup; protected backups need `force`
    pub async fn delete_backup(&self, backup_id: &str, force: bool) -> Result<(), BackupError> {
        let manifest = self.catalog.load_manifest(backup_id).await?;
        if manifest.protected && !force {
            return Err(BackupError::Protected(backup_id.to_string()));
        }
        self.catalog.delete_backup(backup_id).await?;
        info!(backup_id, forced = force, "Backup deleted");
        Ok(())
    }

    /// Delete the oldest unprotected backups until at most `max_backups`
    /// remain. Backups named in `keep` are never deleted. Returns deleted ids.
    pub async fn enforce_retention(&self, max_backups: usize, keep: &[&str]) -> Result<Vec<String>, BackupError> {
        let manifests = self.list_backups().await?;
        let mut count = manifests.len();
        let mut deleted = Vec::new();

        for manifest in manifests.iter().rev() {
            if count <= max_backups {
                break;
            }
            if manifest.protected || keep.contains(&manifest.backup_id.as_str()) {
                continue;
            }
            match self.catalog.delete_backup(&manifest.backup_id).await {
                Ok(()) => {
                    count -= 1;
                    deleted.push(manifest.backup_id.clone());
                }
                Err(e) => warn!(backup_id = %manifest.backup_id, error = %e, "Failed to delete expired backup"),
            }
        }

        if !deleted.is_empty() {
            info!(deleted = deleted.len(), remaining = count, max_backups, "Retention applied");
        }
        if count > max_backups {
            warn!(remaining = count, max_backups, "Retention cap exceeded by protected backups");
        }
        Ok(deleted)
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, BackupError> {
        let manifests = self.list_backups().await?;
        let total_size: u64 = manifests.iter().map(|m| m.metadata.total_size).sum();
        let budget = self.config.max_storage_bytes;
        let usage_percentage = if budget == 0 {
            0.0
        } else {
            total_size as f64 * 100.0 / budget as f64
        };
        Ok(StorageStats {
            total_backups: manifests.len() as u64,
            total_size,
            available_space: budget.saturating_sub(total_size),
            usage_percentage,
        })
    }

    /// Re-hash every stored item and compare with the manifest
    pub async fn verify_backup(&self, backup_id: &str) -> Result<VerifyReport, BackupError> {
        let manifest = self.catalog.load_manifest(backup_id).await?;
        let mut items = Vec::with_capacity(manifest.files.len());

        for file in &manifest.files {
            let actual = if file.is_directory() {
                self.directory_checksum(backup_id, &file.name).await
            } else {
                self.catalog
                    .get_item(backup_id, &file.name)
                    .await
                    .map(|bytes| ChecksumCodec::hash(&bytes))
            };
            let status = match actual {
                Ok(actual) if actual.eq_ignore_ascii_case(&file.checksum) => ItemStatus::Intact,
                Ok(actual) => {
                    warn!(backup_id, item = %file.name, "Checksum mismatch");
                    ItemStatus::ChecksumMismatch {
                        expected: file.checksum.clone(),
                        actual,
                    }
                }
                Err(e) => ItemStatus::Missing(e.to_string()),
            };
            items.push(ItemVerification {
                name: file.name.clone(),
                status,
            });
        }

        Ok(VerifyReport {
            backup_id: backup_id.to_string(),
            items,
            manifest_problem: manifest.verify_invariants().err(),
        })
    }

    /// Directory digest recomputed from the stored members
    pub(crate) async fn directory_checksum(&self, backup_id: &str, dir: &str) -> Result<String, BackupError> {
        let members = self.catalog.list_directory(backup_id, dir).await?;
        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            let bytes = self
                .catalog
                .get_item(backup_id, &format!("{}/{}", dir, member))
                .await?;
            entries.push((member, ChecksumCodec::hash(&bytes)));
        }
        entries.sort();
        Ok(ChecksumCodec::hash_directory(
            entries.iter().map(|(n, c)| (n.as_str(), c.as_str())),
        ))
    }
}

/// Skip an item that could not be captured, or fail the backup when `strict`
fn tolerate(strict: bool, item: &str, error: impl std::fmt::Display) -> Result<(), BackupError> {
    if strict {
        return Err(BackupError::Capture {
            item: item.to_string(),
            reason: error.to_string(),
        });
    }
    warn!(item, error = %error, "Skipping item that could not be captured");
    Ok(())
}

fn count_records(bytes: &[u8]) -> u64 {
    serde_json::from_slice::<Value>(bytes)
        .map(|value| record_count(&value))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryObjectStore, ObjectMeta, ObjectStore, StoreFuture};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        manager: BackupManager,
        volume: InMemoryObjectStore,
        backups: InMemoryObjectStore,
    }

    fn fixture(max_backups: usize) -> Fixture {
        let volume = InMemoryObjectStore::new();
        let backups = InMemoryObjectStore::new();
        let tiers = TierSet::new(vec![TierStore::new(
            Tier::Volume,
            Arc::new(volume.clone()),
            Duration::from_secs(1),
        )]);
        let mut config = BackupConfig::new(PathBuf::from("unused"));
        config.max_backups = max_backups;
        config.max_storage_bytes = 1_000;
        Fixture {
            manager: BackupManager::new(tiers, BackupCatalog::new(Arc::new(backups.clone())), config),
            volume,
            backups,
        }
    }

    #[test]
    fn test_backup_id_format() {
        let at = DateTime::parse_from_rfc3339("2024-03-05T06:07:08.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = generate_backup_id(at);
        assert!(id.starts_with("backup-20240305T060708123Z-"));
        assert_eq!(id.len(), "backup-20240305T060708123Z-".len() + 8);
    }

    #[tokio::test]
    async fn test_create_backup_captures_documents_and_directories() {
        let f = fixture(10);
        let colleges = br#"[{"id":1},{"id":2}]"#;
        f.volume.put("colleges.json", colleges).await.unwrap();
        f.volume.put("reports/b.json", b"[]").await.unwrap();
        f.volume.put("reports/a.json", b"{}").await.unwrap();

        let manifest = f.manager.create_backup("nightly").await.unwrap();
        assert_eq!(manifest.source_tier, Some(Tier::Volume));
        assert_eq!(manifest.metadata.file_count, 1);
        assert_eq!(manifest.metadata.directory_count, 1);

        let file = manifest.file("colleges.json").unwrap();
        assert_eq!(file.file_type, FileType::File);
        assert_eq!(file.size, colleges.len() as u64);
        assert_eq!(file.item_count, 2);
        assert_eq!(file.checksum, ChecksumCodec::hash(colleges));

        let dir = manifest.file("reports").unwrap();
        assert_eq!(dir.item_count, 2);
        assert_eq!(dir.size, 4);

        let report = f.manager.verify_backup(&manifest.backup_id).await.unwrap();
        assert!(report.is_intact());
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let f = fixture(10);
        f.volume.put("kpis.json", b"[]").await.unwrap();
        let manifest = f.manager.create_backup("b").await.unwrap();

        f.backups
            .put(&format!("{}/data/kpis.json", manifest.backup_id), b"[ ]")
            .await
            .unwrap();
        let report = f.manager.verify_backup(&manifest.backup_id).await.unwrap();
        assert!(!report.is_intact());
        assert!(matches!(report.items[0].status, ItemStatus::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_retention_spares_protected_backups() {
        let f = fixture(2);
        f.volume.put("kpis.json", b"[]").await.unwrap();

        let protected = f
            .manager
            .create_backup_with(BackupOptions::new("keep me").protected())
            .await
            .unwrap();
        for i in 0..4 {
            f.manager.create_backup(&format!("b{}", i)).await.unwrap();
        }

        let backups = f.manager.list_backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().any(|m| m.backup_id == protected.backup_id));
        assert_eq!(backups[0].description, "b3");
    }

    #[tokio::test]
    async fn test_delete_protected_requires_force() {
        let f = fixture(10);
        let manifest = f
            .manager
            .create_backup_with(BackupOptions::new("safety").protected())
            .await
            .unwrap();

        let err = f.manager.delete_backup(&manifest.backup_id, false).await.unwrap_err();
        assert!(matches!(err, BackupError::Protected(_)));
        f.manager.delete_backup(&manifest.backup_id, true).await.unwrap();
        assert!(matches!(
            f.manager.get_backup(&manifest.backup_id).await,
            Err(BackupError::NotFound(_))
        ));
    }

    /// Fails every read of the listed keys; everything else passes through
    #[derive(Clone)]
    struct FailingReads {
        inner: InMemoryObjectStore,
        keys: Vec<&'static str>,
    }

    impl ObjectStore for FailingReads {
        fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
            self.inner.put(key, data)
        }

        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
            if self.keys.iter().any(|k| *k == key) {
                return Box::pin(async {
                    Err::<Vec<u8>, _>(std::io::Error::new(std::io::ErrorKind::Other, "read failed"))
                });
            }
            self.inner.get(key)
        }

        fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
            self.inner.exists(key)
        }

        fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
            self.inner.delete(key)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
            self.inner.list(prefix)
        }

        fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
            self.inner.rename(from, to)
        }

        fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
            self.inner.head(key)
        }
    }

    fn manager_over(stores: Vec<TierStore>, backups: &InMemoryObjectStore) -> BackupManager {
        BackupManager::new(
            TierSet::new(stores),
            BackupCatalog::new(Arc::new(backups.clone())),
            BackupConfig::new(PathBuf::from("unused")),
        )
    }

    #[tokio::test]
    async fn test_strict_backup_fails_on_unreadable_item() {
        let volume = InMemoryObjectStore::new();
        volume.put("colleges.json", b"[]").await.unwrap();
        volume.put("kpis.json", br#"[{"id":1}]"#).await.unwrap();
        let source = FailingReads {
            inner: volume,
            keys: vec!["kpis.json"],
        };
        let backups = InMemoryObjectStore::new();
        let manager = manager_over(
            vec![TierStore::new(Tier::Volume, Arc::new(source), Duration::from_secs(1))],
            &backups,
        );

        let err = manager
            .create_backup_with(BackupOptions::new("safety").protected().strict())
            .await
            .unwrap_err();
        match err {
            BackupError::Capture { item, .. } => assert_eq!(item, "kpis.json"),
            other => panic!("unexpected error: {}", other),
        }
        // Nothing from the abandoned backup is left behind.
        assert!(backups.list("").await.unwrap().is_empty());
        assert!(manager.list_backups().await.unwrap().is_empty());

        // A regular backup skips the unreadable item instead.
        let manifest = manager.create_backup("nightly").await.unwrap();
        assert!(manifest.file("colleges.json").is_some());
        assert!(manifest.file("kpis.json").is_none());
    }

    #[tokio::test]
    async fn test_source_must_serve_reads() {
        let volume = FailingReads {
            inner: InMemoryObjectStore::new(),
            keys: vec!["colleges.json"],
        };
        let legacy = InMemoryObjectStore::new();
        legacy.put("kpis.json", b"[]").await.unwrap();
        let backups = InMemoryObjectStore::new();
        let manager = manager_over(
            vec![
                TierStore::new(Tier::Volume, Arc::new(volume), Duration::from_secs(1)),
                TierStore::new(Tier::Legacy, Arc::new(legacy), Duration::from_secs(1)),
            ],
            &backups,
        );

        let manifest = manager.create_backup("fallback").await.unwrap();
        assert_eq!(manifest.source_tier, Some(Tier::Legacy));
        assert!(manifest.file("kpis.json").is_some());
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let f = fixture(10);
        f.volume.put("kpis.json", &[b' '; 100]).await.unwrap();
        f.manager.create_backup("one").await.unwrap();
        f.manager.create_backup("two").await.unwrap();

        let stats = f.manager.get_storage_stats().await.unwrap();
        assert_eq!(stats.total_backups, 2);
        assert_eq!(stats.total_size, 200);
        assert_eq!(stats.available_space, 800);
        assert!((stats.usage_percentage - 20.0).abs() < f64::EPSILON);
    }
}
