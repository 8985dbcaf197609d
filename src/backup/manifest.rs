//! Backup manifests and the catalog that stores them
//!
//! ## Layout in the backup store
//!
//! ```text
//! {backupId}/manifest.json         written last, via manifest.json.tmp + rename
//! {backupId}/data/colleges.json    one object per captured document
//! {backupId}/data/reports/17.json  directories contribute one object per member
//! ```
//!
//! A backup without `manifest.json` is incomplete and invisible to listing.

use crate::storage::{ObjectStore, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Error type for backup operations
#[derive(Debug)]
pub enum BackupError {
    /// I/O error from the backup store
    Io(IoError),
    /// Manifest serialization/deserialization error
    Json(serde_json::Error),
    /// No backup with this id
    NotFound(String),
    /// Protected backups are only deleted when forced
    Protected(String),
    /// No configured tier answered the health probe and served a read
    NoSource,
    /// A strict backup could not read or store one of its items
    Capture { item: String, reason: String },
}

impl std::fmt::Display for BackupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupError::Io(e) => write!(f, "Backup store I/O error: {}", e),
            BackupError::Json(e) => write!(f, "Manifest JSON error: {}", e),
            BackupError::NotFound(id) => write!(f, "Backup not found: {}", id),
            BackupError::Protected(id) => write!(f, "Backup {} is protected", id),
            BackupError::NoSource => write!(f, "No storage tier available to back up from"),
            BackupError::Capture { item, reason } => write!(f, "Could not capture {}: {}", item, reason),
        }
    }
}

impl std::error::Error for BackupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackupError::Io(e) => Some(e),
            BackupError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for BackupError {
    fn from(e: IoError) -> Self {
        BackupError::Io(e)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Json(e)
    }
}

/// Kind of captured item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    /// Document read from a file tier
    File,
    /// Every document under a directory key
    Directory,
    /// Document read from the relational tier
    TierDump,
}

/// One captured item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    /// `colleges.json` for documents, `reports` for directories
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub size: u64,
    pub checksum: String,
    pub item_count: u64,
}

impl BackupFile {
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    pub total_size: u64,
    pub file_count: u64,
    pub directory_count: u64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Immutable description of one backup unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub files: Vec<BackupFile>,
    pub metadata: ManifestMetadata,
    /// Exempt from retention and from unforced deletion
    #[serde(default, skip_serializing_if = "is_false")]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tier: Option<Tier>,
}

impl BackupManifest {
    pub fn new(backup_id: String, timestamp: DateTime<Utc>, description: String) -> Self {
        BackupManifest {
            backup_id,
            timestamp,
            description,
            files: Vec::new(),
            metadata: ManifestMetadata::default(),
            protected: false,
            source_tier: None,
        }
    }

    /// Record an item and keep the metadata totals in step
    pub fn add_file(&mut self, file: BackupFile) {
        self.metadata.total_size += file.size;
        if file.is_directory() {
            self.metadata.directory_count += 1;
        } else {
            self.metadata.file_count += 1;
        }
        self.files.push(file);
    }

    pub fn file(&self, name: &str) -> Option<&BackupFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Check the metadata against the file list.
    ///
    /// # Invariants
    /// - item names are unique
    /// - `totalSize` is the sum of item sizes
    /// - `fileCount` + `directoryCount` equals the number of items
    pub fn verify_invariants(&self) -> Result<(), String> {
        let mut names = HashSet::with_capacity(self.files.len());
        if let Some(dup) = self.files.iter().find(|f| !names.insert(f.name.as_str())) {
            return Err(format!("duplicate item {}", dup.name));
        }

        let total: u64 = self.files.iter().map(|f| f.size).sum();
        if total != self.metadata.total_size {
            return Err(format!(
                "totalSize {} does not match item sizes {}",
                self.metadata.total_size, total
            ));
        }

        let dirs = self.files.iter().filter(|f| f.is_directory()).count() as u64;
        let files = self.files.len() as u64 - dirs;
        if dirs != self.metadata.directory_count || files != self.metadata.file_count {
            return Err(format!(
                "counts {}/{} do not match items {}/{}",
                self.metadata.file_count, self.metadata.directory_count, files, dirs
            ));
        }
        Ok(())
    }
}

/// Backup ids are plain path segments: letters, digits, `-`, `_`
pub fn is_valid_backup_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Object-level access to backup units in a backup store
#[derive(Clone)]
pub struct BackupCatalog {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for BackupCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCatalog").finish_non_exhaustive()
    }
}

impl BackupCatalog {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        BackupCatalog { store }
    }

    fn manifest_key(backup_id: &str) -> String {
        format!("{}/manifest.json", backup_id)
    }

    fn data_key(backup_id: &str, item: &str) -> String {
        format!("{}/data/{}", backup_id, item)
    }

    fn checked(backup_id: &str) -> Result<(), BackupError> {
        if is_valid_backup_id(backup_id) {
            Ok(())
        } else {
            Err(BackupError::NotFound(backup_id.to_string()))
        }
    }

    /// Save a manifest atomically (temp + rename)
    pub async fn save_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError> {
        Self::checked(&manifest.backup_id)?;
        let data = serde_json::to_vec_pretty(manifest)?;
        let key = Self::manifest_key(&manifest.backup_id);
        let temp_key = format!("{}.tmp", key);

        self.store.put(&temp_key, &data).await?;
        self.store.rename(&temp_key, &key).await?;
        Ok(())
    }

    pub async fn load_manifest(&self, backup_id: &str) -> Result<BackupManifest, BackupError> {
        Self::checked(backup_id)?;
        let data = match self.store.get(&Self::manifest_key(backup_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::NotFound(backup_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Ids of every backup with a committed manifest, sorted
    pub async fn list_ids(&self) -> Result<Vec<String>, BackupError> {
        let objects = self.store.list("").await?;
        Ok(objects
            .iter()
            .filter_map(|meta| meta.key.strip_suffix("/manifest.json"))
            .filter(|id| is_valid_backup_id(id))
            .map(str::to_string)
            .collect())
    }

    pub async fn put_item(&self, backup_id: &str, item: &str, data: &[u8]) -> Result<(), BackupError> {
        Self::checked(backup_id)?;
        Ok(self.store.put(&Self::data_key(backup_id, item), data).await?)
    }

    pub async fn get_item(&self, backup_id: &str, item: &str) -> Result<Vec<u8>, BackupError> {
        Self::checked(backup_id)?;
        Ok(self.store.get(&Self::data_key(backup_id, item)).await?)
    }

    /// Members stored under a directory item, as paths relative to the
    /// directory (`17.json`), sorted
    pub async fn list_directory(&self, backup_id: &str, dir: &str) -> Result<Vec<String>, BackupError> {
        Self::checked(backup_id)?;
        let prefix = Self::data_key(backup_id, &format!("{}/", dir));
        let objects = self.store.list(&prefix).await?;
        Ok(objects
            .iter()
            .filter_map(|meta| meta.key.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    /// Remove every object of a backup, manifest first
    pub async fn delete_backup(&self, backup_id: &str) -> Result<(), BackupError> {
        Self::checked(backup_id)?;
        self.store.delete(&Self::manifest_key(backup_id)).await?;
        let prefix = format!("{}/", backup_id);
        for meta in self.store.list(&prefix).await? {
            self.store.delete(&meta.key).await?;
        }
        Ok(())
    }
}
