//! Object Store Abstraction
//!
//! Every storage medium (relational table, durable volume, legacy directory,
//! backup catalog) is reached through the `ObjectStore` trait so tiers can be
//! swapped, wrapped with fault injection, or replaced by memory in tests.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit tests and simulation
//! - `LocalFsObjectStore`: Volume and Legacy tiers, filesystem backup catalog
//! - `SqliteObjectStore`: Primary tier and table-backed backup catalog

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by every store operation
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Metadata for a stored object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key (path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last modification timestamp (Unix ms)
    pub modified_at_ms: u64,
}

/// Object store abstraction trait
///
/// A missing object is reported as an `io::Error` of kind `NotFound`;
/// callers decide whether that is an error or an empty value.
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Delete an object (deleting a missing object succeeds)
    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// List objects whose key starts with `prefix`, sorted by key
    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>>;

    /// Rename/move an object, replacing the destination (atomic manifest updates)
    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()>;

    /// Get object metadata without downloading content
    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta>;
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn not_found(key: &str) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key))
}

// ============================================================================
// InMemoryObjectStore - For tests and simulation
// ============================================================================

/// In-memory object store. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified_at_ms: u64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys, sorted (for assertions)
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let obj = StoredObject {
                data: data.to_vec(),
                modified_at_ms: now_ms(),
            };
            self.data.write().insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| not_found(key))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.data.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let data = self.data.read();
            let mut objects: Vec<ObjectMeta> = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.data.len() as u64,
                    modified_at_ms: v.modified_at_ms,
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut data = self.data.write();
            match data.remove(from) {
                Some(obj) => {
                    data.insert(to.to_string(), obj);
                    Ok(())
                }
                None => Err(not_found(from)),
            }
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| ObjectMeta {
                    key: key.to_string(),
                    size_bytes: obj.data.len() as u64,
                    modified_at_ms: obj.modified_at_ms,
                })
                .ok_or_else(|| not_found(key))
        })
    }
}

// ============================================================================
// LocalFsObjectStore - Volume / Legacy tiers
// ============================================================================

/// Filesystem object store rooted at `base_path`; keys are relative paths.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectStore {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn meta_for(key: String, metadata: &std::fs::Metadata) -> ObjectMeta {
        ObjectMeta {
            key,
            size_bytes: metadata.len(),
            modified_at_ms: metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// Walk `dir` collecting files whose base-relative key starts with `prefix`
fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, base, prefix, objects)?;
        } else if path.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            // Keys always use '/' regardless of platform
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                let metadata = entry.metadata()?;
                objects.push(LocalFsObjectStore::meta_for(key, &metadata));
            }
        }
    }
    Ok(())
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            Self::ensure_parent(&path).await?;
            tokio::fs::write(&path, data).await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            match tokio::fs::metadata(self.full_path(key)).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.full_path(key)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already deleted
                Err(e) => Err(e),
            }
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            tokio::task::spawn_blocking(move || {
                let prefix_path = base.join(&prefix);
                let search_dir = if prefix_path.is_dir() {
                    prefix_path
                } else {
                    prefix_path
                        .parent()
                        .filter(|p| p.starts_with(&base))
                        .unwrap_or(&base)
                        .to_path_buf()
                };
                if !search_dir.exists() {
                    return Ok(Vec::new());
                }
                let mut objects = Vec::new();
                walk_dir(&search_dir, &base, &prefix, &mut objects)?;
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(objects)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, format!("list task failed: {}", e)))?
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let to_path = self.full_path(to);
            Self::ensure_parent(&to_path).await?;
            tokio::fs::rename(self.full_path(from), &to_path).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(self.full_path(key)).await?;
            if !metadata.is_file() {
                return Err(not_found(key));
            }
            Ok(Self::meta_for(key.to_string(), &metadata))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store.put("docs/templates.json", b"[]").await.unwrap();
        let data = store.get("docs/templates.json").await.unwrap();

        assert_eq!(data, b"[]");
    }

    #[tokio::test]
    async fn test_inmemory_missing_is_not_found() {
        let store = InMemoryObjectStore::new();

        let err = store.get("missing.json").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!store.exists("missing.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_list_prefix() {
        let store = InMemoryObjectStore::new();

        store.put("reports/2.json", b"b").await.unwrap();
        store.put("reports/1.json", b"a").await.unwrap();
        store.put("templates.json", b"c").await.unwrap();

        let objects = store.list("reports/").await.unwrap();
        let keys: Vec<&str> = objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["reports/1.json", "reports/2.json"]);
    }

    #[tokio::test]
    async fn test_inmemory_rename_replaces_target() {
        let store = InMemoryObjectStore::new();

        store.put("manifest.json", b"old").await.unwrap();
        store.put("manifest.json.tmp", b"new").await.unwrap();
        store.rename("manifest.json.tmp", "manifest.json").await.unwrap();

        assert!(!store.exists("manifest.json.tmp").await.unwrap());
        assert_eq!(store.get("manifest.json").await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_localfs_put_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().join("volume"));

        store.put("reports/7.json", b"[1]").await.unwrap();

        assert!(dir.path().join("volume/reports/7.json").is_file());
        assert_eq!(store.get("reports/7.json").await.unwrap(), b"[1]");
        assert_eq!(store.head("reports/7.json").await.unwrap().size_bytes, 3);
    }

    #[tokio::test]
    async fn test_localfs_list_nested_and_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.put("reports/1.json", b"a").await.unwrap();
        store.put("reports/2023/2.json", b"b").await.unwrap();
        store.put("users.json", b"c").await.unwrap();

        let keys: Vec<String> = store
            .list("reports/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["reports/1.json", "reports/2023/2.json"]);

        let absent = LocalFsObjectStore::new(dir.path().join("not-mounted"));
        assert!(absent.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_localfs_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());

        store.delete("never-written.json").await.unwrap();
    }
}
