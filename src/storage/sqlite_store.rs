//! SQLite-backed object store (Primary tier)
//!
//! Documents live as rows of a two-column-plus-timestamp table, one row per
//! key. The same database can also host the backup catalog in a separate
//! table, so the primary store doubles as backup storage when configured.
//!
//! `rusqlite` is blocking; every call runs on `spawn_blocking` with the
//! connection behind a mutex so the async runtime never stalls on disk.

use crate::storage::object_store::{now_ms, ObjectMeta, ObjectStore, StoreFuture};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;
use std::sync::Arc;

/// Tables managed by this store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqliteTable {
    /// Business documents
    Documents,
    /// Backup manifests and payloads
    BackupObjects,
}

impl SqliteTable {
    pub fn name(&self) -> &'static str {
        match self {
            SqliteTable::Documents => "documents",
            SqliteTable::BackupObjects => "backup_objects",
        }
    }

    fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                doc_key TEXT PRIMARY KEY,
                payload BLOB NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )",
            self.name()
        )
    }
}

fn sqlite_to_io(e: rusqlite::Error) -> IoError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => IoError::new(ErrorKind::NotFound, e.to_string()),
        other => IoError::new(ErrorKind::Other, format!("sqlite: {}", other)),
    }
}

/// Object store over one table of a SQLite database
#[derive(Clone)]
pub struct SqliteObjectStore {
    conn: Arc<Mutex<Connection>>,
    table: SqliteTable,
}

impl std::fmt::Debug for SqliteObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteObjectStore")
            .field("table", &self.table.name())
            .finish()
    }
}

impl SqliteObjectStore {
    /// Open (or create) the database file and ensure the documents table
    pub fn open(path: &Path) -> IoResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(sqlite_to_io)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests)
    pub fn open_in_memory() -> IoResult<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_to_io)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> IoResult<Self> {
        conn.execute(&SqliteTable::Documents.create_sql(), [])
            .map_err(sqlite_to_io)?;
        Ok(SqliteObjectStore {
            conn: Arc::new(Mutex::new(conn)),
            table: SqliteTable::Documents,
        })
    }

    /// A store over another table of the same database, sharing the connection
    pub fn table(&self, table: SqliteTable) -> IoResult<Self> {
        self.conn
            .lock()
            .execute(&table.create_sql(), [])
            .map_err(sqlite_to_io)?;
        Ok(SqliteObjectStore {
            conn: Arc::clone(&self.conn),
            table,
        })
    }

    async fn run<T, F>(&self, op: F) -> IoResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &'static str) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = self.table.name();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            op(&guard, table)
        })
        .await
        .map_err(|e| IoError::new(ErrorKind::Other, format!("sqlite task failed: {}", e)))?
        .map_err(sqlite_to_io)
    }
}

impl ObjectStore for SqliteObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        let key = key.to_string();
        let data = data.to_vec();
        Box::pin(async move {
            self.run(move |conn, table| {
                conn.execute(
                    &format!(
                        "INSERT INTO {} (doc_key, payload, updated_at_ms) VALUES (?1, ?2, ?3)
                         ON CONFLICT(doc_key) DO UPDATE SET
                            payload = excluded.payload,
                            updated_at_ms = excluded.updated_at_ms",
                        table
                    ),
                    params![key, data, now_ms() as i64],
                )
                .map(|_| ())
            })
            .await
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        let key = key.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                conn.query_row(
                    &format!("SELECT payload FROM {} WHERE doc_key = ?1", table),
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
            })
            .await
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        let key = key.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                conn.query_row(
                    &format!("SELECT 1 FROM {} WHERE doc_key = ?1", table),
                    params![key],
                    |_| Ok(()),
                )
                .optional()
                .map(|row| row.is_some())
            })
            .await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                conn.execute(
                    &format!("DELETE FROM {} WHERE doc_key = ?1", table),
                    params![key],
                )
                .map(|_| ())
            })
            .await
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StoreFuture<'a, Vec<ObjectMeta>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                // substr() instead of LIKE: keys may contain '_' and '%'
                let mut stmt = conn.prepare(&format!(
                    "SELECT doc_key, length(payload), updated_at_ms FROM {}
                     WHERE substr(doc_key, 1, ?1) = ?2 ORDER BY doc_key",
                    table
                ))?;
                let rows = stmt.query_map(params![prefix.chars().count() as i64, prefix], |row| {
                    Ok(ObjectMeta {
                        key: row.get(0)?,
                        size_bytes: row.get::<_, i64>(1)?.max(0) as u64,
                        modified_at_ms: row.get::<_, i64>(2)?.max(0) as u64,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
        })
    }

    fn rename<'a>(&'a self, from: &'a str, to: &'a str) -> StoreFuture<'a, ()> {
        let from = from.to_string();
        let to = to.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                let tx = conn.unchecked_transaction()?;
                let copied = tx.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {t} (doc_key, payload, updated_at_ms)
                         SELECT ?2, payload, updated_at_ms FROM {t} WHERE doc_key = ?1",
                        t = table
                    ),
                    params![from, to],
                )?;
                if copied == 0 {
                    return Err(rusqlite::Error::QueryReturnedNoRows);
                }
                tx.execute(
                    &format!("DELETE FROM {} WHERE doc_key = ?1", table),
                    params![from],
                )?;
                tx.commit()
            })
            .await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            self.run(move |conn, table| {
                conn.query_row(
                    &format!(
                        "SELECT doc_key, length(payload), updated_at_ms FROM {} WHERE doc_key = ?1",
                        table
                    ),
                    params![key],
                    |row| {
                        Ok(ObjectMeta {
                            key: row.get(0)?,
                            size_bytes: row.get::<_, i64>(1)?.max(0) as u64,
                            modified_at_ms: row.get::<_, i64>(2)?.max(0) as u64,
                        })
                    },
                )
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_put_get_overwrite() {
        let store = SqliteObjectStore::open_in_memory().unwrap();

        store.put("templates.json", b"[1]").await.unwrap();
        store.put("templates.json", b"[1,2]").await.unwrap();

        assert_eq!(store.get("templates.json").await.unwrap(), b"[1,2]");
        assert!(store.exists("templates.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_missing_is_not_found() {
        let store = SqliteObjectStore::open_in_memory().unwrap();

        let err = store.get("missing.json").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            store.head("missing.json").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(!store.exists("missing.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_list_prefix_with_underscores() {
        let store = SqliteObjectStore::open_in_memory().unwrap();

        store.put("analysis_cache/a.json", b"1").await.unwrap();
        store.put("analysisXcache/b.json", b"2").await.unwrap();
        store.put("reports/1.json", b"3").await.unwrap();

        let keys: Vec<String> = store
            .list("analysis_cache/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["analysis_cache/a.json"]);
    }

    #[tokio::test]
    async fn test_sqlite_rename_and_tables_are_isolated() {
        let docs = SqliteObjectStore::open_in_memory().unwrap();
        let backups = docs.table(SqliteTable::BackupObjects).unwrap();

        backups.put("b1/manifest.json.tmp", b"{}").await.unwrap();
        backups
            .rename("b1/manifest.json.tmp", "b1/manifest.json")
            .await
            .unwrap();

        assert!(backups.exists("b1/manifest.json").await.unwrap());
        assert!(!backups.exists("b1/manifest.json.tmp").await.unwrap());
        assert!(!docs.exists("b1/manifest.json").await.unwrap());

        let err = backups.rename("nope", "other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_sqlite_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/primary.sqlite");

        {
            let store = SqliteObjectStore::open(&path).unwrap();
            store.put("colleges.json", b"[]").await.unwrap();
        }

        let reopened = SqliteObjectStore::open(&path).unwrap();
        assert_eq!(reopened.get("colleges.json").await.unwrap(), b"[]");
    }
}
