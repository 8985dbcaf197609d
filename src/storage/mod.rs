//! Storage tiers and the object stores behind them
//!
//! ## Architecture
//!
//! ```text
//! TierStore(Primary) ─→ SqliteObjectStore   (documents table)
//! TierStore(Volume)  ─→ LocalFsObjectStore  (durable mount)
//! TierStore(Legacy)  ─→ LocalFsObjectStore  (relative data dir)
//! BackupCatalog      ─→ LocalFsObjectStore | SqliteObjectStore (backup_objects table)
//! ```
//!
//! Any store can be wrapped in `SimulatedObjectStore` to inject faults.

pub mod checksum;
pub mod object_store;
pub mod simulated_store;
pub mod sqlite_store;
pub mod tier;

pub use checksum::{ChecksumCodec, ContentDigest};
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore, StoreFuture};
pub use simulated_store::{SimulatedObjectStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use sqlite_store::{SqliteObjectStore, SqliteTable};
pub use tier::{Tier, TierError, TierSet, TierStore};
