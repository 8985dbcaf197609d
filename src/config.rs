//! Storage configuration
//!
//! Read once at process start (`StorageConfig::from_env`) and passed into
//! constructors; nothing below the binary looks at the environment.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | TIERVAULT_DATABASE_URL / DATABASE_URL | - | SQLite path; presence enables the Primary tier |
//! | TIERVAULT_VOLUME_PATH | /data | Volume tier root (`off` disables) |
//! | TIERVAULT_LEGACY_PATH | ./data | Legacy tier root (`off` disables) |
//! | TIERVAULT_BACKUP_ROOT | {volume}/backups | Backup directory |
//! | TIERVAULT_BACKUP_STORAGE | filesystem | `filesystem` or `primary` |
//! | TIERVAULT_MAX_BACKUPS | 1000 | Retention cap |
//! | TIERVAULT_MAX_STORAGE_BYTES | 10 GiB | Storage budget reported in stats |
//! | TIERVAULT_TIER_TIMEOUT_MS | 5000 | Per-operation tier timeout |
//! | TIERVAULT_HEAL_ON_LOAD | true | Repair stale tiers when a document is loaded |

use crate::document::DocKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Organizations, account owners, users, templates, KPIs, sessions,
/// security logs, login attempts, previous-report cache
pub const ESSENTIAL_DOCUMENTS: [&str; 9] = [
    "colleges",
    "account_managers",
    "users",
    "templates",
    "kpis",
    "sessions",
    "security_logs",
    "login_attempts",
    "previous_reports_cache",
];

/// Reports, analytics, derived-analysis cache
pub const ESSENTIAL_DIRECTORIES: [&str; 3] = ["reports", "analytics", "analysis_cache"];

/// Document holding authentication principals
pub const USERS_DOCUMENT: &str = "users";

const DEFAULT_MAX_BACKUPS: usize = 1000;
const DEFAULT_MAX_STORAGE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_TIER_TIMEOUT_MS: u64 = 5_000;

/// Where backup units are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStorageKind {
    /// Directory tree under `BackupConfig::root`
    Filesystem,
    /// `backup_objects` table of the primary database
    Primary,
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub storage: BackupStorageKind,
    pub root: PathBuf,
    /// Retention cap: oldest unprotected backups beyond this are deleted
    pub max_backups: usize,
    /// Budget against which usage is reported
    pub max_storage_bytes: u64,
    pub essential_documents: Vec<DocKey>,
    pub essential_directories: Vec<DocKey>,
}

impl BackupConfig {
    pub fn new(root: PathBuf) -> Self {
        BackupConfig {
            storage: BackupStorageKind::Filesystem,
            root,
            max_backups: DEFAULT_MAX_BACKUPS,
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            essential_documents: fixed_keys(&ESSENTIAL_DOCUMENTS),
            essential_directories: fixed_keys(&ESSENTIAL_DIRECTORIES),
        }
    }
}

fn fixed_keys(names: &[&str]) -> Vec<DocKey> {
    // The fixed names satisfy the key grammar; filter_map keeps this total.
    names.iter().filter_map(|n| DocKey::new(*n).ok()).collect()
}

/// Main configuration for the persistence engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; `None` disables the Primary tier
    pub primary_path: Option<PathBuf>,
    /// Volume tier root; `None` disables it
    pub volume_path: Option<PathBuf>,
    /// Legacy tier root; `None` disables it
    pub legacy_path: Option<PathBuf>,
    pub backup: BackupConfig,
    #[serde(with = "duration_millis")]
    pub tier_timeout: Duration,
    pub heal_on_load: bool,
}

impl StorageConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let path_or_off = |name: &str, default: &str| match var(name) {
            Some(v) if v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(PathBuf::from(v)),
            None => Some(PathBuf::from(default)),
        };

        let primary_path = var("TIERVAULT_DATABASE_URL")
            .or_else(|| var("DATABASE_URL"))
            .map(|url| parse_database_url(&url));
        let volume_path = path_or_off("TIERVAULT_VOLUME_PATH", "/data");
        let legacy_path = path_or_off("TIERVAULT_LEGACY_PATH", "./data");

        let root = var("TIERVAULT_BACKUP_ROOT").map(PathBuf::from).unwrap_or_else(|| {
            volume_path
                .as_ref()
                .map(|v| v.join("backups"))
                .unwrap_or_else(|| PathBuf::from("./backups"))
        });
        let mut backup = BackupConfig::new(root);
        backup.storage = match var("TIERVAULT_BACKUP_STORAGE").as_deref() {
            Some(v) if v.eq_ignore_ascii_case("primary") => BackupStorageKind::Primary,
            _ => BackupStorageKind::Filesystem,
        };
        backup.max_backups = var("TIERVAULT_MAX_BACKUPS")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_MAX_BACKUPS);
        backup.max_storage_bytes = var("TIERVAULT_MAX_STORAGE_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_STORAGE_BYTES);

        StorageConfig {
            primary_path,
            volume_path,
            legacy_path,
            backup,
            tier_timeout: Duration::from_millis(
                var("TIERVAULT_TIER_TIMEOUT_MS")
                    .and_then(|v| v.parse().ok())
                    .filter(|ms: &u64| *ms > 0)
                    .unwrap_or(DEFAULT_TIER_TIMEOUT_MS),
            ),
            heal_on_load: var("TIERVAULT_HEAL_ON_LOAD")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(true),
        }
    }

    /// All three tiers plus backups under one directory (tests, local runs)
    pub fn local(root: &Path) -> Self {
        StorageConfig {
            primary_path: Some(root.join("primary.sqlite")),
            volume_path: Some(root.join("volume")),
            legacy_path: Some(root.join("legacy")),
            backup: BackupConfig::new(root.join("backups")),
            tier_timeout: Duration::from_millis(DEFAULT_TIER_TIMEOUT_MS),
            heal_on_load: true,
        }
    }
}

/// Accept `sqlite://path`, `sqlite:path`, `file:path` or a bare path
fn parse_database_url(url: &str) -> PathBuf {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .or_else(|| url.strip_prefix("file:"))
        .unwrap_or(url);
    PathBuf::from(path)
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = StorageConfig::from_lookup(lookup(&[]));
        assert!(config.primary_path.is_none());
        assert_eq!(config.volume_path, Some(PathBuf::from("/data")));
        assert_eq!(config.legacy_path, Some(PathBuf::from("./data")));
        assert_eq!(config.backup.root, PathBuf::from("/data/backups"));
        assert_eq!(config.backup.max_backups, 1000);
        assert_eq!(config.backup.storage, BackupStorageKind::Filesystem);
        assert_eq!(config.tier_timeout, Duration::from_millis(5_000));
        assert!(config.heal_on_load);
        assert_eq!(config.backup.essential_documents.len(), 9);
        assert_eq!(config.backup.essential_directories.len(), 3);
    }

    #[test]
    fn test_database_url_enables_primary() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite:///var/lib/app/primary.db"),
            ("TIERVAULT_BACKUP_STORAGE", "primary"),
            ("TIERVAULT_MAX_BACKUPS", "25"),
            ("TIERVAULT_LEGACY_PATH", "off"),
        ]));
        assert_eq!(config.primary_path, Some(PathBuf::from("/var/lib/app/primary.db")));
        assert_eq!(config.backup.storage, BackupStorageKind::Primary);
        assert_eq!(config.backup.max_backups, 25);
        assert!(config.legacy_path.is_none());
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let config = StorageConfig::from_lookup(lookup(&[
            ("TIERVAULT_MAX_BACKUPS", "zero"),
            ("TIERVAULT_TIER_TIMEOUT_MS", "0"),
            ("TIERVAULT_HEAL_ON_LOAD", "false"),
        ]));
        assert_eq!(config.backup.max_backups, 1000);
        assert_eq!(config.tier_timeout, Duration::from_millis(5_000));
        assert!(!config.heal_on_load);
    }

    #[test]
    fn test_config_serialization() {
        let config = StorageConfig::local(Path::new("/tmp/tv"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tier_timeout, config.tier_timeout);
        assert_eq!(parsed.backup.essential_documents, config.backup.essential_documents);
    }
}
