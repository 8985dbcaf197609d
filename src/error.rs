//! Error taxonomy surfaced to callers of the persistence service.
//!
//! Tier-level failures never unwind an operation: they are collected into
//! per-call results (`PerTierResult`, `RestoreResult`). Only validation
//! failures, aborted restores and explicit lookups of absent backups reach
//! the caller as `Err`.

use crate::backup::{BackupError, RestoreError};

/// Rejected input: bad document key or malformed document shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The document key violates the key grammar
    InvalidDocKey { key: String, reason: &'static str },
    /// The payload cannot be stored as a document
    InvalidDocument { doc_key: String, reason: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidDocKey { key, reason } => {
                write!(f, "Invalid document key {:?}: {}", key, reason)
            }
            ValidationError::InvalidDocument { doc_key, reason } => {
                write!(f, "Invalid document {}: {}", doc_key, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Coarse classification used by transport layers to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TierUnavailable,
    RestoreAborted,
    Validation,
    Conflict,
    Configuration,
}

/// Error returned by `PersistenceService` operations
#[derive(Debug)]
pub enum PersistError {
    /// Backup (or other addressed object) does not exist
    NotFound(String),
    /// No tier or backup store could serve the request
    TierUnavailable(String),
    /// The pre-restore safety snapshot failed; nothing was mutated
    RestoreAborted { backup_id: String, reason: String },
    /// Input rejected before any tier write
    Validation(ValidationError),
    /// Operation refused in the current state (e.g. deleting a protected backup)
    Conflict(String),
    /// Storage could not be assembled from the configuration
    Configuration(String),
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistError::NotFound(_) => ErrorKind::NotFound,
            PersistError::TierUnavailable(_) => ErrorKind::TierUnavailable,
            PersistError::RestoreAborted { .. } => ErrorKind::RestoreAborted,
            PersistError::Validation(_) => ErrorKind::Validation,
            PersistError::Conflict(_) => ErrorKind::Conflict,
            PersistError::Configuration(_) => ErrorKind::Configuration,
        }
    }
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::NotFound(what) => write!(f, "Not found: {}", what),
            PersistError::TierUnavailable(msg) => write!(f, "Storage unavailable: {}", msg),
            PersistError::RestoreAborted { backup_id, reason } => write!(
                f,
                "Restore of {} aborted before any change: {}",
                backup_id, reason
            ),
            PersistError::Validation(e) => write!(f, "{}", e),
            PersistError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            PersistError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for PersistError {
    fn from(e: ValidationError) -> Self {
        PersistError::Validation(e)
    }
}

impl From<BackupError> for PersistError {
    fn from(e: BackupError) -> Self {
        match e {
            BackupError::NotFound(id) => PersistError::NotFound(format!("backup {}", id)),
            BackupError::Protected(id) => {
                PersistError::Conflict(format!("backup {} is protected", id))
            }
            other => PersistError::TierUnavailable(other.to_string()),
        }
    }
}

impl From<RestoreError> for PersistError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::NotFound(id) => PersistError::NotFound(format!("backup {}", id)),
            RestoreError::Aborted { backup_id, reason } => {
                PersistError::RestoreAborted { backup_id, reason }
            }
            RestoreError::Lookup(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_errors_map_to_kinds() {
        let not_found: PersistError = BackupError::NotFound("b1".into()).into();
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let protected: PersistError = BackupError::Protected("b2".into()).into();
        assert_eq!(protected.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_restore_abort_is_hard_failure() {
        let err: PersistError = RestoreError::Aborted {
            backup_id: "b1".into(),
            reason: "backup store offline".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::RestoreAborted);
        assert!(err.to_string().contains("b1"));
    }
}
