//! Error types for genstore_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using genstore_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store, ledger, GC and generation operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error outside of an ingest placement.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Writing an object into the store failed; the ledger was rolled back.
    #[error("Store write failed at {path}: {source}")]
    StoreWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No object with this hash is addressable.
    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    /// A draft build was abandoned before commit.
    #[error("Build aborted: {reason}")]
    BuildAborted { reason: String },

    /// The metadata ledger could not complete the request.
    #[error("Ledger unavailable: {source}")]
    LedgerUnavailable {
        #[from]
        source: rusqlite::Error,
    },

    /// Refused to collect a generation the retention policy keeps.
    #[error("Retention violation for generation {id}: {reason}")]
    RetentionViolation { id: u64, reason: String },

    /// Physical deletion of a trash entry failed.
    #[error("Failed to delete {path}: {source}")]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No committed generation with this id.
    #[error("Generation not found: {id}")]
    GenerationNotFound { id: u64 },

    /// Rollback requested but nothing precedes the active generation.
    #[error("No generation precedes the active one")]
    NoPriorGeneration,

    /// A committed root set references objects that are gone.
    #[error("Generation {id} is corrupt: {} missing object(s), first {}", missing.len(), missing.first().map(String::as_str).unwrap_or("-"))]
    CorruptGeneration { id: u64, missing: Vec<String> },

    /// Another process holds the build lock.
    #[error(
        "A build is already in progress: {command} (PID {pid})\n\
         If you're sure no genstore build is running, remove the lock file:\n  {lock_path}"
    )]
    BuildInProgress {
        command: String,
        pid: u32,
        lock_path: PathBuf,
    },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Store configuration could not be parsed or is unsupported.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Resolved manifest is inconsistent.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Invalid tree entry.
    #[error("Invalid tree entry: {reason}")]
    InvalidTreeEntry { reason: String },

    /// Path already exists (for materialization).
    #[error("Path already exists: {path}")]
    PathExists { path: PathBuf },

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a StoreWriteFailed error.
    pub fn store_write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StoreWriteFailed {
            path: path.into(),
            source,
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(hash: impl Into<String>) -> Self {
        Error::ObjectNotFound { hash: hash.into() }
    }

    /// Create a BuildAborted error.
    pub fn build_aborted(reason: impl Into<String>) -> Self {
        Error::BuildAborted {
            reason: reason.into(),
        }
    }

    /// Create a RetentionViolation error.
    pub fn retention_violation(id: u64, reason: impl Into<String>) -> Self {
        Error::RetentionViolation {
            id,
            reason: reason.into(),
        }
    }

    /// Create a DeleteFailed error.
    pub fn delete_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::DeleteFailed {
            path: path.into(),
            source,
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an InvalidManifest error.
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Error::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Create an InvalidTreeEntry error.
    pub fn invalid_tree_entry(reason: impl Into<String>) -> Self {
        Error::InvalidTreeEntry {
            reason: reason.into(),
        }
    }

    /// Create a PathExists error.
    pub fn path_exists(path: impl Into<PathBuf>) -> Self {
        Error::PathExists { path: path.into() }
    }

    /// True when the operation may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreWriteFailed { .. } | Error::DeleteFailed { .. } | Error::BuildInProgress { .. }
        )
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::invalid_config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::invalid_config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_generation_message() {
        let err = Error::CorruptGeneration {
            id: 4,
            missing: vec!["ab".repeat(32)],
        };
        let msg = err.to_string();
        assert!(msg.contains("Generation 4 is corrupt"));
        assert!(msg.contains("1 missing"));
    }

    #[test]
    fn test_retryable_classification() {
        let io = std::io::Error::other("disk full");
        assert!(Error::store_write_failed("/x", io).is_retryable());
        assert!(!Error::object_not_found("abc").is_retryable());
        assert!(!Error::NoPriorGeneration.is_retryable());
    }
}
