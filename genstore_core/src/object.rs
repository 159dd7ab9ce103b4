//! Stored object attributes.

use crate::error::{Error, Result};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a stored object's bytes represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Raw file content.
    File,
    /// Canonical directory listing (see [`crate::tree`]).
    Tree,
    /// The target of a symbolic link.
    Symlink,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Tree => "tree",
            ObjectKind::Symlink => "symlink",
        }
    }
}

impl TryFrom<&str> for ObjectKind {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "file" => Ok(ObjectKind::File),
            "tree" => Ok(ObjectKind::Tree),
            "symlink" => Ok(ObjectKind::Symlink),
            other => Err(Error::invalid_tree_entry(format!(
                "Unknown object kind: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the ledger knows about one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMetadata {
    pub hash: Hash,
    pub size: u64,
    pub kind: ObjectKind,
    /// Bucketed path relative to the store root.
    pub path: String,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
    pub refcount: i64,
}

/// Result of one ingest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingested {
    pub hash: Hash,
    pub size: u64,
    /// False when the content was already stored and only the refcount moved.
    pub placed: bool,
}
