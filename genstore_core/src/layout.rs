//! On-disk namespaces under a store root.
//!
//! ```text
//! <root>/
//!   config.toml
//!   ledger.db              (+ -wal, -shm)
//!   active                 active generation id
//!   objects/<h0h1>/<h2h3>/<hex>
//!   trash/<h0h1>/<hex>.<nanos>
//!   tmp/
//!   locks/build.lock
//!   boot/entries.json
//! ```

use crate::hash::Hash;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.db")
    }

    pub fn active_path(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.root.join("trash")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn build_lock_path(&self) -> PathBuf {
        self.locks_dir().join("build.lock")
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.root.join("boot")
    }

    pub fn boot_entries_path(&self) -> PathBuf {
        self.boot_dir().join("entries.json")
    }

    /// Directories `init` creates and `open` requires.
    pub fn required_dirs(&self) -> [PathBuf; 5] {
        [
            self.objects_dir(),
            self.trash_dir(),
            self.tmp_dir(),
            self.locks_dir(),
            self.boot_dir(),
        ]
    }

    /// Path relative to the root, as recorded in the ledger.
    pub fn object_rel_path(hash: &Hash) -> String {
        format!(
            "objects/{}/{}/{}",
            hash.prefix(),
            hash.subprefix(),
            hash.to_hex()
        )
    }

    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        self.root.join(Self::object_rel_path(hash))
    }

    pub fn trash_bucket(&self, hash: &Hash) -> PathBuf {
        self.trash_dir().join(hash.prefix())
    }

    /// Unique trash destination; the suffix keeps repeated collections of
    /// the same hash from colliding with an undeleted earlier entry.
    pub fn trash_path(&self, hash: &Hash, nanos: u128) -> PathBuf {
        self.trash_bucket(hash)
            .join(format!("{}.{}", hash.to_hex(), nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_is_two_level_bucketed() {
        let layout = Layout::new("/store");
        let hash = Hash::hash_bytes(b"hello world");
        let hex = hash.to_hex();

        let path = layout.object_path(&hash);
        assert_eq!(
            path,
            PathBuf::from(format!("/store/objects/{}/{}/{}", &hex[..2], &hex[2..4], hex))
        );
    }

    #[test]
    fn test_trash_path_shares_first_level_bucket() {
        let layout = Layout::new("/store");
        let hash = Hash::hash_bytes(b"x");
        let trash = layout.trash_path(&hash, 42);
        assert!(trash.starts_with(layout.trash_dir().join(hash.prefix())));
        assert!(trash.to_string_lossy().ends_with(".42"));
    }
}
