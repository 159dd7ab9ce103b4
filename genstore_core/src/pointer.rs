//! Durable single-value state: the active generation and the boot entry list.
//!
//! Both files are replaced by writing a sibling temporary, syncing it and
//! renaming it over the old file, so a reader sees either the old or the
//! new content in full.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::store::fsync_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid_store(path, "path has no parent directory"))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    fsync_dir(dir);
    Ok(())
}

/// The id of the currently active generation, persisted as one file.
#[derive(Debug, Clone)]
pub struct ActivePointer {
    path: PathBuf,
}

impl ActivePointer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` before the first activation.
    pub fn read(&self) -> Result<Option<u64>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        contents.trim().parse::<u64>().map(Some).map_err(|e| {
            Error::invalid_store(&self.path, format!("unreadable active pointer: {}", e))
        })
    }

    pub fn write(&self, id: u64) -> Result<()> {
        write_atomic(&self.path, format!("{}\n", id).as_bytes())
    }
}

/// One line of the boot menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntry {
    pub generation: u64,
    pub created_at: i64,
    pub fingerprint: Hash,
    pub active: bool,
}

/// Generation list consumed by the external boot entry generator.
#[derive(Debug, Clone)]
pub struct BootEntries {
    path: PathBuf,
}

impl BootEntries {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the list. Entries are expected newest first.
    pub fn write(&self, entries: &[BootEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &json)
    }

    pub fn read(&self) -> Result<Vec<BootEntry>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_pointer_empty_until_written() {
        let temp_dir = TempDir::new().unwrap();
        let pointer = ActivePointer::new(temp_dir.path().join("active"));

        assert_eq!(pointer.read().unwrap(), None);
        pointer.write(7).unwrap();
        assert_eq!(pointer.read().unwrap(), Some(7));
        pointer.write(8).unwrap();
        assert_eq!(pointer.read().unwrap(), Some(8));
    }

    #[test]
    fn test_pointer_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("active");
        fs::write(&path, "not a number").unwrap();
        assert!(ActivePointer::new(path).read().is_err());
    }

    #[test]
    fn test_pointer_write_leaves_no_temporaries() {
        let temp_dir = TempDir::new().unwrap();
        let pointer = ActivePointer::new(temp_dir.path().join("active"));
        for id in 1..5 {
            pointer.write(id).unwrap();
        }
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_readers_never_see_torn_values() {
        let temp_dir = TempDir::new().unwrap();
        let pointer = Arc::new(ActivePointer::new(temp_dir.path().join("active")));
        pointer.write(1).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let pointer = Arc::clone(&pointer);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut reads = 0u32;
                    while !done.load(Ordering::SeqCst) || reads == 0 {
                        let id = pointer.read().unwrap().unwrap();
                        assert!(id == 1 || id == 1_000_000, "torn read: {}", id);
                        reads += 1;
                    }
                })
            })
            .collect();

        for i in 0..200 {
            pointer.write(if i % 2 == 0 { 1_000_000 } else { 1 }).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_boot_entries_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let boot = BootEntries::new(temp_dir.path().join("entries.json"));
        assert!(boot.read().unwrap().is_empty());

        let entries = vec![
            BootEntry {
                generation: 2,
                created_at: 20,
                fingerprint: Hash::hash_bytes(b"2"),
                active: true,
            },
            BootEntry {
                generation: 1,
                created_at: 10,
                fingerprint: Hash::hash_bytes(b"1"),
                active: false,
            },
        ];
        boot.write(&entries).unwrap();
        assert_eq!(boot.read().unwrap(), entries);
    }
}
