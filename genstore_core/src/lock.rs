//! Advisory exclusive build lock.
//!
//! Only one draft may build at a time. The lock is an `flock` on
//! `locks/build.lock`; the holder writes JSON metadata into the file so a
//! contending process can say who holds it.

use crate::error::{Error, Result};
use crate::store::unix_now;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub version: u32,
    pub pid: u32,
    pub started_at_unix: i64,
    pub command: String,
}

/// A held build lock, released on drop.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    lock_path: PathBuf,
}

impl BuildLock {
    /// Take the lock without waiting.
    ///
    /// Fails with [`Error::BuildInProgress`] when another holder exists.
    pub fn acquire(lock_path: &Path, command: &str) -> Result<Self> {
        match Self::try_acquire(lock_path, command)? {
            Some(lock) => Ok(lock),
            None => Err(contention_error(lock_path)),
        }
    }

    /// Take the lock if it is free; `None` when someone else holds it.
    pub fn try_acquire(lock_path: &Path, command: &str) -> Result<Option<Self>> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        if let Err(err) = try_lock_exclusive(&file) {
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        let lock = BuildLock {
            file,
            lock_path: lock_path.to_path_buf(),
        };
        lock.write_metadata(command)?;
        Ok(Some(lock))
    }

    fn write_metadata(&self, command: &str) -> Result<()> {
        let metadata = LockMetadata {
            version: 1,
            pid: std::process::id(),
            started_at_unix: unix_now(),
            command: command.to_string(),
        };
        self.file.set_len(0)?;
        let mut writer = io::BufWriter::new(&self.file);
        writer.seek(SeekFrom::Start(0))?;
        serde_json::to_writer_pretty(&mut writer, &metadata)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the metadata back through the held handle.
    pub fn read_metadata(&self) -> Result<LockMetadata> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

fn contention_error(lock_path: &Path) -> Error {
    let metadata = std::fs::read_to_string(lock_path)
        .ok()
        .and_then(|contents| serde_json::from_str::<LockMetadata>(&contents).ok());
    match metadata {
        Some(metadata) => Error::BuildInProgress {
            command: metadata.command,
            pid: metadata.pid,
            lock_path: lock_path.to_path_buf(),
        },
        None => Error::BuildInProgress {
            command: "unknown".to_string(),
            pid: 0,
            lock_path: lock_path.to_path_buf(),
        },
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use rustix::fs::{FlockOperation, flock};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

// Builds are not serialized across processes on this platform.
#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_metadata_written() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("locks/build.lock");

        let lock = BuildLock::acquire(&path, "build test").unwrap();
        let metadata = lock.read_metadata().unwrap();

        assert_eq!(metadata.version, 1);
        assert_eq!(metadata.command, "build test");
        assert_eq!(metadata.pid, std::process::id());
        assert_eq!(lock.lock_path(), path);
    }

    #[cfg(unix)]
    #[test]
    fn test_second_holder_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("build.lock");

        let _held = BuildLock::acquire(&path, "first").unwrap();
        assert!(BuildLock::try_acquire(&path, "second").unwrap().is_none());

        match BuildLock::acquire(&path, "second") {
            Err(Error::BuildInProgress { command, pid, .. }) => {
                assert_eq!(command, "first");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected BuildInProgress, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("build.lock");

        {
            let _lock = BuildLock::acquire(&path, "first").unwrap();
        }
        let lock = BuildLock::acquire(&path, "second").unwrap();
        assert_eq!(lock.read_metadata().unwrap().command, "second");
    }
}
