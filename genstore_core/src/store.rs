//! Content store: ingest, lookup and materialization of immutable objects.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::hash::{Hash, HashingWriter};
use crate::layout::Layout;
use crate::ledger::{self, Ledger, NewObject};
use crate::link::{self, LinkStrategy};
use crate::object::{Ingested, ObjectKind, ObjectMetadata};
use crate::tree::Tree;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Objects reachable from a set of roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachable {
    pub present: Vec<Hash>,
    pub missing: Vec<Hash>,
}

/// Totals over every recorded object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub objects: u64,
    pub files: u64,
    pub trees: u64,
    pub symlinks: u64,
    pub generations: u64,
    /// Bytes on disk, each object counted once.
    pub total_bytes: u64,
    /// Bytes the extra references would occupy without deduplication.
    pub dedup_savings_bytes: u64,
    /// Share of referenced bytes that deduplication avoided storing.
    pub dedup_ratio: f64,
}

/// Distinguishes partial files staged concurrently within one process.
static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Placed,
    Restored,
    Deduplicated,
}

/// A content-addressed store rooted at one directory.
#[derive(Debug)]
pub struct Store {
    layout: Layout,
    config: StoreConfig,
    ledger: Ledger,
    strategies: Vec<LinkStrategy>,
    ingest_count: AtomicU64,
}

impl Store {
    /// Initialize a new store at the given path.
    ///
    /// Creates `objects/`, `trash/`, `tmp/`, `locks/`, `boot/`, writes
    /// `config.toml` and creates the ledger.
    pub fn init<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        let layout = Layout::new(&root);

        if layout.config_path().exists() {
            return Err(Error::invalid_store(&root, "store already initialized"));
        }

        for dir in layout.required_dirs() {
            fs::create_dir_all(dir)?;
        }
        config.save(&layout.config_path())?;

        Self::assemble(layout, config)
    }

    /// Open an existing store, validating its layout and configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(Error::invalid_store(root, "directory does not exist"));
        }
        let root = fs::canonicalize(root)?;
        let layout = Layout::new(&root);

        if !layout.config_path().exists() {
            return Err(Error::invalid_store(&root, "config.toml not found"));
        }
        let config = StoreConfig::load(&layout.config_path())?;

        for dir in layout.required_dirs() {
            if !dir.is_dir() {
                return Err(Error::invalid_store(
                    &root,
                    format!("missing directory {}", dir.display()),
                ));
            }
        }
        if !layout.ledger_path().exists() {
            return Err(Error::invalid_store(&root, "ledger not found"));
        }

        Self::assemble(layout, config)
    }

    fn assemble(layout: Layout, config: StoreConfig) -> Result<Self> {
        let ledger = Ledger::open(layout.ledger_path(), config.ledger.busy_timeout())?;
        let strategies = link::probe(&layout.tmp_dir())?;
        Ok(Self {
            layout,
            config,
            ledger,
            strategies,
            ingest_count: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Placement strategies in the order they are tried.
    pub fn strategies(&self) -> &[LinkStrategy] {
        &self.strategies
    }

    /// Number of ingest operations performed through this handle.
    pub fn ingest_count(&self) -> u64 {
        self.ingest_count.load(Ordering::SeqCst)
    }

    /// Absolute path of an object in the addressable namespace.
    pub fn object_path(&self, hash: &Hash) -> PathBuf {
        self.layout.object_path(hash)
    }

    /// Ingest a byte stream as a file object, returning its content address.
    ///
    /// The reference this adds is not attached to any generation; use a
    /// [`crate::Draft`] to ingest content a build depends on.
    pub fn ingest<R: Read>(&self, reader: R) -> Result<Hash> {
        Ok(self.ingest_with(reader, ObjectKind::File, None)?.hash)
    }

    pub fn ingest_bytes(&self, data: &[u8]) -> Result<Hash> {
        self.ingest(data)
    }

    /// Stream `reader` into a temporary file while hashing, then place it.
    ///
    /// When `pin` names a draft, the new reference is recorded as that
    /// draft's provisional pin in the same transaction.
    pub(crate) fn ingest_with<R: Read>(
        &self,
        mut reader: R,
        kind: ObjectKind,
        pin: Option<&str>,
    ) -> Result<Ingested> {
        self.ingest_count.fetch_add(1, Ordering::SeqCst);

        let tmp = tempfile::Builder::new()
            .prefix("ingest-")
            .tempfile_in(self.layout.tmp_dir())?;
        let mut writer = HashingWriter::new(BufWriter::new(tmp));
        io::copy(&mut reader, &mut writer)?;
        let (buffered, hash, size) = writer.finalize();
        let tmp = buffered.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;

        self.commit_ingest(tmp.path(), hash, size, kind, pin)
    }

    fn commit_ingest(
        &self,
        src: &Path,
        hash: Hash,
        size: u64,
        kind: ObjectKind,
        pin: Option<&str>,
    ) -> Result<Ingested> {
        let dest = self.layout.object_path(&hash);
        // Copying happens before the write lock is taken; only the rename
        // into the addressable name runs inside the transaction.
        let mut partial = if self.exists(&hash)? {
            None
        } else {
            Some(self.stage_partial(src, &hash)?)
        };

        let mut published = false;
        let result = self.ledger.with_immediate_tx(|tx| {
            let recorded = ledger::object_exists(tx, &hash)?;
            let outcome = if recorded && dest.exists() {
                ledger::increment(tx, &hash, 1)?;
                Placement::Deduplicated
            } else {
                let staged = match partial.take() {
                    Some(staged) => staged,
                    None => self.stage_partial(src, &hash)?,
                };
                publish(&staged, &dest)?;
                published = true;
                if recorded {
                    ledger::increment(tx, &hash, 1)?;
                    Placement::Restored
                } else {
                    ledger::upsert_object(
                        tx,
                        &NewObject {
                            hash,
                            size,
                            kind,
                            path: Layout::object_rel_path(&hash),
                            created_at: unix_now(),
                        },
                        1,
                    )?;
                    Placement::Placed
                }
            };
            if let Some(token) = pin {
                ledger::add_pin(tx, token, &hash)?;
            }
            Ok(outcome)
        });

        if let Some(unused) = &partial {
            remove_partial(unused);
        }

        match result {
            Ok(outcome) => {
                match outcome {
                    Placement::Placed => {
                        debug!(hash = %hash, size, kind = kind.as_str(), "placed new object")
                    }
                    Placement::Restored => {
                        warn!(hash = %hash, "restored missing object file")
                    }
                    Placement::Deduplicated => debug!(hash = %hash, "dedup hit"),
                }
                Ok(Ingested {
                    hash,
                    size,
                    placed: outcome != Placement::Deduplicated,
                })
            }
            Err(err) => {
                if published {
                    self.discard_unrecorded(&hash);
                }
                Err(err)
            }
        }
    }

    /// Copy a temporary file to a private name inside its bucket.
    fn stage_partial(&self, src: &Path, hash: &Hash) -> Result<PathBuf> {
        let dest = self.layout.object_path(hash);
        let bucket = dest
            .parent()
            .ok_or_else(|| Error::invalid_store(self.root(), "object path has no bucket"))?;
        let partial = bucket.join(format!(
            ".{}.{}.{}.partial",
            hash.to_hex(),
            std::process::id(),
            PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let write = || -> io::Result<LinkStrategy> {
            fs::create_dir_all(bucket)?;
            let used = link::place(&self.strategies, src, &partial)?;
            make_read_only(&partial)?;
            Ok(used)
        };
        match write() {
            Ok(used) => {
                debug!(hash = %hash, strategy = used.as_str(), "object staged");
                Ok(partial)
            }
            Err(err) => {
                remove_partial(&partial);
                Err(Error::store_write_failed(&dest, err))
            }
        }
    }

    /// Remove a placed file whose ledger insert did not commit, unless a
    /// concurrent ingest has since recorded the same hash.
    fn discard_unrecorded(&self, hash: &Hash) {
        let path = self.layout.object_path(hash);
        let outcome = self.ledger.with_immediate_tx(|tx| {
            if !ledger::object_exists(tx, hash)? {
                fs::remove_file(&path)?;
            }
            Ok(())
        });
        if let Err(err) = outcome {
            warn!(hash = %hash, error = %err, "unrecorded object left for GC");
        }
    }

    /// True when the object is recorded and present on disk.
    pub fn exists(&self, hash: &Hash) -> Result<bool> {
        let conn = self.ledger.connection()?;
        Ok(ledger::object_exists(&conn, hash)? && self.object_path(hash).exists())
    }

    /// Ledger attributes of an object.
    pub fn query(&self, hash: &Hash) -> Result<ObjectMetadata> {
        self.ledger
            .get_object(hash)?
            .ok_or_else(|| Error::object_not_found(hash.to_hex()))
    }

    /// Open an object's content for reading.
    pub fn open_object(&self, hash: &Hash) -> Result<File> {
        if self.ledger.get_object(hash)?.is_none() {
            return Err(Error::object_not_found(hash.to_hex()));
        }
        File::open(self.object_path(hash)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::object_not_found(hash.to_hex()),
            _ => e.into(),
        })
    }

    pub fn read_object(&self, hash: &Hash) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_object(hash)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Copy an object's content to a writer.
    pub fn cat<W: Write>(&self, hash: &Hash, mut writer: W) -> Result<()> {
        let mut file = self.open_object(hash)?;
        io::copy(&mut file, &mut writer)?;
        Ok(())
    }

    /// Decode a tree object.
    pub fn read_tree(&self, hash: &Hash) -> Result<Tree> {
        let meta = self.query(hash)?;
        if meta.kind != ObjectKind::Tree {
            return Err(Error::invalid_tree_entry(format!(
                "{} is a {}, not a tree",
                hash, meta.kind
            )));
        }
        Tree::decode(&self.read_object(hash)?)
    }

    /// Follow tree entries from `roots` down to every object they reach.
    ///
    /// Present objects are returned roots first; an absent object is listed
    /// as missing and not descended into.
    pub fn reachable(&self, roots: &[Hash]) -> Result<Reachable> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<Hash> = roots.iter().copied().collect();
        let mut reachable = Reachable::default();

        while let Some(hash) = queue.pop_front() {
            if !seen.insert(hash) {
                continue;
            }
            let Some(meta) = self.ledger.get_object(&hash)? else {
                reachable.missing.push(hash);
                continue;
            };
            if !self.object_path(&hash).exists() {
                reachable.missing.push(hash);
                continue;
            }
            reachable.present.push(hash);
            if meta.kind == ObjectKind::Tree {
                let tree = Tree::decode(&self.read_object(&hash)?)?;
                queue.extend(tree.entries().iter().map(|entry| entry.hash));
            }
        }
        Ok(reachable)
    }

    /// Object counts and sizes as recorded in the ledger.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.ledger.connection()?;
        ledger::store_stats(&conn)
    }

    /// Expose an object at `dest` without copying its content.
    ///
    /// Files become symlinks into the store (a reflink or hardlink where a
    /// symlink cannot be created), symlink objects become symlinks to their
    /// stored target, and trees become directories materialized recursively.
    pub fn materialize(&self, hash: &Hash, dest: &Path) -> Result<()> {
        if dest.symlink_metadata().is_ok() {
            return Err(Error::path_exists(dest));
        }

        let meta = self.query(hash)?;
        let obj_path = self.object_path(hash);
        if !obj_path.exists() {
            return Err(Error::object_not_found(hash.to_hex()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        match meta.kind {
            ObjectKind::File => self.materialize_file(&obj_path, dest),
            ObjectKind::Symlink => {
                let target = self.read_object(hash)?;
                create_symlink(&symlink_target(target)?, dest)
            }
            ObjectKind::Tree => {
                let tree = self.read_tree(hash)?;
                fs::create_dir(dest)?;
                for entry in tree.entries() {
                    self.materialize(&entry.hash, &dest.join(&entry.name))?;
                }
                Ok(())
            }
        }
    }

    fn materialize_file(&self, obj_path: &Path, dest: &Path) -> Result<()> {
        match create_symlink(obj_path, dest) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(dest = %dest.display(), error = %err, "symlink failed, linking content");
                link::place(&[LinkStrategy::Reflink, LinkStrategy::Hardlink], obj_path, dest)
                    .map(|_| ())
                    .map_err(|e| Error::store_write_failed(dest, e))
            }
        }
    }
}

/// Rename a staged object over its final path, replacing any unrecorded
/// file a crash left there.
fn publish(partial: &Path, dest: &Path) -> Result<()> {
    if let Err(err) = fs::rename(partial, dest) {
        remove_partial(partial);
        return Err(Error::store_write_failed(dest, err));
    }
    if let Some(bucket) = dest.parent() {
        fsync_dir(bucket);
    }
    Ok(())
}

fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %err, "could not remove partial object");
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn make_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

pub(crate) fn fsync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(unix)]
fn symlink_target(bytes: Vec<u8>) -> Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn symlink_target(bytes: Vec<u8>) -> Result<PathBuf> {
    String::from_utf8(bytes)
        .map(PathBuf::from)
        .map_err(|e| Error::invalid_tree_entry(format!("Symlink target is not UTF-8: {}", e)))
}

#[cfg(unix)]
fn create_symlink(target: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, _dest: &Path) -> Result<()> {
    Err(Error::Io {
        source: io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"),
    })
}
