//! Garbage collection.
//!
//! A pass runs three phases:
//!
//! 1. **Marking** reads the retained generations (keep-last window, pinned,
//!    active) and the live set (their roots plus draft pins) from one ledger
//!    snapshot.
//! 2. **Staging** deletes expired generation records, then moves each dead
//!    object into `trash/` and drops its ledger row in one write transaction
//!    that re-checks liveness first. Files nothing records and abandoned
//!    temporaries are moved to `trash/` too.
//! 3. **Deleting** drains `trash/` with a worker pool, one bucket per task.
//!    Entries that keep failing are left for the next pass.
//!
//! Ingestion may run throughout: anything committed or pinned after marking
//! is caught by the per-object re-check.

use crate::error::{Error, Result};
use crate::generation::release_stale_drafts;
use crate::hash::Hash;
use crate::ledger;
use crate::lock::BuildLock;
use crate::object::ObjectMetadata;
use crate::pointer::ActivePointer;
use crate::store::Store;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Where a collector currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GcPhase {
    Idle,
    Marking,
    Staging,
    Deleting,
}

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
    /// Report what would be collected without changing anything.
    pub dry_run: bool,
    /// Override the configured keep-last window.
    pub keep_last: Option<usize>,
}

/// A trash entry that could not be removed in this pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeferredDelete {
    pub path: PathBuf,
    pub error: String,
    pub attempts: u32,
}

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    /// Ids of the generation records removed (or, in a dry run, that would be).
    pub generations_collected: Vec<u64>,
    pub objects_collected: usize,
    pub bytes_reclaimed: u64,
    /// Object-namespace files without a ledger row.
    pub strays_collected: usize,
    pub temporaries_collected: usize,
    pub stale_drafts_released: usize,
    pub trash_entries_deleted: usize,
    pub deferred: Vec<DeferredDelete>,
}

/// Physical removal of one trash entry.
pub type Remover = dyn Fn(&Path) -> io::Result<()> + Send + Sync;

struct Mark {
    expired: Vec<u64>,
    candidates: Vec<ObjectMetadata>,
}

pub struct GarbageCollector<'a> {
    store: &'a Store,
    pointer: &'a ActivePointer,
    remover: Box<Remover>,
    phase: GcPhase,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a Store, pointer: &'a ActivePointer) -> Self {
        Self {
            store,
            pointer,
            remover: Box::new(remove_path),
            phase: GcPhase::Idle,
        }
    }

    /// Replace the function used to delete trash entries.
    pub fn with_remover<F>(mut self, remover: F) -> Self
    where
        F: Fn(&Path) -> io::Result<()> + Send + Sync + 'static,
    {
        self.remover = Box::new(remover);
        self
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    fn enter(&mut self, phase: GcPhase) {
        debug!(from = ?self.phase, to = ?phase, "gc phase");
        self.phase = phase;
    }

    pub fn run(&mut self, options: &GcOptions) -> Result<GcReport> {
        let keep_last = options
            .keep_last
            .unwrap_or(self.store.config().retention.keep_last);
        if keep_last == 0 {
            return Err(Error::invalid_config("keep_last must be at least 1"));
        }

        let mut report = GcReport {
            dry_run: options.dry_run,
            ..GcReport::default()
        };

        if !options.dry_run {
            report.stale_drafts_released = self.recover_drafts()?;
        }

        self.enter(GcPhase::Marking);
        let mark = match self.mark(keep_last) {
            Ok(mark) => mark,
            Err(err) => {
                self.enter(GcPhase::Idle);
                return Err(err);
            }
        };

        if options.dry_run {
            report.generations_collected = mark.expired;
            report.objects_collected = mark.candidates.len();
            report.bytes_reclaimed = mark.candidates.iter().map(|o| o.size).sum();
            self.enter(GcPhase::Idle);
            info!(
                generations = report.generations_collected.len(),
                objects = report.objects_collected,
                bytes = report.bytes_reclaimed,
                "gc dry run"
            );
            return Ok(report);
        }

        self.enter(GcPhase::Staging);
        let staged = self.stage(&mark, &mut report);

        // Drain whatever reached the trash, even if staging stopped early.
        self.enter(GcPhase::Deleting);
        let (deleted, deferred) = self.drain_trash()?;
        report.trash_entries_deleted = deleted;
        report.deferred = deferred;
        self.enter(GcPhase::Idle);
        staged?;

        info!(
            generations = report.generations_collected.len(),
            objects = report.objects_collected,
            bytes = report.bytes_reclaimed,
            strays = report.strays_collected,
            deleted = report.trash_entries_deleted,
            deferred = report.deferred.len(),
            "gc complete"
        );
        Ok(report)
    }

    /// Release drafts of dead builders, if no build is running right now.
    fn recover_drafts(&self) -> Result<usize> {
        let lock_path = self.store.layout().build_lock_path();
        match BuildLock::try_acquire(&lock_path, "gc")? {
            Some(_lock) => release_stale_drafts(self.store),
            None => {
                debug!("build in progress; draft recovery skipped");
                Ok(0)
            }
        }
    }

    fn mark(&self, keep_last: usize) -> Result<Mark> {
        self.store.ledger().with_snapshot(|tx| {
            let active = self.pointer.read()?;
            let generations = ledger::list_generations(tx)?;

            let mut retained = Vec::new();
            let mut expired = Vec::new();
            for (index, row) in generations.iter().enumerate() {
                if index < keep_last || row.pinned || Some(row.id) == active {
                    retained.push(row.id);
                } else {
                    expired.push(row.id);
                }
            }

            let mut live = ledger::read_all_roots(tx, &retained)?;
            live.extend(ledger::pinned_hashes(tx)?);

            let candidates: Vec<ObjectMetadata> = ledger::all_objects(tx)?
                .into_iter()
                .filter(|object| !live.contains(&object.hash))
                .collect();

            debug!(
                retained = retained.len(),
                expired = expired.len(),
                live = live.len(),
                candidates = candidates.len(),
                "marked"
            );
            Ok(Mark {
                expired,
                candidates,
            })
        })
    }

    fn stage(&self, mark: &Mark, report: &mut GcReport) -> Result<()> {
        for &id in &mark.expired {
            if self.collect_generation(id)? {
                report.generations_collected.push(id);
            }
        }

        self.store.ledger().recompute_refcounts()?;

        for object in &mark.candidates {
            match self.stage_object(object) {
                Ok(Some(size)) => {
                    report.objects_collected += 1;
                    report.bytes_reclaimed += size;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(hash = %object.hash, error = %err, "object left in place");
                }
            }
        }

        report.strays_collected = self.stage_strays()?;
        report.temporaries_collected = self.stage_temporaries()?;
        Ok(())
    }

    /// Drop an expired generation record unless it became active or pinned
    /// since marking.
    fn collect_generation(&self, id: u64) -> Result<bool> {
        self.store.ledger().with_immediate_tx(|tx| {
            let Some(record) = ledger::get_generation(tx, id)? else {
                return Ok(false);
            };
            if record.row.pinned || self.pointer.read()? == Some(id) {
                return Ok(false);
            }
            ledger::delete_generation(tx, id)?;
            debug!(generation = id, "generation collected");
            Ok(true)
        })
    }

    /// Move one dead object to trash and drop its row. Returns its size, or
    /// `None` when it turned out to be live.
    fn stage_object(&self, object: &ObjectMetadata) -> Result<Option<u64>> {
        let layout = self.store.layout();
        let src = layout.object_path(&object.hash);
        let dest = layout.trash_path(&object.hash, stamp());
        let mut moved = false;

        let result = self.store.ledger().with_immediate_tx(|tx| {
            if !ledger::object_exists(tx, &object.hash)?
                || ledger::is_rooted(tx, &object.hash)?
                || ledger::is_pinned(tx, &object.hash)?
            {
                return Ok(None);
            }
            move_to_trash(&src, &dest)?;
            moved = true;
            ledger::delete_object(tx, &object.hash)?;
            Ok(Some(object.size))
        });

        if result.is_err()
            && moved
            && let Err(err) = fs::rename(&dest, &src)
        {
            warn!(hash = %object.hash, error = %err, "could not restore object from trash");
        }
        result
    }

    /// Stage files under `objects/` that no ledger row accounts for.
    ///
    /// Partial files younger than the temporary grace period may belong to
    /// an ingest still copying, and are left alone.
    fn stage_strays(&self) -> Result<usize> {
        let layout = self.store.layout();
        let grace = self.store.config().gc.tmp_grace();
        let mut collected = 0;

        for path in object_files(&layout.objects_dir())? {
            if is_partial(&path) && age(&path) < grace {
                continue;
            }
            let hash = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Hash::from_hex(n).ok())
                .filter(|hash| layout.object_path(hash) == path);

            let dest = match &hash {
                Some(hash) => layout.trash_path(hash, stamp()),
                None => named_trash_path(&layout.trash_dir(), "stray", &path),
            };

            // Renames into final names happen inside an ingest's write
            // transaction, so once this one starts any unrecorded file is
            // abandoned.
            let staged = self.store.ledger().with_immediate_tx(|tx| {
                if let Some(hash) = &hash
                    && ledger::object_exists(tx, hash)?
                {
                    return Ok(false);
                }
                if fs::symlink_metadata(&path).is_err() {
                    return Ok(false);
                }
                move_to_trash(&path, &dest)?;
                Ok(true)
            });
            match staged {
                Ok(true) => {
                    debug!(path = %path.display(), "stray staged");
                    collected += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "stray left in place"),
            }
        }
        Ok(collected)
    }

    /// Stage entries of `tmp/` older than the configured grace period.
    fn stage_temporaries(&self) -> Result<usize> {
        let layout = self.store.layout();
        let grace = self.store.config().gc.tmp_grace();
        let mut collected = 0;

        for entry in fs::read_dir(layout.tmp_dir())? {
            let path = entry?.path();
            if age(&path) < grace {
                continue;
            }
            let dest = named_trash_path(&layout.trash_dir(), "tmp", &path);
            match move_to_trash(&path, &dest) {
                Ok(()) => collected += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "temporary left in place"),
            }
        }
        Ok(collected)
    }

    /// Delete everything under `trash/`, bucket by bucket in parallel.
    fn drain_trash(&self) -> Result<(usize, Vec<DeferredDelete>)> {
        let trash = self.store.layout().trash_dir();
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&trash)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                buckets.push(entry.path());
            }
        }
        if buckets.is_empty() {
            return Ok((0, Vec::new()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.store.config().gc.delete_workers)
            .build()
            .map_err(io::Error::other)?;

        let outcomes: Vec<(usize, Vec<DeferredDelete>)> =
            pool.install(|| buckets.par_iter().map(|b| self.drain_bucket(b)).collect());

        let mut deleted = 0;
        let mut deferred = Vec::new();
        for (count, failures) in outcomes {
            deleted += count;
            deferred.extend(failures);
        }
        Ok((deleted, deferred))
    }

    fn drain_bucket(&self, bucket: &Path) -> (usize, Vec<DeferredDelete>) {
        let entries = match fs::read_dir(bucket) {
            Ok(entries) => entries,
            Err(err) => {
                return (
                    0,
                    vec![DeferredDelete {
                        path: bucket.to_path_buf(),
                        error: err.to_string(),
                        attempts: 1,
                    }],
                );
            }
        };

        let mut deleted = 0;
        let mut deferred = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    deferred.push(DeferredDelete {
                        path: bucket.to_path_buf(),
                        error: err.to_string(),
                        attempts: 1,
                    });
                    continue;
                }
            };
            match self.delete_with_retry(&path) {
                Ok(()) => deleted += 1,
                Err(failure) => deferred.push(failure),
            }
        }

        if deferred.is_empty() {
            let _ = fs::remove_dir(bucket);
        }
        (deleted, deferred)
    }

    fn delete_with_retry(&self, path: &Path) -> std::result::Result<(), DeferredDelete> {
        let config = &self.store.config().gc;
        let attempts = config.delete_retries.max(1);
        let mut backoff = config.retry_backoff();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match (self.remover)(path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) if attempt >= attempts => {
                    let err = Error::delete_failed(path, err);
                    warn!(path = %path.display(), attempts = attempt, error = %err, "deletion deferred");
                    return Err(DeferredDelete {
                        path: path.to_path_buf(),
                        error: err.to_string(),
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    debug!(path = %path.display(), attempt, error = %err, "deletion failed; retrying");
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn move_to_trash(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(src, dest)
}

/// Time since a path was last modified; zero when unknown.
fn age(path: &Path) -> Duration {
    fs::symlink_metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or(Duration::ZERO)
}

/// A copy an ingest stages inside a bucket before renaming it into place.
fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".partial"))
}

fn stamp() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn named_trash_path(trash: &Path, bucket: &str, src: &Path) -> PathBuf {
    let name = src
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    trash.join(bucket).join(format!("{}.{}", name, stamp()))
}

/// Every file two bucket levels below `objects/`.
fn object_files(objects: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for level1 in fs::read_dir(objects)? {
        let level1 = level1?;
        if !level1.file_type()?.is_dir() {
            continue;
        }
        for level2 in fs::read_dir(level1.path())? {
            let level2 = level2?;
            if !level2.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(level2.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    files.push(entry.path());
                }
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::generation::GenerationManager;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir) -> GenerationManager {
        let mut config = StoreConfig::default();
        config.gc.retry_backoff_ms = 1;
        GenerationManager::init(temp_dir.path().join("store"), config).unwrap()
    }

    fn commit(manager: &GenerationManager, content: &[u8]) -> (u64, Hash) {
        let draft = manager.begin("test").unwrap();
        let hash = draft.ingest_bytes(content).unwrap();
        let id = draft
            .commit(&[hash], Hash::hash_bytes(content), None)
            .unwrap();
        (id, hash)
    }

    fn backdate(path: &Path) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();
    }

    fn trash_is_empty(manager: &GenerationManager) -> bool {
        fs::read_dir(manager.store().layout().trash_dir())
            .unwrap()
            .next()
            .is_none()
    }

    #[test]
    fn test_gc_empty_store() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.objects_collected, 0);
        assert_eq!(report.bytes_reclaimed, 0);
        assert!(report.deferred.is_empty());
    }

    #[test]
    fn test_gc_keeps_rooted_objects() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let (_, hash) = commit(&manager, b"test data");
        let report = manager.gc(&GcOptions::default()).unwrap();

        assert_eq!(report.objects_collected, 0);
        assert!(manager.store().exists(&hash).unwrap());
    }

    #[test]
    fn test_gc_unanchored_object() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let hash = manager.store().ingest_bytes(b"orphan data").unwrap();
        assert!(manager.store().object_path(&hash).exists());

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.objects_collected, 1);
        assert_eq!(report.bytes_reclaimed, 11);
        assert_eq!(report.trash_entries_deleted, 1);
        assert!(!manager.store().object_path(&hash).exists());
        assert!(manager.store().ledger().get_object(&hash).unwrap().is_none());
        assert!(trash_is_empty(&manager));
    }

    #[test]
    fn test_gc_dry_run() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let hash = manager.store().ingest_bytes(b"orphan").unwrap();

        let report = manager
            .gc(&GcOptions {
                dry_run: true,
                ..GcOptions::default()
            })
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.objects_collected, 1);
        assert!(report.bytes_reclaimed > 0);
        assert!(manager.store().exists(&hash).unwrap());

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.objects_collected, 1);
        assert!(!manager.store().object_path(&hash).exists());
    }

    #[test]
    fn test_gc_expires_generations_outside_window() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let (g1, a) = commit(&manager, b"a");
        let (g2, b) = commit(&manager, b"b");
        let (g3, c) = commit(&manager, b"c");
        manager.switch(g3).unwrap();

        let report = manager
            .gc(&GcOptions {
                dry_run: false,
                keep_last: Some(1),
            })
            .unwrap();

        assert_eq!(report.generations_collected, vec![g2, g1]);
        assert_eq!(report.objects_collected, 2);
        assert!(!manager.store().exists(&a).unwrap());
        assert!(!manager.store().exists(&b).unwrap());
        assert!(manager.store().exists(&c).unwrap());
        assert_eq!(
            manager.boot_entries().read().unwrap().len(),
            1,
            "boot entries follow collected generations"
        );
    }

    #[test]
    fn test_gc_retains_active_and_pinned() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let (g1, a) = commit(&manager, b"a");
        let (g2, b) = commit(&manager, b"b");
        let (_g3, _) = commit(&manager, b"c");
        manager.switch(g1).unwrap();
        manager.pin(g2).unwrap();

        let report = manager
            .gc(&GcOptions {
                dry_run: false,
                keep_last: Some(1),
            })
            .unwrap();
        assert!(report.generations_collected.is_empty());
        assert!(manager.store().exists(&a).unwrap());
        assert!(manager.store().exists(&b).unwrap());
    }

    #[test]
    fn test_gc_skips_pinned_draft_objects() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let draft = manager.begin("test").unwrap();
        let hash = draft.ingest_bytes(b"in flight").unwrap();

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.objects_collected, 0);
        assert_eq!(report.stale_drafts_released, 0);
        assert!(manager.store().exists(&hash).unwrap());

        let id = draft.commit(&[hash], Hash::hash_bytes(b"fp"), None).unwrap();
        manager.verify(id).unwrap();
    }

    #[test]
    fn test_gc_rejects_empty_window() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let result = manager.gc(&GcOptions {
            dry_run: false,
            keep_last: Some(0),
        });
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_gc_collects_strays() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let layout = manager.store().layout();

        let hash = Hash::hash_bytes(b"never recorded");
        let path = layout.object_path(&hash);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"never recorded").unwrap();
        let abandoned = path.with_file_name(format!(".{}.1.0.partial", hash.to_hex()));
        fs::write(&abandoned, b"half").unwrap();
        backdate(&abandoned);
        let copying = path.with_file_name(format!(".{}.2.0.partial", hash.to_hex()));
        fs::write(&copying, b"in progress").unwrap();

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.strays_collected, 2);
        assert_eq!(report.trash_entries_deleted, 2);
        assert!(!path.exists());
        assert!(!abandoned.exists());
        assert!(copying.exists());
    }

    #[test]
    fn test_gc_collects_old_temporaries_only() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let tmp = manager.store().layout().tmp_dir();

        let old = tmp.join("ingest-old");
        fs::write(&old, b"abandoned").unwrap();
        backdate(&old);
        let fresh = tmp.join("ingest-fresh");
        fs::write(&fresh, b"in progress").unwrap();

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.temporaries_collected, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn test_deletion_retries_transient_failures() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let hash = manager.store().ingest_bytes(b"flaky").unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let report = GarbageCollector::new(manager.store(), manager.pointer())
            .with_remover(move |path| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(io::Error::other("busy"))
                } else {
                    remove_path(path)
                }
            })
            .run(&GcOptions::default())
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.trash_entries_deleted, 1);
        assert!(report.deferred.is_empty());
        assert!(!manager.store().object_path(&hash).exists());
    }

    #[test]
    fn test_persistent_failures_are_deferred() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);
        let hash = manager.store().ingest_bytes(b"stuck").unwrap();

        let mut collector = GarbageCollector::new(manager.store(), manager.pointer())
            .with_remover(|_| Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        let report = collector.run(&GcOptions::default()).unwrap();

        assert_eq!(collector.phase(), GcPhase::Idle);
        assert_eq!(report.objects_collected, 1);
        assert_eq!(report.trash_entries_deleted, 0);
        assert_eq!(report.deferred.len(), 1);
        assert_eq!(report.deferred[0].attempts, 3);
        // Unaddressable already; the bytes wait in trash for the next pass.
        assert!(!manager.store().exists(&hash).unwrap());
        assert!(!trash_is_empty(&manager));

        let report = manager.gc(&GcOptions::default()).unwrap();
        assert_eq!(report.trash_entries_deleted, 1);
        assert!(trash_is_empty(&manager));
    }

    #[test]
    fn test_recollected_object_reingests_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir);

        let hash = manager.store().ingest_bytes(b"phoenix").unwrap();
        manager.gc(&GcOptions::default()).unwrap();
        assert!(!manager.store().exists(&hash).unwrap());

        let (_, again) = commit(&manager, b"phoenix");
        assert_eq!(again, hash);
        assert_eq!(manager.store().read_object(&hash).unwrap(), b"phoenix");
        assert_eq!(manager.query(&hash).unwrap().refcount, 1);
    }
}
