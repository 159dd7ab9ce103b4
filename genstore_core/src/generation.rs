//! Generation manager: drafts, commits, activation and rollback.
//!
//! ```text
//! Draft --commit--> Committed --switch--> Active
//!   |                   |                    |
//! abort/crash       (retained by window, pin or active)
//!   v                   v
//! pins released     Collected by GC
//! ```
//!
//! A draft holds the build lock and a ledger pin on everything it ingests.
//! Commit writes the generation row, its root set and the refcount changes
//! in one ledger transaction. The stored root set is closed under tree
//! entries, so liveness never has to look inside objects.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::gc::{GarbageCollector, GcOptions, GcReport};
use crate::hash::Hash;
use crate::ledger::{self, GenerationRow};
use crate::lock::BuildLock;
use crate::manifest::{
    FileContent, FileRecord, GenerationManifest, PackageRecord, PackageSpec, ResolvedManifest,
    source_name,
};
use crate::object::{ObjectKind, ObjectMetadata};
use crate::pointer::{ActivePointer, BootEntries, BootEntry};
use crate::store::{Store, unix_now};
use crate::tree::{Tree, TreeEntry};
use crate::walk::{Closure, PathIngest, entry_mode};
use rayon::prelude::*;
use serde::Serialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// Summary of a committed generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub id: u64,
    pub created_at: i64,
    pub fingerprint: Hash,
    pub manifest_hash: Option<Hash>,
    pub active: bool,
    pub pinned: bool,
}

/// A committed generation with its root set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationDetail {
    #[serde(flatten)]
    pub info: GenerationInfo,
    pub roots: Vec<Hash>,
}

impl GenerationInfo {
    fn from_row(row: GenerationRow, active: Option<u64>) -> Self {
        Self {
            active: active == Some(row.id),
            id: row.id,
            created_at: row.created_at,
            fingerprint: row.fingerprint,
            manifest_hash: row.manifest_hash,
            pinned: row.pinned,
        }
    }
}

/// Owns a store plus the active pointer and boot entry list beside it.
#[derive(Debug)]
pub struct GenerationManager {
    store: Store,
    pointer: ActivePointer,
    boot: BootEntries,
}

impl GenerationManager {
    pub fn new(store: Store) -> Self {
        let pointer = ActivePointer::new(store.layout().active_path());
        let boot = BootEntries::new(store.layout().boot_entries_path());
        Self {
            store,
            pointer,
            boot,
        }
    }

    pub fn init<P: AsRef<Path>>(root: P, config: StoreConfig) -> Result<Self> {
        Ok(Self::new(Store::init(root, config)?))
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Ok(Self::new(Store::open(root)?))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn pointer(&self) -> &ActivePointer {
        &self.pointer
    }

    pub fn boot_entries(&self) -> &BootEntries {
        &self.boot
    }

    /// Id of the active generation, if any has been activated.
    pub fn current(&self) -> Result<Option<u64>> {
        self.pointer.read()
    }

    /// Start a build. Takes the build lock and releases pins left behind by
    /// drafts whose process died.
    pub fn begin(&self, command: &str) -> Result<Draft<'_>> {
        let lock = BuildLock::acquire(&self.store.layout().build_lock_path(), command)?;
        let recovered = release_stale_drafts(&self.store)?;
        if recovered > 0 {
            warn!(recovered, "released pins of abandoned drafts");
        }

        let token = draft_token();
        self.store
            .ledger()
            .with_immediate_tx(|tx| ledger::insert_draft(tx, &token, std::process::id(), unix_now()))?;
        debug!(token = %token, "draft started");

        Ok(Draft {
            manager: self,
            token,
            _lock: Some(lock),
            finished: false,
        })
    }

    /// Ingest everything a manifest names and commit it as a new generation.
    ///
    /// The new generation is not activated; see [`Self::switch`].
    pub fn build(&self, manifest: &ResolvedManifest) -> Result<u64> {
        manifest.validate()?;
        let draft = self.begin("build")?;
        let staged = draft.stage_manifest(manifest)?;
        draft.commit(&staged.roots, staged.fingerprint, Some(staged.manifest_hash))
    }

    /// Activate a committed generation.
    ///
    /// Every root must be present; the pointer write happens inside a ledger
    /// write transaction so it cannot interleave with GC removing the
    /// generation.
    pub fn switch(&self, id: u64) -> Result<()> {
        self.verify(id)?;
        self.store.ledger().with_immediate_tx(|tx| {
            if ledger::get_generation(tx, id)?.is_none() {
                return Err(Error::GenerationNotFound { id });
            }
            self.pointer.write(id)
        })?;
        self.refresh_boot_entries()?;
        info!(generation = id, "switched active generation");
        Ok(())
    }

    /// Switch back to `target`, or by default to the newest generation older
    /// than the active one. Nothing is rebuilt or ingested.
    pub fn rollback(&self, target: Option<u64>) -> Result<u64> {
        let target = match target {
            Some(id) => id,
            None => {
                let active = self.current()?.ok_or(Error::NoPriorGeneration)?;
                self.store
                    .ledger()
                    .list_generations()?
                    .into_iter()
                    .map(|row| row.id)
                    .find(|&id| id < active)
                    .ok_or(Error::NoPriorGeneration)?
            }
        };
        self.switch(target)?;
        info!(generation = target, "rolled back");
        Ok(target)
    }

    /// All committed generations, newest first.
    pub fn list_generations(&self) -> Result<Vec<GenerationInfo>> {
        let active = self.current()?;
        Ok(self
            .store
            .ledger()
            .list_generations()?
            .into_iter()
            .map(|row| GenerationInfo::from_row(row, active))
            .collect())
    }

    pub fn generation(&self, id: u64) -> Result<GenerationDetail> {
        let record = self
            .store
            .ledger()
            .get_generation(id)?
            .ok_or(Error::GenerationNotFound { id })?;
        Ok(GenerationDetail {
            info: GenerationInfo::from_row(record.row, self.current()?),
            roots: record.roots,
        })
    }

    /// Confirm every root of a generation, and every object its trees
    /// reference, is addressable.
    pub fn verify(&self, id: u64) -> Result<()> {
        let detail = self.generation(id)?;
        let reachable = self.store.reachable(&detail.roots)?;
        if !reachable.missing.is_empty() {
            return Err(Error::CorruptGeneration {
                id,
                missing: reachable.missing.iter().map(Hash::to_hex).collect(),
            });
        }
        Ok(())
    }

    /// Keep a generation regardless of the retention window.
    pub fn pin(&self, id: u64) -> Result<()> {
        self.store
            .ledger()
            .with_immediate_tx(|tx| ledger::set_pinned(tx, id, true))
    }

    pub fn unpin(&self, id: u64) -> Result<()> {
        self.store
            .ledger()
            .with_immediate_tx(|tx| ledger::set_pinned(tx, id, false))
    }

    /// Remove a generation record now. Its objects are reclaimed by the next GC.
    pub fn delete_generation(&self, id: u64) -> Result<()> {
        let keep_last = self.store.config().retention.keep_last;
        self.store.ledger().with_immediate_tx(|tx| {
            let Some(record) = ledger::get_generation(tx, id)? else {
                return Err(Error::GenerationNotFound { id });
            };
            if self.pointer.read()? == Some(id) {
                return Err(Error::retention_violation(id, "generation is active"));
            }
            if record.row.pinned {
                return Err(Error::retention_violation(id, "generation is pinned"));
            }
            let in_window = ledger::list_generations(tx)?
                .iter()
                .take(keep_last)
                .any(|row| row.id == id);
            if in_window {
                return Err(Error::retention_violation(
                    id,
                    format!("generation is among the last {} kept", keep_last),
                ));
            }
            ledger::delete_generation(tx, id)?;
            Ok(())
        })?;
        self.refresh_boot_entries()?;
        info!(generation = id, "deleted generation");
        Ok(())
    }

    pub fn query(&self, hash: &Hash) -> Result<ObjectMetadata> {
        self.store.query(hash)
    }

    /// Run one garbage collection pass.
    pub fn gc(&self, options: &GcOptions) -> Result<GcReport> {
        let report = GarbageCollector::new(&self.store, &self.pointer).run(options)?;
        if !report.dry_run && !report.generations_collected.is_empty() {
            self.refresh_boot_entries()?;
        }
        Ok(report)
    }

    /// Rewrite `boot/entries.json` from the ledger, newest first.
    pub fn refresh_boot_entries(&self) -> Result<()> {
        let entries: Vec<BootEntry> = self
            .list_generations()?
            .into_iter()
            .map(|info| BootEntry {
                generation: info.id,
                created_at: info.created_at,
                fingerprint: info.fingerprint,
                active: info.active,
            })
            .collect();
        self.boot.write(&entries)
    }
}

/// Release every draft recorded in the ledger.
///
/// Callers must hold the build lock: with the lock held no live draft can
/// exist, so any row left is from a process that died.
pub(crate) fn release_stale_drafts(store: &Store) -> Result<usize> {
    store.ledger().with_immediate_tx(|tx| {
        let drafts = ledger::list_drafts(tx)?;
        for draft in &drafts {
            let pins = ledger::release_draft(tx, &draft.token)?;
            warn!(token = %draft.token, pid = draft.pid, pins, "released stale draft");
        }
        Ok(drafts.len())
    })
}

fn draft_token() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{}", std::process::id(), nanos)
}

/// Output of staging a manifest inside a draft.
#[derive(Debug, Clone)]
pub struct StagedManifest {
    pub roots: Vec<Hash>,
    pub fingerprint: Hash,
    pub manifest_hash: Hash,
}

/// An in-progress build. Everything ingested through it is pinned until
/// [`Draft::commit`] or [`Draft::abort`]; dropping it aborts.
#[derive(Debug)]
pub struct Draft<'a> {
    manager: &'a GenerationManager,
    token: String,
    _lock: Option<BuildLock>,
    finished: bool,
}

impl<'a> Draft<'a> {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ingest<R: Read>(&self, reader: R) -> Result<Hash> {
        Ok(self
            .manager
            .store
            .ingest_with(reader, ObjectKind::File, Some(&self.token))?
            .hash)
    }

    pub fn ingest_bytes(&self, data: &[u8]) -> Result<Hash> {
        self.ingest(data)
    }

    pub fn ingest_path(&self, path: &Path) -> Result<PathIngest> {
        self.manager
            .store
            .ingest_path_with(path, Some(&self.token))
    }

    /// Ingest one package's sources as a single tree object.
    pub fn ingest_package(&self, package: &PackageSpec) -> Result<(PackageRecord, Vec<Hash>)> {
        let mut closure = Closure::default();
        let mut entries = Vec::with_capacity(package.sources.len());
        for source in &package.sources {
            let mode = entry_mode(source)?;
            let ingested = self.ingest_path(source)?;
            closure.extend(&ingested.closure);
            entries.push(TreeEntry::new(
                ingested.kind,
                mode,
                ingested.hash,
                source_name(source)?,
            )?);
        }
        let tree = Tree::new(entries)?;
        let tree_hash = self
            .manager
            .store
            .ingest_with(&tree.encode()[..], ObjectKind::Tree, Some(&self.token))?
            .hash;
        closure.push(tree_hash);
        debug!(package = %package.name, version = %package.version, tree = %tree_hash, "package ingested");

        Ok((
            PackageRecord {
                name: package.name.clone(),
                version: package.version.clone(),
                tree: tree_hash,
            },
            closure.into_vec(),
        ))
    }

    /// Ingest every package and declared file of a manifest plus the
    /// generation manifest object, returning the root set to commit.
    pub fn stage_manifest(&self, manifest: &ResolvedManifest) -> Result<StagedManifest> {
        let fingerprint = manifest.fingerprint()?;

        let packages = manifest
            .packages
            .par_iter()
            .map(|package| self.ingest_package(package))
            .collect::<Result<Vec<_>>>()?;

        let mut closure = Closure::default();
        let mut package_records = Vec::with_capacity(packages.len());
        for (record, hashes) in packages {
            closure.extend(&hashes);
            package_records.push(record);
        }

        let mut file_records = Vec::with_capacity(manifest.files.len());
        for file in &manifest.files {
            let hash = match &file.content {
                FileContent::Inline(text) => self.ingest_bytes(text.as_bytes())?,
                FileContent::Source(path) => {
                    let ingested = self.ingest_path(path)?;
                    closure.extend(&ingested.closure);
                    ingested.hash
                }
            };
            closure.push(hash);
            file_records.push(FileRecord {
                target: file.target.clone(),
                hash,
                mode: file.mode,
                owner: file.owner.clone(),
                group: file.group.clone(),
            });
        }

        let record = GenerationManifest {
            fingerprint,
            packages: package_records,
            files: file_records,
        };
        let manifest_hash = self.ingest_bytes(&serde_json::to_vec_pretty(&record)?)?;
        closure.push(manifest_hash);

        Ok(StagedManifest {
            roots: closure.into_vec(),
            fingerprint,
            manifest_hash,
        })
    }

    /// Write the generation record and its root set, then release this
    /// draft's pins, all in one transaction.
    pub fn commit(
        mut self,
        roots: &[Hash],
        fingerprint: Hash,
        manifest_hash: Option<Hash>,
    ) -> Result<u64> {
        let result = self.commit_inner(roots, fingerprint, manifest_hash, false);
        if result.is_ok() {
            self.finished = true;
        }
        result
    }

    fn commit_inner(
        &self,
        roots: &[Hash],
        fingerprint: Hash,
        manifest_hash: Option<Hash>,
        crash_before_commit: bool,
    ) -> Result<u64> {
        // Root the whole closure so GC never separates a tree from its entries.
        let reachable = self.manager.store.reachable(roots)?;
        if let Some(hash) = reachable.missing.first() {
            return Err(Error::object_not_found(hash.to_hex()));
        }
        let roots = reachable.present;

        let id = self.manager.store.ledger().with_immediate_tx(|tx| {
            let registered = ledger::list_drafts(tx)?
                .iter()
                .any(|draft| draft.token == self.token);
            if !registered {
                return Err(Error::build_aborted("draft was released before commit"));
            }
            let id = ledger::insert_generation(
                tx,
                unix_now(),
                &fingerprint,
                manifest_hash.as_ref(),
                &roots,
            )?;
            ledger::release_draft(tx, &self.token)?;
            if crash_before_commit {
                return Err(Error::build_aborted("simulated crash before commit"));
            }
            Ok(id)
        })?;
        info!(generation = id, roots = roots.len(), "generation committed");
        Ok(id)
    }

    /// Abandon the build, releasing every pin.
    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.release()
    }

    fn release(&self) -> Result<()> {
        let pins = self
            .manager
            .store
            .ledger()
            .with_immediate_tx(|tx| ledger::release_draft(tx, &self.token))?;
        debug!(token = %self.token, pins, "draft released");
        Ok(())
    }

    /// Drop the build lock without touching the ledger, as a killed process
    /// would.
    #[cfg(test)]
    pub(crate) fn simulate_crash(mut self) {
        self.finished = true;
    }

    /// Fail the commit transaction at its last step, then die.
    #[cfg(test)]
    pub(crate) fn simulate_crash_during_commit(
        mut self,
        roots: &[Hash],
        fingerprint: Hash,
    ) -> Result<u64> {
        let result = self.commit_inner(roots, fingerprint, None, true);
        self.finished = true;
        result
    }
}

impl Drop for Draft<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.release() {
            warn!(token = %self.token, error = %err, "failed to release draft; GC will recover it");
        }
    }
}
