//! # genstore core
//!
//! Content-addressed object store and generation manager for an immutable,
//! rollback-capable OS package manager.
//!
//! Every file, directory tree and symlink a build produces is stored once
//! under its BLAKE3 address. A SQLite ledger tracks each object's reference
//! count and the committed **generations**: immutable snapshots naming the
//! full set of objects a system configuration needs. Switching between
//! generations rewrites one pointer file; rollback never rebuilds anything.
//!
//! ## Features
//!
//! - Idempotent, concurrency-safe ingest with reflink/hardlink/copy placement
//! - Atomic generation commits: all roots and refcounts, or nothing
//! - Keep-last-N retention with pinning and an always-kept active generation
//! - Concurrent mark, stage and delete garbage collection with deferred retries
//! - Crash recovery for abandoned drafts and unrecorded files
//!
//! ## Example
//!
//! ```no_run
//! use genstore_core::{GcOptions, GenerationManager, ResolvedManifest, StoreConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = GenerationManager::init("./store", StoreConfig::default())?;
//!
//! // Ingest a resolved manifest and commit it as a generation
//! let manifest = ResolvedManifest::load(Path::new("./manifest.json"))?;
//! let id = manager.build(&manifest)?;
//! manager.switch(id)?;
//!
//! // Go back to the previous generation without rebuilding
//! manager.rollback(None)?;
//!
//! // Reclaim objects no retained generation references
//! let report = manager.gc(&GcOptions::default())?;
//! println!("Reclaimed {} bytes", report.bytes_reclaimed);
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod gc;
pub mod generation;
mod hash;
pub mod layout;
pub mod ledger;
mod link;
mod lock;
pub mod manifest;
mod object;
pub mod pointer;
mod store;
pub mod tree;
mod walk;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use gc::{DeferredDelete, GarbageCollector, GcOptions, GcPhase, GcReport};
pub use generation::{Draft, GenerationDetail, GenerationInfo, GenerationManager, StagedManifest};
pub use hash::{Algorithm, Hash, HashingWriter};
pub use layout::Layout;
pub use ledger::Ledger;
pub use link::LinkStrategy;
pub use lock::{BuildLock, LockMetadata};
pub use manifest::{
    FileContent, FileRecord, FileSpec, GenerationManifest, PackageRecord, PackageSpec,
    ResolvedManifest,
};
pub use object::{Ingested, ObjectKind, ObjectMetadata};
pub use pointer::{ActivePointer, BootEntries, BootEntry};
pub use store::{Reachable, Store, StoreStats};
pub use tree::{FileMode, Tree, TreeEntry};
pub use walk::PathIngest;
