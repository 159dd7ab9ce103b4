//! Placement strategies for moving ingested content into the object namespace.
//!
//! Capabilities are probed once when a store is opened and kept as a ranked
//! list; placement tries each strategy in order until one succeeds.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    /// Copy-on-write clone (FICLONE).
    Reflink,
    Hardlink,
    /// Plain byte copy; always available.
    Copy,
}

impl LinkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStrategy::Reflink => "reflink",
            LinkStrategy::Hardlink => "hardlink",
            LinkStrategy::Copy => "copy",
        }
    }

    /// Create `dst` with the content of `src`. `dst` must not exist.
    pub fn apply(self, src: &Path, dst: &Path) -> io::Result<()> {
        match self {
            LinkStrategy::Reflink => reflink(src, dst),
            LinkStrategy::Hardlink => fs::hard_link(src, dst),
            LinkStrategy::Copy => fs::copy(src, dst).map(|_| ()),
        }
    }
}

#[cfg(target_os = "linux")]
pub fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    let source = File::open(src)?;
    let dest = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;
    if let Err(err) = rustix::fs::ioctl_ficlone(&dest, &source) {
        drop(dest);
        if let Err(cleanup) = fs::remove_file(dst) {
            debug!(dst = %dst.display(), error = %cleanup, "could not remove failed clone");
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn reflink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "reflink is not supported on this platform",
    ))
}

/// Determine which strategies work between files inside `scratch_dir`.
///
/// `Copy` is always last.
pub fn probe(scratch_dir: &Path) -> io::Result<Vec<LinkStrategy>> {
    let probe_dir = tempfile::Builder::new()
        .prefix("probe-")
        .tempdir_in(scratch_dir)?;
    let src = probe_dir.path().join("src");
    fs::write(&src, b"genstore placement probe")?;

    let mut ranked = Vec::with_capacity(3);
    for (i, strategy) in [LinkStrategy::Reflink, LinkStrategy::Hardlink]
        .into_iter()
        .enumerate()
    {
        let dst = probe_dir.path().join(format!("dst{}", i));
        if strategy.apply(&src, &dst).is_ok() {
            ranked.push(strategy);
        }
    }
    ranked.push(LinkStrategy::Copy);

    debug!(
        strategies = ?ranked.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        "probed placement strategies"
    );
    Ok(ranked)
}

/// Place `src` at `dst` using the first strategy that succeeds.
pub fn place(strategies: &[LinkStrategy], src: &Path, dst: &Path) -> io::Result<LinkStrategy> {
    let mut last_err = None;
    for &strategy in strategies {
        match strategy.apply(src, dst) {
            Ok(()) => return Ok(strategy),
            Err(err) => {
                debug!(strategy = strategy.as_str(), error = %err, "placement strategy failed");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("no placement strategy available")))
}
