//! Ingest of filesystem paths as file, symlink and tree objects.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::ObjectKind;
use crate::store::Store;
use crate::tree::{FileMode, Tree, TreeEntry, file_modes};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of ingesting a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIngest {
    /// Address of the top-level object.
    pub hash: Hash,
    pub kind: ObjectKind,
    /// Every object produced, children before their parents, without duplicates.
    pub closure: Vec<Hash>,
}

impl Store {
    /// Ingest a regular file, symlink or directory.
    ///
    /// Directories become tree objects; their children are ingested first, in
    /// parallel. Nothing is filtered out: hidden and ignored files are part of
    /// the stored tree.
    pub fn ingest_path(&self, path: &Path) -> Result<PathIngest> {
        self.ingest_path_with(path, None)
    }

    pub(crate) fn ingest_path_with(&self, path: &Path, pin: Option<&str>) -> Result<PathIngest> {
        let metadata = fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let ingested = self.ingest_with(&target_bytes(&target)[..], ObjectKind::Symlink, pin)?;
            Ok(PathIngest {
                hash: ingested.hash,
                kind: ObjectKind::Symlink,
                closure: vec![ingested.hash],
            })
        } else if file_type.is_file() {
            let ingested = self.ingest_with(fs::File::open(path)?, ObjectKind::File, pin)?;
            Ok(PathIngest {
                hash: ingested.hash,
                kind: ObjectKind::File,
                closure: vec![ingested.hash],
            })
        } else if file_type.is_dir() {
            self.ingest_directory(path, pin)
        } else {
            Err(Error::invalid_tree_entry(format!(
                "Unsupported file type: {}",
                path.display()
            )))
        }
    }

    fn ingest_directory(&self, path: &Path, pin: Option<&str>) -> Result<PathIngest> {
        let children = list_children(path)?;

        let ingested = children
            .par_iter()
            .map(|(name, child)| {
                let mode = entry_mode(child)?;
                let result = self.ingest_path_with(child, pin)?;
                Ok((name.clone(), mode, result))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut closure = Closure::default();
        let mut entries = Vec::with_capacity(ingested.len());
        for (name, mode, result) in ingested {
            closure.extend(&result.closure);
            entries.push(TreeEntry::new(result.kind, mode, result.hash, name)?);
        }

        let tree = Tree::new(entries)?;
        let tree_hash = self
            .ingest_with(&tree.encode()[..], ObjectKind::Tree, pin)?
            .hash;
        closure.push(tree_hash);

        Ok(PathIngest {
            hash: tree_hash,
            kind: ObjectKind::Tree,
            closure: closure.into_vec(),
        })
    }
}

/// Insertion-ordered set of hashes.
#[derive(Debug, Default)]
pub(crate) struct Closure {
    seen: HashSet<Hash>,
    order: Vec<Hash>,
}

impl Closure {
    pub(crate) fn push(&mut self, hash: Hash) {
        if self.seen.insert(hash) {
            self.order.push(hash);
        }
    }

    pub(crate) fn extend(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.push(*hash);
        }
    }

    pub(crate) fn into_vec(self) -> Vec<Hash> {
        self.order
    }
}

/// Immediate children of `dir`, sorted by name.
fn list_children(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let walker = ignore::WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut children = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let name = entry
            .file_name()
            .to_str()
            .ok_or_else(|| {
                Error::invalid_tree_entry(format!("Non UTF-8 file name: {}", entry.path().display()))
            })?
            .to_string();
        children.push((name, entry.into_path()));
    }
    Ok(children)
}

pub(crate) fn entry_mode(path: &Path) -> Result<FileMode> {
    let metadata = fs::symlink_metadata(path)?;
    let file_type = metadata.file_type();
    Ok(if file_type.is_symlink() {
        file_modes::SYMLINK
    } else if file_type.is_dir() {
        file_modes::DIRECTORY
    } else {
        file_mode(&metadata)
    })
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        file_modes::EXECUTABLE
    } else {
        file_modes::REGULAR
    }
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> FileMode {
    file_modes::REGULAR
}

#[cfg(unix)]
fn target_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn target_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::TempDir;

    fn new_store(temp_dir: &TempDir) -> Store {
        Store::init(temp_dir.path().join("store"), StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_ingest_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"alpha").unwrap();

        let result = store.ingest_path(&file).unwrap();
        assert_eq!(result.kind, ObjectKind::File);
        assert_eq!(result.hash, Hash::hash_bytes(b"alpha"));
        assert_eq!(result.closure, vec![result.hash]);
    }

    #[test]
    fn test_ingest_directory_closure() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("dup.txt"), b"alpha").unwrap();
        fs::write(source.join("sub/c.txt"), b"gamma").unwrap();
        fs::write(source.join(".hidden"), b"kept").unwrap();

        let result = store.ingest_path(&source).unwrap();
        assert_eq!(result.kind, ObjectKind::Tree);
        assert_eq!(*result.closure.last().unwrap(), result.hash);
        // alpha, kept, gamma, sub tree, root tree
        assert_eq!(result.closure.len(), 5);

        let tree = store.read_tree(&result.hash).unwrap();
        let names: Vec<&str> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".hidden", "a.txt", "dup.txt", "sub"]);
        assert_eq!(tree.get("sub").unwrap().kind, ObjectKind::Tree);
    }

    #[test]
    fn test_equal_directories_share_tree_hash() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        for dir in ["one", "two"] {
            let d = temp_dir.path().join(dir);
            fs::create_dir(&d).unwrap();
            fs::write(d.join("f"), b"same").unwrap();
        }

        let one = store.ingest_path(&temp_dir.path().join("one")).unwrap();
        let two = store.ingest_path(&temp_dir.path().join("two")).unwrap();
        assert_eq!(one.hash, two.hash);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_stored_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        let source = temp_dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("real"), b"data").unwrap();
        std::os::unix::fs::symlink("real", source.join("link")).unwrap();

        let result = store.ingest_path(&source).unwrap();
        let tree = store.read_tree(&result.hash).unwrap();
        let link = tree.get("link").unwrap();
        assert_eq!(link.kind, ObjectKind::Symlink);
        assert_eq!(link.mode, file_modes::SYMLINK);
        assert_eq!(store.read_object(&link.hash).unwrap(), b"real");
    }

    #[cfg(unix)]
    #[test]
    fn test_roundtrip_ingest_materialize() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);

        let source = temp_dir.path().join("source");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("a.txt"), b"alpha").unwrap();
        fs::write(source.join("sub/c.txt"), b"gamma").unwrap();
        fs::write(source.join("run.sh"), b"#!/bin/sh").unwrap();
        fs::set_permissions(source.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("a.txt", source.join("alias")).unwrap();

        let result = store.ingest_path(&source).unwrap();
        let tree = store.read_tree(&result.hash).unwrap();
        assert_eq!(tree.get("run.sh").unwrap().mode, file_modes::EXECUTABLE);

        let dest = temp_dir.path().join("dest");
        store.materialize(&result.hash, &dest).unwrap();

        assert!(dest.is_dir());
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dest.join("sub/c.txt")).unwrap(), b"gamma");
        assert_eq!(fs::read_link(dest.join("alias")).unwrap(), PathBuf::from("a.txt"));
        assert_eq!(fs::read(dest.join("alias")).unwrap(), b"alpha");
    }

    #[test]
    fn test_ingest_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let store = new_store(&temp_dir);
        assert!(store.ingest_path(&temp_dir.path().join("nope")).is_err());
    }
}
