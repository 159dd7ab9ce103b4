//! Canonical encoding of directory objects.
//!
//! A tree object's content is its entries sorted bytewise by name, each
//! encoded as:
//!
//! ```text
//! kind (1 byte: 1=file, 2=tree, 3=symlink)
//! mode (u32 LE)
//! hash (32 bytes)
//! name length (u8) + name (UTF-8)
//! ```
//!
//! Equal directories therefore always produce the same tree hash.

use crate::error::{Error, Result};
use crate::hash::{HASH_SIZE, Hash};
use crate::object::ObjectKind;
use std::io::{Cursor, Read};

/// POSIX file mode bits.
pub type FileMode = u32;

pub mod file_modes {
    use super::FileMode;

    pub const REGULAR: FileMode = 0o100644;
    pub const EXECUTABLE: FileMode = 0o100755;
    pub const DIRECTORY: FileMode = 0o040755;
    pub const SYMLINK: FileMode = 0o120777;
}

fn kind_to_u8(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::File => 1,
        ObjectKind::Tree => 2,
        ObjectKind::Symlink => 3,
    }
}

fn kind_from_u8(value: u8) -> Result<ObjectKind> {
    match value {
        1 => Ok(ObjectKind::File),
        2 => Ok(ObjectKind::Tree),
        3 => Ok(ObjectKind::Symlink),
        _ => Err(Error::invalid_tree_entry(format!(
            "Invalid entry kind: {}",
            value
        ))),
    }
}

/// One named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: ObjectKind,
    pub mode: FileMode,
    pub hash: Hash,
    pub name: String,
}

impl TreeEntry {
    pub fn new(kind: ObjectKind, mode: FileMode, hash: Hash, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            kind,
            mode,
            hash,
            name,
        })
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(kind_to_u8(self.kind));
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        buf.push(self.name.len() as u8);
        buf.extend_from_slice(self.name.as_bytes());
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut kind = [0u8; 1];
        reader.read_exact(&mut kind)?;
        let kind = kind_from_u8(kind[0])?;

        let mut mode = [0u8; 4];
        reader.read_exact(&mut mode)?;

        let mut hash = [0u8; HASH_SIZE];
        reader.read_exact(&mut hash)?;

        let mut len = [0u8; 1];
        reader.read_exact(&mut len)?;
        let mut name = vec![0u8; len[0] as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|e| Error::invalid_tree_entry(format!("Invalid UTF-8 in name: {}", e)))?;

        Self::new(kind, u32::from_le_bytes(mode), Hash::from_bytes(hash), name)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_tree_entry("Name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(Error::invalid_tree_entry(format!(
            "Name too long: {} bytes (max 255)",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_tree_entry(format!("Reserved name: {}", name)));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(Error::invalid_tree_entry(format!(
            "Name contains a path separator or null byte: {:?}",
            name
        )));
    }
    Ok(())
}

/// A decoded directory object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree, sorting entries into canonical order.
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        if let Some(dup) = entries.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(Error::invalid_tree_entry(format!(
                "Duplicate entry name: {}",
                dup[0].name
            )));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut buf);
        }
        buf
    }

    /// Decode and check that the input was in canonical order.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let mut entries = Vec::new();
        while reader.position() < data.len() as u64 {
            entries.push(TreeEntry::read_from(&mut reader)?);
        }
        let canonical = entries
            .windows(2)
            .all(|w| w[0].name.as_bytes() < w[1].name.as_bytes());
        if !canonical {
            return Err(Error::invalid_tree_entry(
                "Entries are not in canonical order",
            ));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: ObjectKind, name: &str, content: &[u8]) -> TreeEntry {
        TreeEntry::new(kind, file_modes::REGULAR, Hash::hash_bytes(content), name).unwrap()
    }

    #[test]
    fn test_tree_roundtrip_preserves_kinds() {
        let tree = Tree::new(vec![
            entry(ObjectKind::Symlink, "link", b"target"),
            entry(ObjectKind::File, "a.txt", b"a"),
            entry(ObjectKind::Tree, "sub", b""),
        ])
        .unwrap();

        let decoded = Tree::decode(&tree.encode()).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.get("link").unwrap().kind, ObjectKind::Symlink);
        assert_eq!(decoded.entries()[0].name, "a.txt");
    }

    #[test]
    fn test_insertion_order_does_not_change_encoding() {
        let a = Tree::new(vec![
            entry(ObjectKind::File, "z", b"1"),
            entry(ObjectKind::File, "a", b"2"),
        ])
        .unwrap();
        let b = Tree::new(vec![
            entry(ObjectKind::File, "a", b"2"),
            entry(ObjectKind::File, "z", b"1"),
        ])
        .unwrap();
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_rejects_bad_names() {
        let hash = Hash::hash_bytes(b"x");
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(TreeEntry::new(ObjectKind::File, file_modes::REGULAR, hash, bad).is_err());
        }
        let long = "n".repeat(256);
        assert!(TreeEntry::new(ObjectKind::File, file_modes::REGULAR, hash, long).is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = Tree::new(vec![
            entry(ObjectKind::File, "same", b"1"),
            entry(ObjectKind::File, "same", b"2"),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_rejects_unsorted_input() {
        let mut buf = Vec::new();
        entry(ObjectKind::File, "b", b"1").write_to(&mut buf);
        entry(ObjectKind::File, "a", b"2").write_to(&mut buf);
        assert!(Tree::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let tree = Tree::new(vec![entry(ObjectKind::File, "a", b"1")]).unwrap();
        let bytes = tree.encode();
        assert!(Tree::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_empty_tree() {
        let tree = Tree::new(Vec::new()).unwrap();
        assert!(tree.encode().is_empty());
        assert_eq!(Tree::decode(&[]).unwrap(), tree);
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Any permutation of the same entries encodes identically.
        #[test]
        fn prop_encoding_is_order_independent(
            names in prop::collection::btree_set("[a-zA-Z0-9._-]{1,20}", 0..12),
            seed in any::<u64>(),
        ) {
            let names: Vec<String> = names
                .into_iter()
                .filter(|n| n != "." && n != "..")
                .collect();
            let entries: Vec<TreeEntry> = names
                .iter()
                .map(|n| entry(ObjectKind::File, n, n.as_bytes()))
                .collect();

            let mut shuffled = entries.clone();
            let len = shuffled.len();
            if len > 1 {
                shuffled.rotate_left((seed as usize) % len);
                shuffled.reverse();
            }

            let a = Tree::new(entries).unwrap().encode();
            let b = Tree::new(shuffled).unwrap().encode();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(Tree::decode(&a).unwrap().entries().len(), names.len());
        }
    }
}
