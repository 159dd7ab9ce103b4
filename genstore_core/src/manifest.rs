//! Resolved manifest accepted by [`crate::GenerationManager::build`], and the
//! generation manifest object a build stores alongside its content.

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::tree::FileMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Ordered packages plus declared files, as produced by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedManifest {
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    /// Finished build outputs; each becomes a named entry of the package tree.
    #[serde(default)]
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Absolute path the file is installed at.
    pub target: PathBuf,
    pub content: FileContent,
    #[serde(default = "default_mode")]
    pub mode: FileMode,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_owner")]
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileContent {
    Inline(String),
    Source(PathBuf),
}

fn default_mode() -> FileMode {
    0o644
}

fn default_owner() -> String {
    "root".to_string()
}

impl ResolvedManifest {
    /// Load a manifest from JSON, resolving relative source paths against
    /// the manifest's own directory.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let mut manifest: ResolvedManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::invalid_manifest(format!("{}: {}", path.display(), e)))?;

        let base = path.parent().unwrap_or(Path::new("."));
        for package in &mut manifest.packages {
            for source in &mut package.sources {
                if source.is_relative() {
                    *source = base.join(&*source);
                }
            }
        }
        for file in &mut manifest.files {
            if let FileContent::Source(source) = &mut file.content
                && source.is_relative()
            {
                *source = base.join(&*source);
            }
        }

        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let mut packages = HashSet::new();
        for package in &self.packages {
            if package.name.is_empty() {
                return Err(Error::invalid_manifest("package with empty name"));
            }
            if !packages.insert((&package.name, &package.version)) {
                return Err(Error::invalid_manifest(format!(
                    "duplicate package {}-{}",
                    package.name, package.version
                )));
            }
            let mut names = HashSet::new();
            for source in &package.sources {
                let name = source_name(source)?;
                if !names.insert(name.to_string()) {
                    return Err(Error::invalid_manifest(format!(
                        "package {} has two sources named {}",
                        package.name, name
                    )));
                }
            }
        }

        let mut targets = HashSet::new();
        for file in &self.files {
            if !file.target.is_absolute() {
                return Err(Error::invalid_manifest(format!(
                    "file target must be absolute: {}",
                    file.target.display()
                )));
            }
            if !targets.insert(&file.target) {
                return Err(Error::invalid_manifest(format!(
                    "file target declared twice: {}",
                    file.target.display()
                )));
            }
        }
        Ok(())
    }

    /// BLAKE3 of the canonical JSON encoding.
    pub fn fingerprint(&self) -> Result<Hash> {
        Ok(Hash::hash_bytes(&serde_json::to_vec(self)?))
    }
}

/// Entry name a source path takes inside its package tree.
pub(crate) fn source_name(source: &Path) -> Result<&str> {
    source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::invalid_manifest(format!("source has no usable name: {}", source.display()))
        })
}

/// The record a build stores as its own object, describing what was installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationManifest {
    pub fingerprint: Hash,
    pub packages: Vec<PackageRecord>,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub tree: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub target: PathBuf,
    pub hash: Hash,
    pub mode: FileMode,
    pub owner: String,
    pub group: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "packages": [
            {"name": "hello", "version": "2.12", "sources": ["build/hello"]}
        ],
        "files": [
            {"target": "/etc/motd", "content": {"inline": "welcome\n"}},
            {"target": "/etc/hosts", "content": {"source": "hosts"}, "mode": 420, "owner": "root", "group": "wheel"}
        ]
    }"#;

    #[test]
    fn test_load_resolves_relative_sources() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("manifest.json");
        fs::write(&path, SAMPLE).unwrap();

        let manifest = ResolvedManifest::load(&path).unwrap();
        assert_eq!(
            manifest.packages[0].sources[0],
            temp_dir.path().join("build/hello")
        );
        assert_eq!(
            manifest.files[1].content,
            FileContent::Source(temp_dir.path().join("hosts"))
        );
        assert_eq!(manifest.files[0].mode, 0o644);
        assert_eq!(manifest.files[0].owner, "root");
        assert_eq!(manifest.files[1].group, "wheel");
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a: ResolvedManifest = serde_json::from_str(SAMPLE).unwrap();
        let b: ResolvedManifest = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        let mut c = a.clone();
        c.packages[0].version = "2.13".to_string();
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn test_rejects_relative_target() {
        let manifest = ResolvedManifest {
            packages: Vec::new(),
            files: vec![FileSpec {
                target: PathBuf::from("etc/motd"),
                content: FileContent::Inline(String::new()),
                mode: 0o644,
                owner: "root".into(),
                group: "root".into(),
            }],
        };
        assert!(matches!(
            manifest.validate(),
            Err(Error::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_packages() {
        let package = PackageSpec {
            name: "a".into(),
            version: "1".into(),
            sources: Vec::new(),
        };
        let manifest = ResolvedManifest {
            packages: vec![package.clone(), package],
            files: Vec::new(),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_rejects_clashing_source_names() {
        let manifest = ResolvedManifest {
            packages: vec![PackageSpec {
                name: "a".into(),
                version: "1".into(),
                sources: vec![PathBuf::from("/x/bin"), PathBuf::from("/y/bin")],
            }],
            files: Vec::new(),
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("manifest.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            ResolvedManifest::load(&path),
            Err(Error::InvalidManifest { .. })
        ));
    }
}
