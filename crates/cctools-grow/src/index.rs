//! A manifest mapping logical paths exposed through the read-only view to
//! the content hash, size, and mode of the file backing them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One file's worth of manifest metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Lowercase hex SHA-256 of the file's contents.
    pub checksum: String,
    pub size: u64,
    pub mode: u32,
}

/// Logical path (relative, `/`-separated) to [`Entry`], the manifest a
/// read-only mount is served from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrowIndex {
    entries: BTreeMap<String, Entry>,
}

impl GrowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, logical_path: &str) -> Option<&Entry> {
        self.entries.get(logical_path)
    }

    pub fn insert(&mut self, logical_path: String, entry: Entry) {
        self.entries.insert(logical_path, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// Load a manifest previously written by [`Self::save`]; `Ok(None)` if it
    /// does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        cctools_core::paths::load_json(path)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        cctools_core::paths::save_json(path, self)
    }

    /// Walk `source_root` and build a fresh manifest by hashing every
    /// regular file found under it. Directories become implicit path
    /// prefixes; symlinks are skipped rather than followed.
    pub fn build_from_directory(source_root: &Path) -> anyhow::Result<Self> {
        let mut index = Self::new();
        let mut stack = vec![source_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let relative = path
                    .strip_prefix(source_root)
                    .expect("walked path is under source_root")
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                let bytes = std::fs::read(&path)?;
                let checksum = hex_sha256(&bytes);
                #[cfg(unix)]
                let mode = {
                    use std::os::unix::fs::PermissionsExt;
                    entry.metadata()?.permissions().mode()
                };
                #[cfg(not(unix))]
                let mode = 0o644;
                index.insert(
                    relative,
                    Entry {
                        checksum,
                        size: bytes.len() as u64,
                        mode,
                    },
                );
            }
        }
        Ok(index)
    }
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_from_directory_hashes_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let index = GrowIndex::build_from_directory(dir.path()).unwrap();
        assert_eq!(index.len(), 2);
        let a = index.get("a.txt").unwrap();
        assert_eq!(a.checksum, hex_sha256(b"hello"));
        assert_eq!(a.size, 5);
        let b = index.get("sub/b.txt").unwrap();
        assert_eq!(b.checksum, hex_sha256(b"world"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut index = GrowIndex::new();
        index.insert(
            "file".to_string(),
            Entry {
                checksum: hex_sha256(b"x"),
                size: 1,
                mode: 0o644,
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        index.save(&path).unwrap();
        let loaded = GrowIndex::load(&path).unwrap().unwrap();
        assert_eq!(loaded.get("file"), index.get("file"));
    }

    #[test]
    fn load_reports_missing_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(GrowIndex::load(&path).unwrap().is_none());
    }
}
