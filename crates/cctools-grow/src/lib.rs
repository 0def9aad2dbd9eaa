#![deny(unsafe_code)]
#![deny(unreachable_pub)]

//! Read-only content-addressed file serving: a manifest of checksummed
//! paths backed by a local cache that fills itself lazily from an upstream
//! source, with a path guard so a served tree can never be escaped via
//! `..` components or symlinks planted inside it.

pub mod cache;
pub mod index;
pub mod path_guard;

pub use cache::{Cache, CacheError};
pub use index::{Entry, GrowIndex};
pub use path_guard::{guard, GuardError};

use std::path::{Path, PathBuf};

/// Ties an index, a cache, and an upstream source root together into a
/// single read-only view over `root`.
pub struct GrowMount {
    index: GrowIndex,
    cache: Cache,
    source_root: PathBuf,
}

impl GrowMount {
    pub fn new(index: GrowIndex, cache_basedir: PathBuf, source_root: PathBuf) -> Self {
        Self {
            index,
            cache: Cache::new(cache_basedir),
            source_root,
        }
    }

    pub fn index(&self) -> &GrowIndex {
        &self.index
    }

    /// Resolve `logical_path` to a local file the caller may read from,
    /// guarding against path escape and populating the cache on a miss.
    pub fn resolve(&self, logical_path: &str) -> anyhow::Result<PathBuf> {
        let entry = self
            .index
            .get(logical_path)
            .ok_or_else(|| anyhow::anyhow!("not found in manifest: {logical_path}"))?;

        guard(&self.source_root, Path::new(logical_path))?;

        self.cache
            .get_or_populate(logical_path, entry, &self.source_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_serves_file_through_cache() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("a.txt"), b"hi").unwrap();
        let index = GrowIndex::build_from_directory(source.path()).unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let mount = GrowMount::new(index, cache_dir.path().to_path_buf(), source.path().to_path_buf());

        let resolved = mount.resolve("a.txt").unwrap();
        assert_eq!(std::fs::read(resolved).unwrap(), b"hi");
    }

    #[test]
    fn resolve_rejects_paths_outside_the_manifest() {
        let source = tempfile::tempdir().unwrap();
        let index = GrowIndex::new();
        let cache_dir = tempfile::tempdir().unwrap();
        let mount = GrowMount::new(index, cache_dir.path().to_path_buf(), source.path().to_path_buf());

        assert!(mount.resolve("missing.txt").is_err());
    }

    #[test]
    fn resolve_rejects_escaping_logical_path() {
        let source = tempfile::tempdir().unwrap();
        let mut index = GrowIndex::new();
        index.insert(
            "../escape".to_string(),
            Entry {
                checksum: index::hex_sha256(b"x"),
                size: 1,
                mode: 0o644,
            },
        );
        let cache_dir = tempfile::tempdir().unwrap();
        let mount = GrowMount::new(index, cache_dir.path().to_path_buf(), source.path().to_path_buf());

        assert!(mount.resolve("../escape").is_err());
    }
}
