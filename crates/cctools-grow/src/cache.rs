//! Content-addressed local cache for files served through a read-only
//! mount. Cache paths follow the same two-level hex fan-out the original
//! FUSE driver used, splitting on the checksum's first two characters so
//! no directory ever holds more than a few hundred entries.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::index::Entry;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("checksum too short to address a cache path: {0:?}")]
    ChecksumTooShort(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A basedir-rooted cache, populated lazily from an upstream source root.
pub struct Cache {
    basedir: PathBuf,
}

impl Cache {
    pub fn new(basedir: PathBuf) -> Self {
        Self { basedir }
    }

    /// `checksum[0]/checksum[1]/rest-of-checksum`, matching the FUSE
    /// driver's `cache_open()` layout.
    pub fn path_for(&self, checksum: &str) -> Result<PathBuf, CacheError> {
        if checksum.len() < 3 {
            return Err(CacheError::ChecksumTooShort(checksum.to_string()));
        }
        let mut chars = checksum.chars();
        let first = chars.next().unwrap();
        let second = chars.next().unwrap();
        let rest: String = chars.collect();
        Ok(self
            .basedir
            .join(first.to_string())
            .join(second.to_string())
            .join(rest))
    }

    /// Return the cached copy of `entry`, populating it from
    /// `source_root.join(logical_path)` on a miss. Mirrors the FUSE
    /// driver's ENOENT-falls-back-to-direct-open behavior, except here the
    /// fallback also seeds the cache rather than just reading through.
    pub fn get_or_populate(
        &self,
        logical_path: &str,
        entry: &Entry,
        source_root: &Path,
    ) -> anyhow::Result<PathBuf> {
        let cached = self.path_for(&entry.checksum)?;
        if cached.is_file() {
            return Ok(cached);
        }

        let source = source_root.join(logical_path);
        let bytes = std::fs::read(&source)?;
        let actual = crate::index::hex_sha256(&bytes);
        if actual != entry.checksum {
            anyhow::bail!(
                "checksum mismatch for {logical_path}: manifest says {}, source has {actual}",
                entry.checksum
            );
        }

        if let Some(parent) = cached.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = cached.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &cached)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cached, std::fs::Permissions::from_mode(entry.mode))?;
        }
        Ok(cached)
    }

    /// Drop whatever bytes are cached for `checksum`, if any. Used to evict
    /// after the manifest changes underneath a mount.
    pub fn evict(&self, checksum: &str) -> Result<(), CacheError> {
        let path = self.path_for(checksum)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::hex_sha256;

    #[test]
    fn path_for_splits_first_two_chars() {
        let cache = Cache::new(PathBuf::from("/base"));
        let path = cache.path_for("abcdef0123").unwrap();
        assert_eq!(path, PathBuf::from("/base/a/b/cdef0123"));
    }

    #[test]
    fn path_for_rejects_short_checksums() {
        let cache = Cache::new(PathBuf::from("/base"));
        assert!(cache.path_for("ab").is_err());
    }

    #[test]
    fn get_or_populate_fills_cache_on_miss_then_reuses_it() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("file.txt"), b"payload").unwrap();
        let entry = Entry {
            checksum: hex_sha256(b"payload"),
            size: 7,
            mode: 0o644,
        };

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(cache_dir.path().to_path_buf());

        let resolved = cache
            .get_or_populate("file.txt", &entry, source.path())
            .unwrap();
        assert_eq!(std::fs::read(&resolved).unwrap(), b"payload");

        // Remove the source; the cached copy must still serve the file.
        std::fs::remove_file(source.path().join("file.txt")).unwrap();
        let resolved_again = cache
            .get_or_populate("file.txt", &entry, source.path())
            .unwrap();
        assert_eq!(std::fs::read(&resolved_again).unwrap(), b"payload");
    }

    #[test]
    fn get_or_populate_rejects_checksum_mismatch() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("file.txt"), b"tampered").unwrap();
        let entry = Entry {
            checksum: hex_sha256(b"original"),
            size: 8,
            mode: 0o644,
        };
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(cache_dir.path().to_path_buf());
        assert!(cache
            .get_or_populate("file.txt", &entry, source.path())
            .is_err());
    }

    #[test]
    fn evict_removes_cached_copy_idempotently() {
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(cache_dir.path().to_path_buf());
        let checksum = hex_sha256(b"x");
        let path = cache.path_for(&checksum).unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();

        cache.evict(&checksum).unwrap();
        assert!(!path.exists());
        cache.evict(&checksum).unwrap(); // second time is a no-op, not an error
    }
}
