//! Per-worker file cache catalog: a mapping from `remote_name` to a stable
//! digest of the bytes the master last sent, used to avoid re-transferring
//! unchanged cached inputs.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// A stable content fingerprint, `sha256` of the source bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; 32]);

impl ContentId {
    /// Hash a byte buffer.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Hash the contents of a file on disk.
    pub fn of_path(path: &std::path::Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self::of_bytes(&bytes))
    }
}

/// A worker's resident-file catalog: `remote_name -> content_id`.
///
/// Invariant (§3): an entry listed here is only trustworthy while the
/// worker's session is alive; [`crate::worker_session::WorkerSession`] drops
/// its catalog entirely on transition to `dead`.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<String, ContentId>,
}

impl Catalog {
    /// Look up the content id currently believed resident under `remote_name`.
    pub fn get(&self, remote_name: &str) -> Option<ContentId> {
        self.entries.get(remote_name).copied()
    }

    /// Record that `remote_name` now holds `content_id`.
    pub fn insert(&mut self, remote_name: String, content_id: ContentId) {
        self.entries.insert(remote_name, content_id);
    }

    /// Forget `remote_name` (e.g. on a stale-file signal from the worker).
    pub fn invalidate(&mut self, remote_name: &str) {
        self.entries.remove(remote_name);
    }

    /// Drop every entry, e.g. when the worker dies.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_hash_equal() {
        let a = ContentId::of_bytes(b"hello");
        let b = ContentId::of_bytes(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn catalog_forgets_on_invalidate() {
        let mut cat = Catalog::default();
        cat.insert("input.txt".to_string(), ContentId::of_bytes(b"data"));
        assert!(cat.get("input.txt").is_some());
        cat.invalidate("input.txt");
        assert!(cat.get("input.txt").is_none());
    }

    #[test]
    fn clear_drops_everything() {
        let mut cat = Catalog::default();
        cat.insert("a".to_string(), ContentId::of_bytes(b"1"));
        cat.insert("b".to_string(), ContentId::of_bytes(b"2"));
        cat.clear();
        assert!(cat.is_empty());
    }
}
