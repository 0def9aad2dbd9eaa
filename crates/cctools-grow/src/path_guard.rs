//! Reject any logical path that would resolve outside its declared root,
//! whether via `..` components or a symlink planted to the same effect.

use std::path::{Component, Path, PathBuf};

/// Errors a [`guard`] call can raise.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The path contains a `..` component.
    #[error("path escapes root via '..': {0}")]
    ParentComponent(String),
    /// The path is absolute (it must be relative to the root).
    #[error("path must be relative: {0}")]
    Absolute(String),
    /// Resolving symlinks placed the path outside the root.
    #[error("resolved path escapes root: {0}")]
    SymlinkEscape(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Normalize `requested` (relative to `root`) and confirm the canonical
/// path it resolves to is still under `root`. `requested` need not exist;
/// if it does, its symlinks are resolved and checked too.
pub fn guard(root: &Path, requested: &Path) -> Result<PathBuf, GuardError> {
    if requested.is_absolute() {
        return Err(GuardError::Absolute(requested.display().to_string()));
    }
    for component in requested.components() {
        if matches!(component, Component::ParentDir) {
            return Err(GuardError::ParentComponent(requested.display().to_string()));
        }
    }

    let joined = root.join(requested);
    let canonical_root = root.canonicalize()?;

    match joined.canonicalize() {
        Ok(canonical) if canonical.starts_with(&canonical_root) => Ok(joined),
        Ok(canonical) => Err(GuardError::SymlinkEscape(canonical.display().to_string())),
        Err(_) => Ok(joined), // does not exist yet; component check above already applies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_components() {
        let root = tempfile::tempdir().unwrap();
        let err = guard(root.path(), Path::new("../escape")).unwrap_err();
        assert!(matches!(err, GuardError::ParentComponent(_)));
    }

    #[test]
    fn rejects_absolute_paths() {
        let root = tempfile::tempdir().unwrap();
        let err = guard(root.path(), Path::new("/etc/passwd")).unwrap_err();
        assert!(matches!(err, GuardError::Absolute(_)));
    }

    #[test]
    fn allows_plain_relative_path() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"x").unwrap();
        let resolved = guard(root.path(), Path::new("a.txt")).unwrap();
        assert_eq!(resolved, root.path().join("a.txt"));
    }

    #[test]
    fn rejects_symlink_escaping_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link")).unwrap();

        #[cfg(unix)]
        {
            let err = guard(root.path(), Path::new("link")).unwrap_err();
            assert!(matches!(err, GuardError::SymlinkEscape(_)));
        }
    }
}
