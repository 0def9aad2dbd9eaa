//! XDG Base Directory helpers, generalized from the submitter config pattern:
//! one `config_dir()` for durable settings, one `state_dir()` for runtime
//! state such as checkpoint logs and resume files.

use std::path::PathBuf;

use crate::error::CoreError;

fn xdg_home(var: &str, fallback_under_home: &str) -> Result<PathBuf, CoreError> {
    if let Some(dir) = std::env::var_os(var) {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            return Err(CoreError::BadEnv(format!("{var} is set but empty")));
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME")
        .ok_or_else(|| CoreError::BadEnv("HOME is not set".to_string()))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        return Err(CoreError::BadEnv("HOME is set but empty".to_string()));
    }
    Ok(home.join(fallback_under_home))
}

/// `$XDG_CONFIG_HOME` or `$HOME/.config`, joined with `cctools`.
pub fn config_dir() -> Result<PathBuf, CoreError> {
    Ok(xdg_home("XDG_CONFIG_HOME", ".config")?.join("cctools"))
}

/// `$XDG_STATE_HOME` or `$HOME/.local/state`, joined with `cctools`.
pub fn state_dir() -> Result<PathBuf, CoreError> {
    Ok(xdg_home("XDG_STATE_HOME", ".local/state")?.join("cctools"))
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file,
/// then rename over the destination.
pub fn write_atomic(path: &std::path::Path, contents: &[u8]) -> Result<(), CoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| CoreError::BadEnv(format!("invalid path: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load a JSON config value from `path`; `Ok(None)` if it does not exist yet.
pub fn load_json<T: serde::de::DeserializeOwned>(
    path: &std::path::Path,
) -> anyhow::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Serialize `value` as pretty JSON and write it to `path` atomically.
pub fn save_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn config_dir_respects_xdg_override() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-only, single-threaded process env mutation.
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", dir.path());
        }
        let got = config_dir().unwrap();
        assert_eq!(got, dir.path().join("cctools"));
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn write_atomic_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn json_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert!(load_json::<std::collections::BTreeMap<String, i32>>(&path)
            .unwrap()
            .is_none());

        let mut value = std::collections::BTreeMap::new();
        value.insert("cores".to_string(), 4);
        save_json(&path, &value).unwrap();

        let loaded: std::collections::BTreeMap<String, i32> =
            load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, value);
    }
}
