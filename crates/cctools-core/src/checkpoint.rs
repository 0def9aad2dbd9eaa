//! The checkpoint log: an append-only, line-atomic record of per-tile
//! completion status, as described for the matrix-tiling and SAND-filter
//! drivers. Each line is `<y> <x> <status>`, written with `O_APPEND` so
//! concurrent appends (or a crash mid-write) can never interleave partial
//! lines from two records; a partial final line is simply discarded on
//! replay.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::CoreError;

/// Status of a tile as recorded in the checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    /// Not yet attempted, or attempted but not yet recorded.
    Untried,
    /// Completed successfully; never resubmitted.
    Success,
    /// Completed with failure; may be resubmitted.
    Failed,
}

impl TileStatus {
    fn code(self) -> u8 {
        match self {
            TileStatus::Untried => 0,
            TileStatus::Success => 1,
            TileStatus::Failed => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TileStatus::Untried),
            1 => Some(TileStatus::Success),
            2 => Some(TileStatus::Failed),
            _ => None,
        }
    }
}

/// An append-only checkpoint log keyed by `(y, x)` tile coordinates.
pub struct CheckpointLog {
    file: File,
}

impl CheckpointLog {
    /// Open (creating if absent) a checkpoint log for appending.
    pub fn open(path: &Path) -> Result<Self, CoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?;
        Ok(Self { file })
    }

    /// Append one record. The write is a single `write(2)` call of a line
    /// well under `PIPE_BUF`, so it is atomic with respect to other writers
    /// or a crash.
    pub fn record(&mut self, y: i64, x: i64, status: TileStatus) -> Result<(), CoreError> {
        let line = format!("{y} {x} {}\n", status.code());
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// Replay a checkpoint log, returning the last recorded status for each
    /// `(y, x)` key. Malformed trailing lines (e.g. a crash mid-write) are
    /// silently dropped; the checkpoint log is the authority, not the crash.
    pub fn replay(path: &Path) -> Result<HashMap<(i64, i64), TileStatus>, CoreError> {
        let mut out = HashMap::new();
        if !path.exists() {
            return Ok(out);
        }
        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let mut parts = line.split_whitespace();
            let (Some(y), Some(x), Some(status)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let (Ok(y), Ok(x), Ok(code)) =
                (y.parse::<i64>(), x.parse::<i64>(), status.parse::<u8>())
            else {
                continue;
            };
            let Some(status) = TileStatus::from_code(code) else {
                continue;
            };
            out.insert((y, x), status);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_keeps_last_record_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        {
            let mut log = CheckpointLog::open(&path).unwrap();
            log.record(0, 0, TileStatus::Failed).unwrap();
            log.record(0, 0, TileStatus::Success).unwrap();
            log.record(1, 0, TileStatus::Success).unwrap();
        }
        let state = CheckpointLog::replay(&path).unwrap();
        assert_eq!(state.get(&(0, 0)), Some(&TileStatus::Success));
        assert_eq!(state.get(&(1, 0)), Some(&TileStatus::Success));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        {
            let mut log = CheckpointLog::open(&path).unwrap();
            for i in 0..5 {
                log.record(0, i, TileStatus::Success).unwrap();
            }
        }
        let first = CheckpointLog::replay(&path).unwrap();
        let second = CheckpointLog::replay(&path).unwrap();
        assert_eq!(first.len(), second.len());
        for (k, v) in &first {
            assert_eq!(second.get(k), Some(v));
        }
    }

    #[test]
    fn replay_drops_truncated_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.log");
        std::fs::write(&path, b"0 0 1\n0 1 ").unwrap();
        let state = CheckpointLog::replay(&path).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state.get(&(0, 0)), Some(&TileStatus::Success));
    }
}
