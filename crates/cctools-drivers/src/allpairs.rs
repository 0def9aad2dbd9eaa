//! Matrix-tiling driver (`allpairs_master.c`): partitions an `X × Y` grid
//! of sequence-pair comparisons into `B×B` tiles, dispatches one task per
//! tile, and appends candidate pairs plus checkpoint status as tiles
//! complete.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use cctools_core::checkpoint::{CheckpointLog, TileStatus};
use cctools_queue::{CachePolicy, Queue, Task, TaskId, TaskResultKind};

use crate::skeleton::{partition_tiles, ProgressCounters, ProgressTable, Tile};

/// Fixed inputs for an all-pairs run.
pub struct AllpairsConfig {
    /// The comparison binary, staged once and reused across every tile.
    pub compare_binary: PathBuf,
    /// Set-list file enumerating the X-axis sequences.
    pub x_set_list: PathBuf,
    /// Set-list file enumerating the Y-axis sequences.
    pub y_set_list: PathBuf,
    /// Number of sequences along each axis.
    pub x_len: usize,
    pub y_len: usize,
    /// Edge length of one tile.
    pub tile_size: usize,
    /// Append-only checkpoint log of already-successful tiles.
    pub checkpoint_path: Option<PathBuf>,
    /// Where candidate pairs are appended as tiles complete.
    pub output_path: PathBuf,
}

fn command_for_tile(tile: &Tile) -> String {
    format!(
        "./compare_bin x_set_list y_set_list {} {} {} {}",
        tile.y_start, tile.y_end, tile.x_start, tile.x_end
    )
}

/// Read a set-list file: one sequence file path per line.
pub fn load_set_list(path: &std::path::Path) -> anyhow::Result<Vec<PathBuf>> {
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

fn task_for_tile(
    config: &AllpairsConfig,
    tile: &Tile,
    x_names: &[PathBuf],
    y_names: &[PathBuf],
) -> Task {
    let mut task = Task::new(command_for_tile(tile)).with_tag(format!(
        "{}:{}",
        tile.tile_y, tile.tile_x
    ));
    task.specify_input_file(&config.compare_binary, "compare_bin", CachePolicy::Cache);
    task.specify_input_file(&config.x_set_list, "x_set_list", CachePolicy::Cache);
    task.specify_input_file(&config.y_set_list, "y_set_list", CachePolicy::Cache);

    for path in &x_names[tile.x_start..tile.x_end.min(x_names.len())] {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            task.specify_input_file(path, name, CachePolicy::Cache);
        }
    }
    for path in &y_names[tile.y_start..tile.y_end.min(y_names.len())] {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            task.specify_input_file(path, name, CachePolicy::Cache);
        }
    }
    task
}

/// Number of newline-terminated lines in `stdout`, each one a candidate
/// pair the compare function emitted.
pub fn count_candidate_pairs(stdout: &[u8]) -> u64 {
    stdout.iter().filter(|&&b| b == b'\n').count() as u64
}

fn parse_tag(tag: &str) -> Option<(i64, i64)> {
    let (y, x) = tag.split_once(':')?;
    Some((y.parse().ok()?, x.parse().ok()?))
}

/// Run an all-pairs comparison to completion, skipping any tile already
/// marked successful in the checkpoint log and appending newly completed
/// tiles' candidate pairs to `output_path`.
pub async fn run(queue: &Queue, config: &AllpairsConfig) -> anyhow::Result<()> {
    let done: HashMap<(i64, i64), TileStatus> = match &config.checkpoint_path {
        Some(path) => CheckpointLog::replay(path)?,
        None => HashMap::new(),
    };
    let mut checkpoint = match &config.checkpoint_path {
        Some(path) => Some(CheckpointLog::open(path)?),
        None => None,
    };
    let mut output = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output_path)?;

    let x_names = load_set_list(&config.x_set_list)?;
    let y_names = load_set_list(&config.y_set_list)?;

    let mut pending: Vec<Tile> = partition_tiles(config.x_len, config.y_len, config.tile_size)
        .into_iter()
        .filter(|tile| !matches!(done.get(&(tile.tile_y, tile.tile_x)), Some(TileStatus::Success)))
        .collect();
    pending.reverse(); // pop_front-by-pop via .pop() from the back in submit order

    let mut in_flight: HashMap<TaskId, Tile> = HashMap::new();
    let mut counters = ProgressCounters::default();
    let mut progress = ProgressTable::new(Duration::from_secs(5));

    while !pending.is_empty() || !in_flight.is_empty() {
        while !pending.is_empty() && queue.hungry().await {
            let tile = pending.pop().expect("checked non-empty");
            let task = task_for_tile(config, &tile, &x_names, &y_names);
            let id = queue.submit(task).await?;
            in_flight.insert(id, tile);
            counters.submitted += 1;
        }

        if let Some(task) = queue.wait(Duration::from_secs(1)).await {
            if let Some(tile) = in_flight.remove(&task.id()) {
                let (tile_y, tile_x) = parse_tag(task.tag()).unwrap_or((tile.tile_y, tile.tile_x));
                match task.result() {
                    Some(TaskResultKind::Success) => {
                        let pairs = count_candidate_pairs(task.output());
                        output.write_all(task.output())?;
                        output.flush()?;
                        counters.candidates_or_cells += pairs;
                        if let Some(log) = checkpoint.as_mut() {
                            log.record(tile_y, tile_x, TileStatus::Success)?;
                        }
                    }
                    _ => {
                        if let Some(log) = checkpoint.as_mut() {
                            log.record(tile_y, tile_x, TileStatus::Failed)?;
                        }
                    }
                }
                counters.done += 1;
            }
        }

        let stats = queue.stats().await;
        counters.update_from_stats(&stats);
        if progress.due() {
            progress.print(&counters, &stats);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_candidate_pairs_counts_lines() {
        assert_eq!(count_candidate_pairs(b"a b\nc d\ne f\n"), 3);
        assert_eq!(count_candidate_pairs(b""), 0);
        assert_eq!(count_candidate_pairs(b"no newline"), 0);
    }

    #[test]
    fn parse_tag_round_trips() {
        assert_eq!(parse_tag("3:5"), Some((3, 5)));
        assert_eq!(parse_tag("garbage"), None);
    }

    #[test]
    fn task_for_tile_carries_the_set_lists_binary_and_per_tile_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let x_names: Vec<PathBuf> = (0..4)
            .map(|i| {
                let p = dir.path().join(format!("x{i}.seq"));
                std::fs::write(&p, b"seq").unwrap();
                p
            })
            .collect();
        let y_names: Vec<PathBuf> = (0..4)
            .map(|i| {
                let p = dir.path().join(format!("y{i}.seq"));
                std::fs::write(&p, b"seq").unwrap();
                p
            })
            .collect();

        let config = AllpairsConfig {
            compare_binary: PathBuf::from("/bin/cmp"),
            x_set_list: PathBuf::from("/data/x.list"),
            y_set_list: PathBuf::from("/data/y.list"),
            x_len: 4,
            y_len: 4,
            tile_size: 4,
            checkpoint_path: None,
            output_path: PathBuf::from("/tmp/out"),
        };
        let tile = Tile {
            tile_y: 0,
            tile_x: 0,
            y_start: 0,
            y_end: 4,
            x_start: 0,
            x_end: 4,
        };
        let task = task_for_tile(&config, &tile, &x_names, &y_names);
        // compare binary + x set list + y set list + 4 x-sequences + 4 y-sequences
        assert_eq!(task.files().len(), 11);
        assert_eq!(task.tag(), "0:0");
    }

    #[test]
    fn load_set_list_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.list");
        std::fs::write(&path, "a.seq\n\nb.seq\n").unwrap();
        let names = load_set_list(&path).unwrap();
        assert_eq!(names, vec![PathBuf::from("a.seq"), PathBuf::from("b.seq")]);
    }
}
