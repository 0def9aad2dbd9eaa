//! Dependency-grid driver (`wavefront_master.c`): cell `(x,y)` for
//! `x,y ≥ 1` becomes eligible once `(x-1,y)`, `(x,y-1)`, and `(x-1,y-1)`
//! all have results. Boundary row/column are seeded from an input file;
//! recovery replays any `x y payload` lines already present in the output
//! log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use cctools_queue::{CachePolicy, Queue, Task, TaskId};

use crate::skeleton::{ProgressCounters, ProgressTable};

pub struct WavefrontConfig {
    pub width: usize,
    pub height: usize,
    /// Compare/merge binary invoked as `./cmd left top diag`, reading the
    /// three dependency payloads as files and writing the new cell's
    /// payload to standard output.
    pub command_binary: PathBuf,
    /// `x y payload` lines seeding the boundary row/column (`x == 0 || y == 0`).
    pub boundary_path: PathBuf,
    /// Output log: every completed cell is appended as `x y payload`; also
    /// read back on startup for recovery.
    pub output_path: PathBuf,
}

/// Parse `x y payload...` lines into a `(x, y) -> payload` map. Used for
/// both the boundary seed file and output-log recovery.
pub fn load_grid_lines(path: &std::path::Path) -> anyhow::Result<HashMap<(usize, usize), String>> {
    let mut out = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Ok(out);
    };
    for line in contents.lines() {
        let mut parts = line.splitn(3, ' ');
        let (Some(x), Some(y), Some(payload)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(x), Ok(y)) = (x.parse::<usize>(), y.parse::<usize>()) else {
            continue;
        };
        out.insert((x, y), payload.to_string());
    }
    Ok(out)
}

fn eligible(grid: &HashMap<(usize, usize), String>, x: usize, y: usize) -> bool {
    x >= 1
        && y >= 1
        && grid.contains_key(&(x - 1, y))
        && grid.contains_key(&(x, y - 1))
        && grid.contains_key(&(x - 1, y - 1))
}

fn task_for_cell(config: &WavefrontConfig, grid: &HashMap<(usize, usize), String>, x: usize, y: usize) -> Task {
    let left = grid.get(&(x - 1, y)).cloned().unwrap_or_default();
    let top = grid.get(&(x, y - 1)).cloned().unwrap_or_default();
    let diag = grid.get(&(x - 1, y - 1)).cloned().unwrap_or_default();

    let mut task = Task::new("./wavefront_cmd left top diag").with_tag(format!("{x}:{y}"));
    task.specify_input_file(&config.command_binary, "wavefront_cmd", CachePolicy::Cache);
    task.specify_input_buffer(left.into_bytes(), "left".to_string(), CachePolicy::NoCache);
    task.specify_input_buffer(top.into_bytes(), "top".to_string(), CachePolicy::NoCache);
    task.specify_input_buffer(diag.into_bytes(), "diag".to_string(), CachePolicy::NoCache);
    task
}

fn parse_tag(tag: &str) -> Option<(usize, usize)> {
    let (x, y) = tag.split_once(':')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

/// Drive the dependency grid to completion, writing each finished cell's
/// payload to `output_path` as it lands.
pub async fn run(queue: &Queue, config: &WavefrontConfig) -> anyhow::Result<()> {
    let mut grid = load_grid_lines(&config.boundary_path)?;
    for (key, value) in load_grid_lines(&config.output_path)? {
        grid.insert(key, value);
    }

    let mut submitted: HashSet<(usize, usize)> = grid.keys().copied().collect();
    let mut ready: VecDeque<(usize, usize)> = VecDeque::new();
    for y in 0..config.height {
        for x in 0..config.width {
            if !submitted.contains(&(x, y)) && eligible(&grid, x, y) {
                ready.push_back((x, y));
            }
        }
    }

    let mut output = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output_path)?;

    let mut in_flight: HashMap<TaskId, (usize, usize)> = HashMap::new();
    let mut counters = ProgressCounters::default();
    counters.candidates_or_cells = grid.len() as u64;
    let mut progress = ProgressTable::new(Duration::from_secs(5));

    let total_cells = config.width * config.height;

    while (grid.len() as u64) < total_cells as u64 {
        while let Some((x, y)) = ready.pop_front() {
            if submitted.contains(&(x, y)) {
                continue;
            }
            let task = task_for_cell(config, &grid, x, y);
            let id = queue.submit(task).await?;
            submitted.insert((x, y));
            in_flight.insert(id, (x, y));
            counters.submitted += 1;
            if !queue.hungry().await {
                break;
            }
        }

        let Some(task) = queue.wait(Duration::from_secs(1)).await else {
            let stats = queue.stats().await;
            counters.update_from_stats(&stats);
            if progress.due() {
                progress.print(&counters, &stats);
            }
            continue;
        };
        let Some((x, y)) = in_flight.remove(&task.id()).or_else(|| parse_tag(task.tag())) else {
            continue;
        };

        if matches!(task.result(), Some(cctools_queue::TaskResultKind::Success)) {
            let payload = String::from_utf8_lossy(task.output()).into_owned();
            writeln!(output, "{x} {y} {payload}")?;
            output.flush()?;
            grid.insert((x, y), payload);
            counters.candidates_or_cells += 1;

            for (nx, ny) in [(x + 1, y), (x, y + 1)] {
                if nx < config.width
                    && ny < config.height
                    && !submitted.contains(&(nx, ny))
                    && eligible(&grid, nx, ny)
                {
                    ready.push_back((nx, ny));
                }
            }
        } else {
            submitted.remove(&(x, y));
            ready.push_back((x, y));
        }
        counters.done += 1;

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
    fn eligible_requires_all_three_dependencies() {
        let mut grid = HashMap::new();
        assert!(!eligible(&grid, 1, 1));
        grid.insert((0, 1), "a".to_string());
        grid.insert((1, 0), "b".to_string());
        assert!(!eligible(&grid, 1, 1));
        grid.insert((0, 0), "c".to_string());
        assert!(eligible(&grid, 1, 1));
    }

    #[test]
    fn eligible_rejects_boundary_cells() {
        let grid = HashMap::new();
        assert!(!eligible(&grid, 0, 5));
        assert!(!eligible(&grid, 5, 0));
    }

    #[test]
    fn load_grid_lines_parses_and_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.log");
        std::fs::write(&path, "0 0 seed\n1 0 val-a\ngarbage\n").unwrap();
        let grid = load_grid_lines(&path).unwrap();
        assert_eq!(grid.get(&(0, 0)), Some(&"seed".to_string()));
        assert_eq!(grid.get(&(1, 0)), Some(&"val-a".to_string()));
        assert_eq!(grid.len(), 2);
    }

    #[test]
    fn load_grid_lines_tolerates_missing_file() {
        let grid = load_grid_lines(std::path::Path::new("/nonexistent/path")).unwrap();
        assert!(grid.is_empty());
    }

    #[test]
    fn parse_tag_round_trips() {
        assert_eq!(parse_tag("2:3"), Some((2, 3)));
        assert_eq!(parse_tag("x"), None);
    }
}
