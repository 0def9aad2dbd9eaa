//! The parts all three application drivers share: a periodic progress
//! line, matrix tile partitioning, and the "run for ~5s, divide by loop
//! count" compare-function timing estimate used to size a tile.

use std::time::{Duration, Instant};

use cctools_queue::QueueStats;

/// One `B×B` rectangle of a tiled matrix, identified by its tile row/column
/// (not pixel) coordinates so it can key a checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub tile_y: i64,
    pub tile_x: i64,
    pub y_start: usize,
    pub y_end: usize,
    pub x_start: usize,
    pub x_end: usize,
}

/// Partition an `x_len × y_len` grid into row-major `tile_size × tile_size`
/// rectangles. The final row/column of tiles is shorter when the
/// dimensions don't divide evenly.
pub fn partition_tiles(x_len: usize, y_len: usize, tile_size: usize) -> Vec<Tile> {
    assert!(tile_size > 0, "tile_size must be positive");
    let mut tiles = Vec::new();
    let mut tile_y = 0i64;
    let mut y_start = 0;
    while y_start < y_len {
        let y_end = (y_start + tile_size).min(y_len);
        let mut tile_x = 0i64;
        let mut x_start = 0;
        while x_start < x_len {
            let x_end = (x_start + tile_size).min(x_len);
            tiles.push(Tile {
                tile_y,
                tile_x,
                y_start,
                y_end,
                x_start,
                x_end,
            });
            x_start = x_end;
            tile_x += 1;
        }
        y_start = y_end;
        tile_y += 1;
    }
    tiles
}

/// Default per-comparison time assumed for a built-in compare function
/// (`allpairs_master.c`'s hard-coded default).
pub const DEFAULT_COMPARISON_SECONDS: f64 = 0.1;

/// Floor applied to a measured per-comparison time for an external compare
/// program, so a degenerate fast loop never drives the tile size to zero.
pub const MIN_COMPARISON_SECONDS: f64 = 0.01;

/// Time an external compare command by running it in a tight loop for at
/// least `min_wall_time`, then dividing by the number of iterations
/// completed. Falls back to [`MIN_COMPARISON_SECONDS`] if even one
/// iteration didn't finish inside the budget.
pub fn estimate_run_time(
    mut run_once: impl FnMut() -> anyhow::Result<()>,
    min_wall_time: Duration,
) -> f64 {
    let start = Instant::now();
    let mut iterations = 0u64;
    while start.elapsed() < min_wall_time {
        if run_once().is_err() {
            break;
        }
        iterations += 1;
    }
    if iterations == 0 {
        return MIN_COMPARISON_SECONDS;
    }
    (start.elapsed().as_secs_f64() / iterations as f64).max(MIN_COMPARISON_SECONDS)
}

/// Choose a tile edge length so one tile takes approximately `target_seconds`
/// of compute at `per_comparison_seconds` per cell.
pub fn tile_size_for_target(per_comparison_seconds: f64, target_seconds: f64) -> usize {
    if per_comparison_seconds <= 0.0 {
        return 1;
    }
    let comparisons_per_tile = target_seconds / per_comparison_seconds;
    (comparisons_per_tile.sqrt().floor() as usize).max(1)
}

/// Target wall-clock time per tile (`allpairs_master.c`'s ≈60s rectangle).
pub const TARGET_TILE_SECONDS: f64 = 60.0;

/// Aggregate counters a driver prints at least every 5 seconds.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub submitted: u64,
    pub waiting: u64,
    pub running: u64,
    pub done: u64,
    pub avg_runtime_micros: u64,
    pub avg_transfer_bytes: u64,
    pub candidates_or_cells: u64,
}

impl ProgressCounters {
    pub fn update_from_stats(&mut self, stats: &QueueStats) {
        self.waiting = stats.waiting as u64;
        self.running = stats.running as u64;
        self.avg_runtime_micros = if stats.complete as u64 + self.done > 0 {
            stats
                .total_runtime_micros
                .checked_div((self.done + stats.complete as u64).max(1))
                .unwrap_or(0)
        } else {
            0
        };
        self.avg_transfer_bytes = stats
            .bytes_transferred
            .checked_div((self.done + 1).max(1))
            .unwrap_or(0);
    }
}

/// Prints the `elapsed, workers (…), tasks (…), avg-runtime, avg-transfer,
/// candidates-or-cells` progress line no more often than `interval`.
pub struct ProgressTable {
    started: Instant,
    last_printed: Option<Instant>,
    interval: Duration,
}

impl ProgressTable {
    pub fn new(interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_printed: None,
            interval,
        }
    }

    pub fn due(&self) -> bool {
        match self.last_printed {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        }
    }

    pub fn print(&mut self, counters: &ProgressCounters, stats: &QueueStats) {
        println!(
            "elapsed={}s workers(init/ready/busy)={}/{}/{} tasks(submit/wait/run/done)={}/{}/{}/{} avg-runtime={}us avg-transfer={}B candidates-or-cells={}",
            self.started.elapsed().as_secs(),
            stats.workers_init,
            stats.workers_ready,
            stats.workers_busy,
            counters.submitted,
            counters.waiting,
            counters.running,
            counters.done,
            counters.avg_runtime_micros,
            counters.avg_transfer_bytes,
            counters.candidates_or_cells,
        );
        self.last_printed = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_tiles_covers_grid_row_major() {
        let tiles = partition_tiles(5, 3, 2);
        // rows of height 2,1 ; cols of width 2,2,1 -> 2*3 = 6 tiles
        assert_eq!(tiles.len(), 6);
        assert_eq!(tiles[0], Tile { tile_y: 0, tile_x: 0, y_start: 0, y_end: 2, x_start: 0, x_end: 2 });
        assert_eq!(tiles[1], Tile { tile_y: 0, tile_x: 1, y_start: 0, y_end: 2, x_start: 2, x_end: 4 });
        assert_eq!(tiles[2], Tile { tile_y: 0, tile_x: 2, y_start: 0, y_end: 2, x_start: 4, x_end: 5 });
        assert_eq!(tiles[3].tile_y, 1);
        assert_eq!(tiles.last().unwrap().y_end, 3);
    }

    #[test]
    fn partition_tiles_handles_empty_grid() {
        assert!(partition_tiles(0, 0, 4).is_empty());
    }

    #[test]
    fn estimate_run_time_floors_at_minimum() {
        let estimate = estimate_run_time(|| Ok(()), Duration::from_millis(1));
        assert!(estimate >= MIN_COMPARISON_SECONDS);
    }

    #[test]
    fn tile_size_for_target_scales_with_comparison_cost() {
        // 0.1s default, 60s target -> 600 comparisons -> floor(sqrt(600)) = 24
        let size = tile_size_for_target(DEFAULT_COMPARISON_SECONDS, TARGET_TILE_SECONDS);
        assert_eq!(size, 24);
    }

    #[test]
    fn tile_size_for_target_never_returns_zero() {
        assert_eq!(tile_size_for_target(1000.0, TARGET_TILE_SECONDS), 1);
        assert_eq!(tile_size_for_target(0.0, TARGET_TILE_SECONDS), 1);
    }
}
