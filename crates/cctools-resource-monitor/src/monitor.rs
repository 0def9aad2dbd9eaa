//! Supervise a child process: poll its resource-tree usage on an interval
//! and kill it if it crosses a configured limit, the way the resource
//! monitor daemon wraps a measured command.

use std::path::Path;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::Child;

use crate::disk_usage::measure_now;
use crate::sample::sample_tree;

/// Caps enforced against a supervised process tree. `None` disables that
/// particular check.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    /// Kill the tree if wall-clock time exceeds this.
    pub max_wall_time: Option<Duration>,
    /// Kill the tree if summed RSS exceeds this many KB.
    pub max_memory_kb: Option<u64>,
}

/// Which limit caused a supervised process to be killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    /// Wall-clock time limit.
    WallTime,
    /// Resident memory limit.
    Memory,
}

/// Final accounting for a supervised run (§4.G "final summary").
#[derive(Debug, Clone, Copy)]
pub struct ResourceSummary {
    /// Observed wall-clock duration.
    pub wall_time: Duration,
    /// Observed cumulative CPU time across the tree.
    pub cpu_time: Duration,
    /// Peak summed RSS observed, KB.
    pub peak_memory_kb: u64,
    /// Peak summed virtual size observed, KB.
    pub peak_vsz_kb: u64,
    /// Peak number of concurrent processes observed in the tree.
    pub peak_process_count: u32,
    /// Latest observed cumulative bytes read across the tree.
    pub bytes_read: u64,
    /// Latest observed cumulative bytes written across the tree.
    pub bytes_written: u64,
    /// Peak number of open file descriptors observed across the tree.
    pub peak_open_fd_count: u32,
    /// Mean summed RSS across every poll tick, KB.
    pub mean_memory_kb: f64,
    /// Disk usage of the task's working directory at completion, bytes.
    pub disk_usage_bytes: u64,
    /// Set if a limit forced early termination.
    pub limit_exceeded: Option<LimitExceeded>,
    /// The process's exit status, if it ran to completion on its own.
    pub exit_status: Option<ExitStatus>,
}

/// Poll `child`'s process tree every `poll_interval` until it exits or a
/// limit in `limits` is crossed, in which case the tree is killed. Disk
/// usage of `workdir` is measured once the process has stopped, the way
/// the resource monitor daemon reports a task's sandbox footprint
/// alongside its process-tree peaks.
pub async fn supervise(
    child: &mut Child,
    limits: ResourceLimits,
    poll_interval: Duration,
    workdir: &Path,
) -> std::io::Result<ResourceSummary> {
    let start = Instant::now();
    let mut summary = ResourceSummary {
        wall_time: Duration::ZERO,
        cpu_time: Duration::ZERO,
        peak_memory_kb: 0,
        peak_vsz_kb: 0,
        peak_process_count: 0,
        bytes_read: 0,
        bytes_written: 0,
        peak_open_fd_count: 0,
        mean_memory_kb: 0.0,
        disk_usage_bytes: 0,
        limit_exceeded: None,
        exit_status: None,
    };

    let root_pid = child.id().map(|p| p as i32);
    let mut ticker = tokio::time::interval(poll_interval);
    let mut memory_sum_kb: u128 = 0;
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            status = child.wait() => {
                summary.wall_time = start.elapsed();
                summary.exit_status = Some(status?);
                summary.disk_usage_bytes = measure_now(workdir).0;
                return Ok(summary);
            }
            _ = ticker.tick() => {
                if let Some(pid) = root_pid {
                    let sample = sample_tree(pid);
                    summary.cpu_time = sample.cpu_time.max(summary.cpu_time);
                    summary.peak_memory_kb = summary.peak_memory_kb.max(sample.rss_kb);
                    summary.peak_vsz_kb = summary.peak_vsz_kb.max(sample.vsz_kb);
                    summary.peak_process_count = summary.peak_process_count.max(sample.process_count);
                    summary.bytes_read = sample.bytes_read;
                    summary.bytes_written = sample.bytes_written;
                    summary.peak_open_fd_count = summary.peak_open_fd_count.max(sample.open_fd_count);
                    memory_sum_kb += sample.rss_kb as u128;
                    tick_count += 1;
                    summary.mean_memory_kb = memory_sum_kb as f64 / tick_count as f64;
                }
                summary.wall_time = start.elapsed();

                let exceeded = limits
                    .max_wall_time
                    .is_some_and(|cap| summary.wall_time > cap)
                    .then_some(LimitExceeded::WallTime)
                    .or_else(|| {
                        limits
                            .max_memory_kb
                            .is_some_and(|cap| summary.peak_memory_kb > cap)
                            .then_some(LimitExceeded::Memory)
                    });

                if let Some(kind) = exceeded {
                    summary.limit_exceeded = Some(kind);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    summary.disk_usage_bytes = measure_now(workdir).0;
                    return Ok(summary);
                }
            }
        }
    }
}
