//! `resource_monitor`-equivalent binary: runs a measured command under
//! supervision, prints its final resource summary, and maintains a
//! per-category usage histogram on disk to propose the next run's
//! first-allocation cap.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use clap::Parser;
use tokio::process::Command;

use cctools_resource_monitor::allocation::first_allocation;
use cctools_resource_monitor::histogram::Histogram;
use cctools_resource_monitor::monitor::{supervise, ResourceLimits};

/// Run `command` under resource supervision and report its usage.
#[derive(Debug, Parser)]
#[command(name = "resource-monitor", version)]
struct Args {
    /// Command and arguments to run, e.g. `resource-monitor -- ./compare a b`.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,

    /// Directory the command runs in; its size is measured at completion.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Category name: separates the on-disk usage history used for the
    /// first-allocation proposal.
    #[arg(long, default_value = "default")]
    category: String,

    /// Poll interval for process-tree sampling.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Kill the command if wall-clock time exceeds this many seconds.
    #[arg(long)]
    max_wall_time_secs: Option<u64>,

    /// Kill the command if summed RSS exceeds this many MB.
    #[arg(long)]
    max_memory_mb: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let history_dir = cctools_core::paths::state_dir()?.join("resource-monitor");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join(format!("{}.memory.json", args.category));
    let mut memory_history = Histogram::load_or_new(&history_path, 1024.0)?;

    let proposed_cap = first_allocation(&memory_history, 1024.0, 0.0, 1024.0 * 1024.0);
    println!(
        "resource-monitor: category={} proposed_memory_cap_kb={proposed_cap}",
        args.category
    );

    let mut child = Command::new(&args.command[0])
        .args(&args.command[1..])
        .current_dir(&workdir)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let limits = ResourceLimits {
        max_wall_time: args.max_wall_time_secs.map(Duration::from_secs),
        max_memory_kb: args.max_memory_mb.map(|mb| mb * 1024),
    };
    let summary = supervise(
        &mut child,
        limits,
        Duration::from_millis(args.interval_ms),
        &workdir,
    )
    .await?;

    memory_history.record(summary.peak_memory_kb as f64, summary.wall_time.as_secs_f64());
    memory_history.save(&history_path)?;

    println!(
        "resource-monitor: wall_time={:.3}s cpu_time={:.3}s peak_memory_kb={} peak_vsz_kb={} \
         mean_memory_kb={:.1} peak_processes={} bytes_read={} bytes_written={} peak_open_fds={} \
         disk_usage_bytes={} limit_exceeded={:?}",
        summary.wall_time.as_secs_f64(),
        summary.cpu_time.as_secs_f64(),
        summary.peak_memory_kb,
        summary.peak_vsz_kb,
        summary.mean_memory_kb,
        summary.peak_process_count,
        summary.bytes_read,
        summary.bytes_written,
        summary.peak_open_fd_count,
        summary.disk_usage_bytes,
        summary.limit_exceeded,
    );

    let exit_code = match summary.exit_status {
        Some(status) => status.code().unwrap_or(1),
        None => 1,
    };
    std::process::exit(exit_code);
}
