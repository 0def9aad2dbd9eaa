//! Remote worker binary: connects to a queue's listening port, announces
//! its capabilities, and executes whatever command lines it is dispatched
//! until told to exit or the connection drops.

mod session;

use std::time::Duration;

use clap::Parser;

/// Connect to a queue and execute dispatched tasks until told to exit.
#[derive(Debug, Parser)]
#[command(name = "cctools-worker", version)]
struct Args {
    /// `host:port` of the queue to connect to.
    master: String,

    /// Directory used for staging task inputs/outputs and the resident
    /// file cache. Defaults to the XDG state directory.
    #[arg(long)]
    workdir: Option<std::path::PathBuf>,

    /// Cores to advertise in the `ready` handshake.
    #[arg(long, default_value_t = num_cpus())]
    cores: u32,

    /// Memory (MB) to advertise.
    #[arg(long, default_value_t = 1024)]
    memory_mb: u64,

    /// Disk (MB) to advertise.
    #[arg(long, default_value_t = 10_240)]
    disk_mb: u64,

    /// Maximum wall-clock time a single task may run before it is killed.
    #[arg(long, default_value_t = 3600)]
    task_timeout_secs: u64,
}

fn num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let workdir = match args.workdir {
        Some(dir) => dir,
        None => cctools_core::paths::state_dir()?.join("worker"),
    };
    std::fs::create_dir_all(&workdir)?;

    let (host, port) = args
        .master
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected host:port, got {:?}", args.master))?;
    let port: u16 = port.parse()?;

    let hostname = gethostname();
    let config = session::WorkerConfig {
        hostname,
        cores: args.cores,
        memory_mb: args.memory_mb,
        disk_mb: args.disk_mb,
        workdir: workdir.clone(),
        task_timeout: Duration::from_secs(args.task_timeout_secs),
    };

    let mut backoff = Duration::from_secs(1);
    loop {
        println!("connecting to {host}:{port}");
        match session::run_session(host, port, &config).await {
            Ok(()) => {
                println!("master asked us to exit, shutting down");
                return Ok(());
            }
            Err(err) => {
                eprintln!("session ended: {err:#}, retrying in {}s", backoff.as_secs());
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(60));
    }
}

fn gethostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "worker".to_string())
}
