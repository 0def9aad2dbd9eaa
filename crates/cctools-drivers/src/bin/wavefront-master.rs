//! `wavefront_master` equivalent: drives a dependency grid to completion.

use std::path::PathBuf;

use clap::Parser;

use cctools_drivers::wavefront::{self, WavefrontConfig};
use cctools_queue::{Queue, QueueConfig};

/// Dispatch one task per grid cell as soon as its three predecessors have
/// results, recovering already-completed cells from the output log.
#[derive(Debug, Parser)]
#[command(name = "wavefront-master", version)]
struct Args {
    boundary_file: PathBuf,
    command_binary: PathBuf,

    #[arg(short = 'p', long, default_value_t = 0)]
    port: u16,

    #[arg(long)]
    width: usize,

    #[arg(long)]
    height: usize,

    #[arg(long, default_value = "wavefront.out")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = WavefrontConfig {
        width: args.width,
        height: args.height,
        command_binary: args.command_binary,
        boundary_path: args.boundary_file,
        output_path: args.output,
    };

    let queue = Queue::create(args.port, QueueConfig::default()).await?;
    println!("wavefront-master listening on {}", queue.local_addr());

    wavefront::run(&queue, &config).await?;

    queue.terminate().await;
    queue.join().await?;
    Ok(())
}
