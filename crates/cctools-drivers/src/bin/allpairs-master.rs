//! `allpairs_master` equivalent: matrix-tiling driver over two sequence
//! set-list files and a compare binary.

use std::path::PathBuf;

use clap::Parser;

use cctools_drivers::allpairs::{self, AllpairsConfig};
use cctools_drivers::skeleton::{tile_size_for_target, DEFAULT_COMPARISON_SECONDS, TARGET_TILE_SECONDS};
use cctools_queue::{Queue, QueueConfig};

/// Partition an X×Y grid of sequence comparisons into tiles and dispatch
/// one task per tile until all candidates are found.
#[derive(Debug, Parser)]
#[command(name = "allpairs-master", version)]
struct Args {
    x_set_list: PathBuf,
    y_set_list: PathBuf,
    compare_binary: PathBuf,

    #[arg(short = 'p', long, default_value_t = 0)]
    port: u16,

    /// Estimated seconds per comparison for the compare function; used to
    /// size a tile when `-x`/`-y` are not given.
    #[arg(short = 't', long)]
    est_secs: Option<f64>,

    /// Fixed tile width; overrides the estimate-derived size.
    #[arg(short = 'x', long)]
    tile_w: Option<usize>,

    /// Fixed tile height; must be given together with `-x`.
    #[arg(short = 'y', long)]
    tile_h: Option<usize>,

    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value = "candidates.out")]
    output: PathBuf,
}

fn count_lines(path: &std::path::Path) -> anyhow::Result<usize> {
    Ok(std::fs::read_to_string(path)?.lines().count())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let x_len = count_lines(&args.x_set_list)?;
    let y_len = count_lines(&args.y_set_list)?;

    // Tiles are square; `-x`/`-y` are accepted separately to match the
    // original CLI surface but must agree when both are given.
    if let (Some(w), Some(h)) = (args.tile_w, args.tile_h) {
        anyhow::ensure!(w == h, "-x and -y must match: tiles are square");
    }
    let tile_size = args.tile_w.or(args.tile_h).unwrap_or_else(|| {
        tile_size_for_target(args.est_secs.unwrap_or(DEFAULT_COMPARISON_SECONDS), TARGET_TILE_SECONDS)
    });

    let config = AllpairsConfig {
        compare_binary: args.compare_binary,
        x_set_list: args.x_set_list,
        y_set_list: args.y_set_list,
        x_len,
        y_len,
        tile_size: tile_size.max(1),
        checkpoint_path: args.checkpoint,
        output_path: args.output,
    };

    let queue = Queue::create(args.port, QueueConfig::default()).await?;
    println!("allpairs-master listening on {}", queue.local_addr());

    allpairs::run(&queue, &config).await?;

    queue.terminate().await;
    queue.join().await?;
    Ok(())
}
