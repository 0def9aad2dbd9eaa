//! `sand_filter_master` / `sand_align_master` equivalent: two-phase
//! assembly pipeline, selected via subcommand to match the original
//! two-binary split.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cctools_drivers::allpairs::{self, AllpairsConfig};
use cctools_drivers::sand::{self, SandAlignConfig};
use cctools_drivers::skeleton::{tile_size_for_target, DEFAULT_COMPARISON_SECONDS, TARGET_TILE_SECONDS};
use cctools_queue::{Queue, QueueConfig};

#[derive(Debug, Parser)]
#[command(name = "sand-master", version)]
struct Args {
    #[arg(short = 'p', long, default_value_t = 0)]
    port: u16,

    #[command(subcommand)]
    phase: Phase,
}

#[derive(Debug, Subcommand)]
enum Phase {
    /// Phase 1: matrix-tiling pass emitting a candidate-pairs file.
    Filter {
        x_set_list: PathBuf,
        y_set_list: PathBuf,
        filter_binary: PathBuf,

        #[arg(short = 't', long)]
        est_secs: Option<f64>,
        #[arg(short = 'x', long)]
        tile_w: Option<usize>,

        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long, default_value = "candidates.out")]
        output: PathBuf,
    },
    /// Phase 2: group candidates by their A sequence and dispatch
    /// alignment tasks.
    Align {
        candidate_pairs: PathBuf,
        sequence_list: PathBuf,
        align_binary: PathBuf,

        #[arg(long, default_value_t = 20)]
        group_size: usize,
        #[arg(long, default_value = "overlap.out")]
        output: PathBuf,
    },
}

fn count_lines(path: &std::path::Path) -> anyhow::Result<usize> {
    Ok(std::fs::read_to_string(path)?.lines().count())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let queue = Queue::create(args.port, QueueConfig::default()).await?;
    println!("sand-master listening on {}", queue.local_addr());

    match args.phase {
        Phase::Filter {
            x_set_list,
            y_set_list,
            filter_binary,
            est_secs,
            tile_w,
            checkpoint,
            output,
        } => {
            let x_len = count_lines(&x_set_list)?;
            let y_len = count_lines(&y_set_list)?;
            let tile_size = tile_w.unwrap_or_else(|| {
                tile_size_for_target(est_secs.unwrap_or(DEFAULT_COMPARISON_SECONDS), TARGET_TILE_SECONDS)
            });
            let config = AllpairsConfig {
                compare_binary: filter_binary,
                x_set_list,
                y_set_list,
                x_len,
                y_len,
                tile_size: tile_size.max(1),
                checkpoint_path: checkpoint,
                output_path: output,
            };
            allpairs::run(&queue, &config).await?;
        }
        Phase::Align {
            candidate_pairs,
            sequence_list,
            align_binary,
            group_size,
            output,
        } => {
            let config = SandAlignConfig {
                candidate_pairs_path: candidate_pairs,
                sequence_list_path: sequence_list,
                align_binary,
                overlap_output_path: output,
                max_group_size: group_size,
            };
            sand::run(&queue, &config).await?;
        }
    }

    queue.terminate().await;
    queue.join().await?;
    Ok(())
}
