#![deny(unsafe_code)]
#![deny(unreachable_pub)]

//! Application drivers (component F): the shared progress-table/tile
//! skeleton plus the three driver shapes built on top of [`cctools_queue`]
//! — matrix tiling, dependency grid, and the two-phase assembly pipeline.

pub mod allpairs;
pub mod sand;
pub mod skeleton;
pub mod wavefront;

pub use skeleton::{partition_tiles, ProgressCounters, ProgressTable, Tile};
