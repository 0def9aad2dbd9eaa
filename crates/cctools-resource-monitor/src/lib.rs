#![deny(unsafe_code)]
#![deny(unreachable_pub)]

//! Resource sampling, disk-usage accounting, and historical-usage
//! histograms used to cap and report what a task actually consumed.

pub mod allocation;
pub mod disk_usage;
pub mod histogram;
pub mod monitor;
pub mod sample;

pub use disk_usage::DiskUsageWalk;
pub use histogram::Histogram;
pub use monitor::{supervise, LimitExceeded, ResourceLimits, ResourceSummary};
pub use sample::{sample_tree, TreeSample};
