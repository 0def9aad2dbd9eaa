//! Fixed-width bucketed histograms of observed resource usage, the same
//! shape `resource_monitor_histograms.c` builds per resource field across a
//! run's completed tasks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A histogram of one resource field's observed values, bucketed by
/// `bucket_width`. Alongside the bucket counts (used for percentiles), it
/// keeps every `(value, wall_time)` observation so a first-allocation
/// calculator can minimize expected waste against the exact samples, the
/// way `total_waste()` does over `summaries_sorted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    bucket_width: f64,
    counts: BTreeMap<i64, u64>,
    total: u64,
    max_value: f64,
    samples: Vec<(f64, f64)>,
}

impl Histogram {
    /// A new, empty histogram with the given bucket width.
    pub fn new(bucket_width: f64) -> Self {
        assert!(bucket_width > 0.0, "bucket_width must be positive");
        Self {
            bucket_width,
            counts: BTreeMap::new(),
            total: 0,
            max_value: 0.0,
            samples: Vec::new(),
        }
    }

    fn bucket_of(&self, value: f64) -> i64 {
        (value / self.bucket_width).floor() as i64
    }

    /// Record one observation paired with the wall time of the task it was
    /// measured on, the weight `total_waste()` uses for each sample.
    pub fn record(&mut self, value: f64, wall_time: f64) {
        let bucket = self.bucket_of(value);
        *self.counts.entry(bucket).or_insert(0) += 1;
        self.total += 1;
        self.max_value = self.max_value.max(value);
        self.samples.push((value, wall_time));
    }

    /// Total observations recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Largest value recorded so far, 0.0 if empty.
    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    /// The raw `(value, wall_time)` observations, in recording order.
    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    /// Load a previously saved histogram, or a fresh empty one if `path`
    /// does not exist yet.
    pub fn load_or_new(path: &std::path::Path, bucket_width: f64) -> anyhow::Result<Self> {
        Ok(cctools_core::paths::load_json(path)?.unwrap_or_else(|| Self::new(bucket_width)))
    }

    /// Persist this histogram to `path` atomically.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        cctools_core::paths::save_json(path, self)
    }

    /// The smallest value `v` such that at least `percentile` (0.0-1.0) of
    /// recorded observations are `<= v`. Returns `None` on an empty
    /// histogram.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let target = (percentile.clamp(0.0, 1.0) * self.total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (&bucket, &count) in &self.counts {
            cumulative += count;
            if cumulative >= target.max(1) {
                return Some((bucket + 1) as f64 * self.bucket_width);
            }
        }
        self.counts
            .keys()
            .next_back()
            .map(|&b| (b + 1) as f64 * self.bucket_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_empty_histogram_is_none() {
        let hist = Histogram::new(1.0);
        assert_eq!(hist.percentile(0.5), None);
    }

    #[test]
    fn percentile_covers_the_observed_maximum() {
        let mut hist = Histogram::new(10.0);
        for v in [5.0, 15.0, 25.0, 35.0, 95.0] {
            hist.record(v, 1.0);
        }
        let p100 = hist.percentile(1.0).unwrap();
        assert!(p100 >= 95.0);
    }

    #[test]
    fn max_value_tracks_the_largest_observation() {
        let mut hist = Histogram::new(10.0);
        for v in [5.0, 95.0, 25.0] {
            hist.record(v, 1.0);
        }
        assert_eq!(hist.max_value(), 95.0);
    }

    #[test]
    fn load_or_new_persists_across_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hist.json");

        let mut hist = Histogram::load_or_new(&path, 10.0).unwrap();
        assert_eq!(hist.total(), 0);
        hist.record(42.0, 3.5);
        hist.save(&path).unwrap();

        let reloaded = Histogram::load_or_new(&path, 10.0).unwrap();
        assert_eq!(reloaded.total(), 1);
        assert_eq!(reloaded.samples(), &[(42.0, 3.5)]);
    }

    #[test]
    fn json_round_trips() {
        let mut hist = Histogram::new(5.0);
        hist.record(12.0, 1.0);
        hist.record(13.0, 2.0);
        let json = serde_json::to_string(&hist).unwrap();
        let back: Histogram = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total(), 2);
    }
}
