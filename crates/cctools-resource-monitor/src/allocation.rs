//! First-allocation estimation: pick a resource cap for a task's first
//! attempt that minimizes expected waste against a category's historical
//! usage, mirroring `total_waste()` and
//! `set_first_allocation_brute_force_field()` in
//! `resource_monitor_histograms.c`.
//!
//! Waste for a candidate allocation `c` against an observed sample `(v,
//! wall_time)` is `(max_value - v + c) * wall_time` when `v > c` (the task
//! blew the cap and had to be retried at the category maximum), or `(c -
//! v) * wall_time` when `v <= c` (the cap was never hit, but `c - v` of it
//! sat unused for `wall_time`). The total is the wall-time-weighted mean of
//! that over every sample.

use crate::histogram::Histogram;

/// Wall-time-weighted expected waste of allocating `candidate` for every
/// observation in `history`, following `total_waste()`.
pub fn total_waste(history: &Histogram, candidate: f64) -> f64 {
    let samples = history.samples();
    if samples.is_empty() {
        return 0.0;
    }
    let max_value = history.max_value();
    let mut waste = 0.0;
    let mut wall_time_accum = 0.0;
    for &(value, wall_time) in samples {
        wall_time_accum += wall_time;
        waste += if value > candidate {
            (max_value - value + candidate) * wall_time
        } else {
            (candidate - value) * wall_time
        };
    }
    if wall_time_accum > 0.0 {
        waste / wall_time_accum
    } else {
        0.0
    }
}

/// Brute-force search over every observed value for the candidate
/// allocation that minimizes `total_waste`, as
/// `set_first_allocation_brute_force_field()` does. Returns `None` on an
/// empty history.
pub fn first_allocation_brute_force(history: &Histogram) -> Option<f64> {
    let samples = history.samples();
    if samples.is_empty() {
        return None;
    }
    let mut candidates: Vec<f64> = samples.iter().map(|&(v, _)| v).collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).unwrap());
    candidates.dedup();

    let mut best_candidate = history.max_value();
    let mut best_waste = f64::MAX;
    for candidate in candidates {
        let waste = total_waste(history, candidate);
        if waste < best_waste {
            best_waste = waste;
            best_candidate = candidate;
        }
    }
    Some(best_candidate)
}

/// Recommend a resource cap for a task's first attempt: the waste-minimizing
/// brute-force candidate from `history`, rounded up to `granularity` and
/// floored at `minimum`. Falls back to `default_cap` when there is no
/// history yet.
pub fn first_allocation(
    history: &Histogram,
    granularity: f64,
    minimum: f64,
    default_cap: f64,
) -> f64 {
    let estimate = first_allocation_brute_force(history).unwrap_or(default_cap);
    let rounded = if granularity > 0.0 {
        (estimate / granularity).ceil() * granularity
    } else {
        estimate
    };
    rounded.max(minimum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_default_with_no_history() {
        let hist = Histogram::new(1.0);
        let cap = first_allocation(&hist, 64.0, 0.0, 512.0);
        assert_eq!(cap, 512.0);
    }

    #[test]
    fn rounds_up_to_granularity_and_respects_minimum() {
        let mut hist = Histogram::new(1.0);
        for _ in 0..100 {
            hist.record(100.0, 1.0);
        }
        let cap = first_allocation(&hist, 64.0, 256.0, 512.0);
        assert!(cap >= 256.0);
        assert_eq!(cap % 64.0, 0.0);
    }

    #[test]
    fn brute_force_prefers_a_cap_below_a_rare_outlier() {
        // Many cheap tasks, one expensive outlier: the waste-minimizing cap
        // should sit near the common case rather than the outlier, since
        // retrying the rare outlier at the category max costs less overall
        // than inflating every cheap task's allocation to cover it.
        let mut hist = Histogram::new(1.0);
        for _ in 0..99 {
            hist.record(10.0, 1.0);
        }
        hist.record(1000.0, 1.0);

        let chosen = first_allocation_brute_force(&hist).unwrap();
        assert_eq!(chosen, 10.0);
    }

    #[test]
    fn total_waste_is_zero_for_an_exact_uniform_match() {
        let mut hist = Histogram::new(1.0);
        for _ in 0..10 {
            hist.record(50.0, 2.0);
        }
        assert_eq!(total_waste(&hist, 50.0), 0.0);
    }

    #[test]
    fn total_waste_penalizes_undershoot_by_the_gap_to_max_plus_candidate() {
        let mut hist = Histogram::new(1.0);
        hist.record(100.0, 1.0);
        // max_value is 100; candidate 40 undershoots the one sample, so
        // waste = (100 - 100 + 40) * 1 = 40.
        assert_eq!(total_waste(&hist, 40.0), 40.0);
    }
}
