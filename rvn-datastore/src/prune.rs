//! Retention policies for file versions.
//!
//! A policy keeps a bounded number of versions per time bucket, walking
//! backward from the newest version. Evaluation is per file path; the
//! actual row removal is driven by the owning timeline.

use serde::{Deserialize, Serialize};

/// Sentinel for "unbounded" interval/time frame values, in milliseconds.
pub const UNBOUNDED: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    pub fn millis(self) -> i64 {
        match self {
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60 * 1_000,
            TimeUnit::Hours => 60 * 60 * 1_000,
            TimeUnit::Days => 24 * 60 * 60 * 1_000,
            TimeUnit::Weeks => 7 * 24 * 60 * 60 * 1_000,
            TimeUnit::Months => 30 * 24 * 60 * 60 * 1_000,
            TimeUnit::Years => 365 * 24 * 60 * 60 * 1_000,
        }
    }

    fn singular(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "second",
            TimeUnit::Minutes => "minute",
            TimeUnit::Hours => "hour",
            TimeUnit::Days => "day",
            TimeUnit::Weeks => "week",
            TimeUnit::Months => "month",
            TimeUnit::Years => "year",
        }
    }
}

/// Bucketed retention rule. `min_interval` and `time_frame` are
/// milliseconds; [`UNBOUNDED`] marks an infinite value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CleanupPolicy {
    pub min_interval: i64,
    pub time_frame: i64,
    pub max_versions: u32,
    pub description: String,
}

impl CleanupPolicy {
    /// Never deletes anything.
    pub fn forever() -> Self {
        Self {
            min_interval: UNBOUNDED,
            time_frame: UNBOUNDED,
            max_versions: u32::MAX,
            description: "Keep all versions forever".to_string(),
        }
    }

    /// Global cap of `n` versions per file.
    pub fn of_versions(n: u32) -> Self {
        Self {
            min_interval: UNBOUNDED,
            time_frame: UNBOUNDED,
            max_versions: n,
            description: format!("Keep the newest {} versions of each file", n),
        }
    }

    /// Keep every version for `amount * unit`, then delete.
    pub fn of_duration(amount: u32, unit: TimeUnit) -> Self {
        let span = (amount as i64).saturating_mul(unit.millis());
        Self {
            min_interval: span.max(1),
            time_frame: span,
            max_versions: u32::MAX,
            description: format!(
                "Keep each version for {} {}{}",
                amount,
                unit.singular(),
                if amount == 1 { "" } else { "s" }
            ),
        }
    }

    /// Keep `n` versions per interval of `unit`, forever.
    pub fn of_staggered(n: u32, unit: TimeUnit) -> Self {
        Self {
            min_interval: unit.millis(),
            time_frame: UNBOUNDED,
            max_versions: n,
            description: format!(
                "Keep {} version{} per {} forever",
                n,
                if n == 1 { "" } else { "s" },
                unit.singular()
            ),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Compute the indices of versions to delete under `policy`.
///
/// `times` are version timestamps (epoch milliseconds) sorted newest
/// first. Buckets of width `min_interval` are walked backward from the
/// newest time, stopping when the next bucket's start would fall before
/// `window_end - time_frame`; each bucket keeps the `max_versions` newest
/// entries strictly inside it. Versions covered by no bucket are deleted.
pub fn select_removals(policy: &CleanupPolicy, times: &[i64]) -> Vec<usize> {
    if times.is_empty() {
        return Vec::new();
    }
    if policy.max_versions == u32::MAX && policy.time_frame == UNBOUNDED {
        return Vec::new();
    }

    debug_assert!(times.windows(2).all(|pair| pair[0] >= pair[1]));

    let window_end = times[0];
    let oldest = *times.last().unwrap();
    let cutoff = window_end.saturating_sub(policy.time_frame);
    let min_interval = policy.min_interval.max(1);

    let mut keep = vec![false; times.len()];
    let mut bucket_end = window_end;

    loop {
        let bucket_start = bucket_end.saturating_sub(min_interval);
        if bucket_start < cutoff {
            break;
        }

        let mut kept_in_bucket = 0u32;
        for (index, &time) in times.iter().enumerate() {
            if time > bucket_start && time <= bucket_end {
                if kept_in_bucket < policy.max_versions {
                    keep[index] = true;
                    kept_in_bucket += 1;
                }
            }
        }

        if bucket_start < oldest || bucket_start == i64::MIN {
            break;
        }
        bucket_end = bucket_start;
    }

    keep.iter()
        .enumerate()
        .filter(|(_, kept)| !**kept)
        .map(|(index, _)| index)
        .collect()
}
