//! Baseline and stratification management
//!
//! Recovery measurements are partitioned by (stratum, posture) and each
//! bucket keeps a rolling mean plus SDD, the robust noise scale used to
//! self-calibrate detection thresholds. Buckets are never mixed: standing
//! inter-set recovery and a supine protocol mean different things
//! physiologically, so an interval whose posture disagrees with its
//! stratum's convention simply lands in its own bucket.
//!
//! The actionability filter also lives here, upstream of the detectors:
//! rejected or low-confidence intervals never reach the trend stream, and
//! the detectors themselves never inspect quality status.

use chrono::Utc;
use std::collections::HashMap;

use crate::config::{BaselineConfig, TrendConfig};
use crate::models::{Observation, Posture, RecoveryInterval, StratumBaseline, Stratum};

/// Bucket key: baselines and trend state are kept per (stratum, posture)
pub type Bucket = (Stratum, Posture);

/// Confidence-weighted primary metric for one interval
///
/// `None` when the primary checkpoint was not measurable; such intervals
/// cannot contribute to the trend stream.
pub fn weighted_metric(interval: &RecoveryInterval, primary_checkpoint_secs: u32) -> Option<f64> {
    interval
        .metrics
        .drop_at(primary_checkpoint_secs)
        .map(|drop| drop * interval.confidence)
}

/// Actionability filter: what is allowed into baselines and detectors
pub fn is_actionable(interval: &RecoveryInterval, trend: &TrendConfig) -> bool {
    interval.status != crate::models::QualityStatus::Rejected
        && interval.confidence >= trend.min_confidence
}

/// Group actionable intervals into chronological per-bucket observation
/// streams
pub fn bucket_observations(
    intervals: &[RecoveryInterval],
    trend: &TrendConfig,
    primary_checkpoint_secs: u32,
) -> HashMap<Bucket, Vec<Observation>> {
    let mut buckets: HashMap<Bucket, Vec<Observation>> = HashMap::new();
    for interval in intervals {
        if !is_actionable(interval, trend) {
            continue;
        }
        let Some(value) = weighted_metric(interval, primary_checkpoint_secs) else {
            continue;
        };
        buckets
            .entry((interval.stratum, interval.posture))
            .or_default()
            .push(Observation { time: interval.peak_time, value });
    }
    for stream in buckets.values_mut() {
        stream.sort_by_key(|o| o.time);
    }
    buckets
}

/// Rolling baseline calculator
pub struct BaselineManager<'a> {
    config: &'a BaselineConfig,
}

impl<'a> BaselineManager<'a> {
    pub fn new(config: &'a BaselineConfig) -> Self {
        BaselineManager { config }
    }

    /// Compute the current baseline for one bucket's chronological stream
    ///
    /// `None` is the cold-start outcome: fewer observations than the
    /// configured minimum means no baseline exists yet, and detectors must
    /// report insufficient data rather than alert against an undefined
    /// reference.
    pub fn compute(
        &self,
        bucket: Bucket,
        observations: &[Observation],
    ) -> Option<StratumBaseline> {
        if observations.len() < self.config.min_observations {
            return None;
        }
        let start = observations.len().saturating_sub(self.config.window);
        let recent = &observations[start..];

        let mean = recent.iter().map(|o| o.value).sum::<f64>() / recent.len() as f64;

        let mut diffs: Vec<f64> = recent
            .windows(2)
            .map(|pair| (pair[1].value - pair[0].value).abs())
            .collect();
        diffs.sort_by(|a, b| a.total_cmp(b));
        let sdd = if diffs.is_empty() {
            0.0
        } else if diffs.len() % 2 == 1 {
            diffs[diffs.len() / 2]
        } else {
            (diffs[diffs.len() / 2 - 1] + diffs[diffs.len() / 2]) / 2.0
        };

        Some(StratumBaseline {
            stratum: bucket.0,
            posture: bucket.1,
            mean,
            sdd,
            count: recent.len(),
            updated_at: Utc::now(),
        })
    }
}
