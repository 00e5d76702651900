//! Drift detection: gap-aware EWMA and one-sided CUSUM
//!
//! Two independent, stateful detectors run per (stratum, posture) bucket
//! over the confidence-weighted metric stream in chronological order. They
//! are complementary: CUSUM accumulates small sustained shifts and fires
//! within a genuine step decline; EWMA tracks the level itself and lags but
//! keeps a readable trend line.
//!
//! Both detectors are pure step functions
//! `(prior_state, observation, params) -> (new_state, alert?)`. They never
//! inspect quality status; the actionability filter upstream decides what
//! enters the stream. Thresholds are expressed as SDD multiples so each
//! bucket self-calibrates to its own noise.
//!
//! Gap rule: a gap longer than the configured threshold resets state to the
//! bucket baseline instead of smoothing across the break, so a two-month
//! layoff cannot masquerade as a gradual decline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;
use crate::models::{Observation, StratumBaseline, TrendState};

/// Resolved per-bucket detector parameters
///
/// Built from configuration plus the bucket's current baseline; absent a
/// baseline there are no valid parameters and detection reports
/// insufficient data instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendParams {
    pub baseline_mean: f64,
    pub sdd: f64,
    pub lambda: f64,
    pub gap: Duration,
    /// CUSUM slack per observation
    pub k: f64,
    /// CUSUM decision threshold
    pub h: f64,
    /// EWMA alert line: baseline − this offset
    pub ewma_alert_offset: f64,
    pub near_band: f64,
    pub recovery_reset_count: u32,
}

impl TrendParams {
    pub fn new(config: &TrendConfig, baseline: &StratumBaseline) -> Self {
        // A degenerate SDD of zero would make k and h zero and every
        // observation an alert; floor it.
        let sdd = baseline.sdd.max(1e-6);
        TrendParams {
            baseline_mean: baseline.mean,
            sdd,
            lambda: config.ewma_lambda,
            gap: Duration::days(config.gap_days),
            k: config.cusum_k_mult * sdd,
            h: config.cusum_h_mult * sdd,
            ewma_alert_offset: config.ewma_alert_mult * sdd,
            near_band: config.near_band_mult * sdd,
            recovery_reset_count: config.recovery_reset_count,
        }
    }
}

/// Alert emitted by a detector step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrendAlert {
    /// EWMA level crossed below the alert line
    EwmaLow { level: f64, threshold: f64 },
    /// CUSUM accumulator reached the decision threshold
    CusumShift { accumulator: f64, threshold: f64 },
}

/// EWMA detector state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EwmaState {
    pub level: Option<f64>,
    pub last_observation: Option<DateTime<Utc>>,
}

/// CUSUM detector state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CusumState {
    pub acc: f64,
    pub alerting: bool,
    pub last_observation: Option<DateTime<Utc>>,
    pub near_baseline_streak: u32,
}

fn gap_exceeded(last: Option<DateTime<Utc>>, now: DateTime<Utc>, gap: Duration) -> bool {
    match last {
        Some(t) => now - t > gap,
        None => false,
    }
}

/// One EWMA update: `level = λ·x + (1−λ)·level_prev`
///
/// On a gap the level resets to the bucket baseline exactly, ignoring both
/// pre-gap history and the triggering observation; smoothing resumes on the
/// next one. A cold state seeds the recursion from the baseline mean.
pub fn ewma_step(
    prior: &EwmaState,
    obs: Observation,
    params: &TrendParams,
) -> (EwmaState, Option<TrendAlert>) {
    let level = if gap_exceeded(prior.last_observation, obs.time, params.gap) {
        params.baseline_mean
    } else {
        let prev = prior.level.unwrap_or(params.baseline_mean);
        params.lambda * obs.value + (1.0 - params.lambda) * prev
    };

    let threshold = params.baseline_mean - params.ewma_alert_offset;
    let alert = if level <= threshold {
        Some(TrendAlert::EwmaLow { level, threshold })
    } else {
        None
    };
    (EwmaState { level: Some(level), last_observation: Some(obs.time) }, alert)
}

/// One CUSUM update: `acc = max(0, acc_prev + (baseline − x) − k)`
///
/// Resets on the gap rule and after the configured count of consecutive
/// near-baseline observations (recovery reset). Alerts whenever the
/// accumulator sits at or above h.
pub fn cusum_step(
    prior: &CusumState,
    obs: Observation,
    params: &TrendParams,
) -> (CusumState, Option<TrendAlert>) {
    let (prior_acc, prior_streak) =
        if gap_exceeded(prior.last_observation, obs.time, params.gap) {
            (0.0, 0)
        } else {
            (prior.acc, prior.near_baseline_streak)
        };

    let mut acc = (prior_acc + (params.baseline_mean - obs.value) - params.k).max(0.0);

    let near = (obs.value - params.baseline_mean).abs() <= params.near_band;
    let streak = if near { prior_streak + 1 } else { 0 };
    if near && streak >= params.recovery_reset_count {
        acc = 0.0;
    }

    let alerting = acc >= params.h;
    let alert = if alerting {
        Some(TrendAlert::CusumShift { accumulator: acc, threshold: params.h })
    } else {
        None
    };
    (
        CusumState {
            acc,
            alerting,
            last_observation: Some(obs.time),
            near_baseline_streak: streak,
        },
        alert,
    )
}

/// Replay a bucket's full chronological stream through both detectors
///
/// Used after every reprocessing run: a retroactively inserted interval
/// invalidates all downstream state, so the stream is always re-run from the
/// start rather than patched incrementally. Returns the final combined state
/// and every alert with its observation time.
pub fn replay(
    state: &TrendState,
    observations: &[Observation],
    params: &TrendParams,
) -> (TrendState, Vec<(DateTime<Utc>, TrendAlert)>) {
    debug_assert!(observations.windows(2).all(|w| w[0].time <= w[1].time));

    let mut ewma = EwmaState { level: None, last_observation: None };
    let mut cusum = CusumState::default();
    let mut alerts = Vec::new();

    for &obs in observations {
        let (next_ewma, ewma_alert) = ewma_step(&ewma, obs, params);
        let (next_cusum, cusum_alert) = cusum_step(&cusum, obs, params);
        ewma = next_ewma;
        cusum = next_cusum;
        if let Some(a) = ewma_alert {
            alerts.push((obs.time, a));
        }
        if let Some(a) = cusum_alert {
            alerts.push((obs.time, a));
        }
    }

    let final_state = TrendState {
        stratum: state.stratum,
        posture: state.posture,
        ewma_level: ewma.level,
        cusum_acc: cusum.acc,
        cusum_alerting: cusum.alerting,
        last_observation: ewma.last_observation,
        near_baseline_streak: cusum.near_baseline_streak,
    };
    (final_state, alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Posture, Stratum};
    use chrono::TimeZone;

    fn t(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap() + Duration::days(day)
    }

    fn obs(day: i64, value: f64) -> Observation {
        Observation { time: t(day), value }
    }

    fn params(mean: f64, sdd: f64) -> TrendParams {
        let baseline = StratumBaseline {
            stratum: Stratum::Strength,
            posture: Posture::Standing,
            mean,
            sdd,
            count: 30,
            updated_at: Utc::now(),
        };
        TrendParams::new(&TrendConfig::default(), &baseline)
    }

    #[test]
    fn test_ewma_matches_recursive_formula_without_gap() {
        let p = params(25.0, 2.0);
        let series = [24.0, 26.0, 23.0, 27.0, 25.5];
        let mut state = EwmaState::default();
        let mut expected = p.baseline_mean;
        for (i, &x) in series.iter().enumerate() {
            let (next, _) = ewma_step(&state, obs(i as i64, x), &p);
            expected = p.lambda * x + (1.0 - p.lambda) * expected;
            assert!((next.level.unwrap() - expected).abs() < 1e-12);
            state = next;
        }
    }

    #[test]
    fn test_ewma_gap_resets_to_baseline_exactly() {
        let p = params(25.0, 2.0);
        let mut state = EwmaState::default();
        // Drive the level well away from baseline.
        for day in 0..10 {
            let (next, _) = ewma_step(&state, obs(day, 15.0), &p);
            state = next;
        }
        assert!(state.level.unwrap() < 22.0);

        // Gap beyond the threshold: level snaps to baseline, pre-gap history
        // and the triggering observation value are both ignored.
        let (after_gap, _) = ewma_step(&state, obs(10 + TrendConfig::default().gap_days + 1, 5.0), &p);
        assert_eq!(after_gap.level, Some(25.0));
    }

    #[test]
    fn test_ewma_no_reset_at_gap_threshold() {
        let p = params(25.0, 2.0);
        let (state, _) = ewma_step(&EwmaState::default(), obs(0, 20.0), &p);
        // Exactly the threshold is not "exceeds".
        let (next, _) = ewma_step(&state, obs(TrendConfig::default().gap_days, 20.0), &p);
        let expected = p.lambda * 20.0 + (1.0 - p.lambda) * state.level.unwrap();
        assert!((next.level.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_cusum_crosses_at_predicted_index() {
        // Sustained shift of 1.5·SDD below baseline: each step adds
        // shift − k = 3 − 1 = 2; h = 8, so the 4th observation fires.
        let p = params(25.0, 2.0);
        let mut state = CusumState::default();
        let mut fired_at = None;
        for day in 0..10 {
            let (next, alert) = cusum_step(&state, obs(day, 22.0), &p);
            state = next;
            if alert.is_some() && fired_at.is_none() {
                fired_at = Some(day);
            }
        }
        let predicted = (p.h / (3.0 - p.k)).ceil() as i64 - 1;
        assert_eq!(fired_at, Some(predicted));
        assert_eq!(fired_at, Some(3));
    }

    #[test]
    fn test_cusum_ignores_noise_above_slack() {
        let p = params(25.0, 2.0);
        let mut state = CusumState::default();
        // Noise within ±SDD never accumulates past h.
        for day in 0..100 {
            let x = 25.0 + if day % 2 == 0 { 1.5 } else { -1.5 };
            let (next, alert) = cusum_step(&state, obs(day, x), &p);
            assert!(alert.is_none(), "false alarm on day {}", day);
            state = next;
        }
    }

    #[test]
    fn test_cusum_recovery_reset() {
        let p = params(25.0, 2.0);
        let mut state = CusumState::default();
        // Build up a sub-threshold accumulation.
        for day in 0..3 {
            let (next, _) = cusum_step(&state, obs(day, 22.0), &p);
            state = next;
        }
        assert!(state.acc > 0.0 && state.acc < p.h);

        // Enough consecutive near-baseline observations zero it out.
        for day in 3..(3 + p.recovery_reset_count as i64) {
            let (next, _) = cusum_step(&state, obs(day, 25.2), &p);
            state = next;
        }
        assert_eq!(state.acc, 0.0);
        assert!(!state.alerting);
    }

    #[test]
    fn test_cusum_gap_reset() {
        let p = params(25.0, 2.0);
        let mut state = CusumState::default();
        for day in 0..3 {
            let (next, _) = cusum_step(&state, obs(day, 22.0), &p);
            state = next;
        }
        let acc_before = state.acc;
        assert!(acc_before > 0.0);

        let gap_day = 3 + TrendConfig::default().gap_days + 1;
        let (after_gap, _) = cusum_step(&state, obs(gap_day, 22.0), &p);
        // Accumulator restarted from zero before absorbing the observation.
        assert!((after_gap.acc - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_step_decline_scenario_cusum_fires_ewma_lags() {
        // 90 days: stationary noise, then a 10-day step of 1.5·SDD down,
        // then recovery. CUSUM must fire inside the step; EWMA trends but
        // stays above its alert line, demonstrating complementary coverage.
        let p = params(25.0, 2.0);
        let mut series = Vec::new();
        for day in 0..90i64 {
            let noise = 0.5 * ((day as f64) * 0.7).sin();
            let value = if (40..50).contains(&day) { 25.0 - 3.0 + noise } else { 25.0 + noise };
            series.push(obs(day, value));
        }

        let state = TrendState::empty(Stratum::Strength, Posture::Standing);
        let (final_state, alerts) = replay(&state, &series, &p);

        let cusum_days: Vec<i64> = alerts
            .iter()
            .filter(|(_, a)| matches!(a, TrendAlert::CusumShift { .. }))
            .map(|(time, _)| (*time - t(0)).num_days())
            .collect();
        assert!(!cusum_days.is_empty(), "CUSUM never fired");
        assert!(
            (40..50).contains(&cusum_days[0]),
            "first CUSUM alert on day {}, outside the step",
            cusum_days[0]
        );

        let ewma_alerts = alerts
            .iter()
            .filter(|(_, a)| matches!(a, TrendAlert::EwmaLow { .. }))
            .count();
        assert_eq!(ewma_alerts, 0, "EWMA should lag a 10-day step of this size");

        // After the step and the recovery reset, no residual alarm state.
        assert!(!final_state.cusum_alerting);
        assert!(final_state.ewma_level.unwrap() > 23.0);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let p = params(25.0, 2.0);
        let series: Vec<Observation> = (0..50).map(|d| obs(d, 25.0 - (d % 7) as f64 * 0.4)).collect();
        let state = TrendState::empty(Stratum::Endurance, Posture::Standing);
        let a = replay(&state, &series, &p);
        let b = replay(&state, &series, &p);
        assert_eq!(a, b);
    }
}
