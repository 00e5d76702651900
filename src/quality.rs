//! Quality gate, confidence scoring, and override application
//!
//! The gate is a deterministic function of an ordered, priority-ranked rule
//! sequence from configuration: the first hard-failing rule rejects the
//! interval and records its reason code; advisory rules append a flag and
//! evaluation continues. An interval with only advisory flags is `Flagged`,
//! one with none is `Pass`.
//!
//! Confidence is a continuous [0,1] score computed for every interval,
//! rejected ones included, so downstream consumers can apply their own
//! cutoff instead of inheriting the gate's.
//!
//! A human QualityOverride always wins over the gate. It is applied after
//! scoring, idempotently, on every run including the very first, and the
//! algorithmic decision it displaced is kept for audit.

use uuid::Uuid;

use crate::config::{ConfidenceWeights, FitConfig, GateConfig, GateKind, GateSeverity};
use crate::extractor::ExtractedWindow;
use crate::fitter::linear_slope;
use crate::models::{
    IntervalMetrics, QualityOverride, QualityStatus, RecoveryInterval, Session,
};

/// Advisory flag recorded when R² gates cannot run because the fit failed
pub const FLAG_FIT_UNCONVERGED: &str = "fit_unconverged";

/// Advisory flag recorded when the local baseline fell back to the window tail
pub const FLAG_BASELINE_FALLBACK: &str = "baseline_fallback";

/// Outcome of the gate sequence, before any human override
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub status: QualityStatus,
    pub reject_reason: Option<String>,
    pub flags: Vec<String>,
}

/// Gate evaluator and confidence scorer
pub struct QualityGate<'a> {
    gates: &'a GateConfig,
    weights: &'a ConfidenceWeights,
    fit: &'a FitConfig,
}

impl<'a> QualityGate<'a> {
    pub fn new(gates: &'a GateConfig, weights: &'a ConfidenceWeights, fit: &'a FitConfig) -> Self {
        QualityGate { gates, weights, fit }
    }

    /// Run the ordered gate sequence
    pub fn assess(&self, window: &ExtractedWindow, metrics: &IntervalMetrics) -> Assessment {
        let mut flags: Vec<String> = Vec::new();
        if window.baseline_fallback {
            flags.push(FLAG_BASELINE_FALLBACK.to_string());
        }

        for rule in &self.gates.rules {
            let tripped = match self.check(rule.gate, window, metrics) {
                Some(t) => t,
                None => {
                    // Gate not evaluable (fit unavailable): note it once,
                    // never hard-fail on a missing number.
                    if !flags.iter().any(|f| f == FLAG_FIT_UNCONVERGED) {
                        flags.push(FLAG_FIT_UNCONVERGED.to_string());
                    }
                    continue;
                }
            };
            if !tripped {
                continue;
            }
            match rule.severity {
                GateSeverity::Hard => {
                    return Assessment {
                        status: QualityStatus::Rejected,
                        reject_reason: Some(rule.gate.code().to_string()),
                        flags,
                    };
                }
                GateSeverity::Advisory => {
                    flags.push(rule.gate.code().to_string());
                }
            }
        }

        let status = if flags.is_empty() { QualityStatus::Pass } else { QualityStatus::Flagged };
        Assessment { status, reject_reason: None, flags }
    }

    /// Evaluate one gate; `None` when the inputs it needs are unavailable
    fn check(&self, gate: GateKind, window: &ExtractedWindow, metrics: &IntervalMetrics) -> Option<bool> {
        let t = &self.gates.thresholds;
        match gate {
            GateKind::MinWindowDuration => {
                let secs = window
                    .samples
                    .last()
                    .map(|s| s.offset_secs(window.peak_time))
                    .unwrap_or(0.0);
                Some(secs < t.min_window_secs)
            }
            GateKind::Contamination => Some(self.has_secondary_peak(window)),
            GateKind::LateReascent => self.late_slope(window).map(|s| s >= t.late_slope_bpm_s),
            GateKind::HalfWindowFit => match (metrics.first_half_r2, metrics.second_half_r2) {
                (Some(a), Some(b)) => Some(a < t.half_r2_min || b < t.half_r2_min),
                _ => None,
            },
            GateKind::FullWindowFit => metrics.fit_r2.map(|r2| r2 < t.full_r2_min),
        }
    }

    /// Secondary peak: HR climbing back above the running minimum by more
    /// than the contamination threshold anywhere inside the window
    fn has_secondary_peak(&self, window: &ExtractedWindow) -> bool {
        let rise = self.gates.thresholds.contamination_rise_bpm;
        let mut running_min = f64::MAX;
        for s in &window.samples {
            let hr = s.heart_rate as f64;
            if hr < running_min {
                running_min = hr;
            } else if hr - running_min >= rise {
                return true;
            }
        }
        false
    }

    /// Slope over the trailing late-window span
    fn late_slope(&self, window: &ExtractedWindow) -> Option<f64> {
        let span = self.gates.thresholds.late_slope_window_secs;
        let end = window.samples.last()?.offset_secs(window.peak_time);
        let start = end - span;
        let mut ts = Vec::new();
        let mut ys = Vec::new();
        for s in &window.samples {
            let t = s.offset_secs(window.peak_time);
            if t >= start {
                ts.push(t);
                ys.push(s.heart_rate as f64);
            }
        }
        if ts.len() < 3 {
            return None;
        }
        linear_slope(&ts, &ys)
    }

    /// Continuous confidence score in [0, 1]
    ///
    /// Weighted sum of: effort magnitude (capped), normalized recovery
    /// quality, clamped full-window fit quality, and linear window
    /// completeness. Monotone non-decreasing in fit R² and in completeness.
    pub fn confidence(&self, window: &ExtractedWindow, metrics: &IntervalMetrics) -> f64 {
        let w = self.weights;
        let effort = ((window.peak_hr as f64 - window.local_baseline) / w.effort_cap_bpm)
            .clamp(0.0, 1.0);

        let recovery = metrics
            .fractional_at(self.fit.primary_checkpoint_secs)
            .or_else(|| {
                metrics
                    .checkpoints
                    .iter()
                    .rev()
                    .find_map(|c| c.fractional)
            })
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        let fit = metrics.fit_r2.unwrap_or(0.0).clamp(0.0, 1.0);

        let window_secs = window
            .samples
            .last()
            .map(|s| s.offset_secs(window.peak_time))
            .unwrap_or(0.0);
        let completeness = (window_secs / w.target_window_secs).clamp(0.0, 1.0);

        let total = w.effort + w.recovery + w.fit + w.completeness;
        (w.effort * effort + w.recovery * recovery + w.fit * fit + w.completeness * completeness)
            / total
    }

    /// Assemble the final interval for one window, applying any override
    pub fn build_interval(
        &self,
        session: &Session,
        window: &ExtractedWindow,
        metrics: IntervalMetrics,
        override_row: Option<&QualityOverride>,
    ) -> RecoveryInterval {
        let assessment = self.assess(window, &metrics);
        let confidence = self.confidence(window, &metrics);

        let mut interval = RecoveryInterval {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            ordinal: window.ordinal,
            peak_time: window.peak_time,
            peak_hr: window.peak_hr,
            window_start: window.peak_time,
            window_end: window.window_end,
            local_baseline: window.local_baseline,
            censored_window: window.censored,
            metrics,
            status: assessment.status,
            reject_reason: assessment.reject_reason,
            flags: assessment.flags,
            pre_override_status: None,
            confidence,
            stratum: session.stratum,
            posture: session.posture,
        };
        if let Some(ov) = override_row {
            apply_override(&mut interval, ov);
        }
        interval
    }
}

/// Replace the gate's decision with the human's, keeping the algorithmic
/// value for audit
///
/// Idempotent: applying the same override twice leaves the interval
/// unchanged, and the recorded pre-override status is always the gate's own
/// decision, never a previously overridden one.
pub fn apply_override(interval: &mut RecoveryInterval, ov: &QualityOverride) {
    if interval.pre_override_status.is_none() {
        interval.pre_override_status = Some(interval.status);
    }
    interval.status = ov.forced_status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fitter::DecayFitter;
    use crate::models::{Posture, Sample, Stratum};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn peak_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn window_from_fn(
        len_secs: usize,
        baseline: f64,
        censored: bool,
        hr: impl Fn(f64) -> f64,
    ) -> ExtractedWindow {
        let samples: Vec<Sample> = (0..=len_secs)
            .map(|i| Sample::new(peak_time() + Duration::seconds(i as i64), hr(i as f64).round() as u16))
            .collect();
        ExtractedWindow {
            ordinal: 1,
            peak_time: peak_time(),
            peak_hr: samples[0].heart_rate,
            window_end: samples.last().unwrap().timestamp,
            local_baseline: baseline,
            baseline_fallback: false,
            censored,
            samples,
        }
    }

    fn test_session() -> Session {
        Session {
            id: "s1".to_string(),
            start_time: peak_time() - Duration::seconds(600),
            stratum: Stratum::Strength,
            posture: Posture::Standing,
            notes: None,
            samples: Vec::new(),
        }
    }

    /// Clean recovery: peak 165, baseline 95, HRR60 = 28 bpm, window 180s
    fn clean_window() -> ExtractedWindow {
        // tau chosen so hr(60) = 95 + 70·0.6 = 137 exactly (drop of 28)
        let tau = 60.0 / (0.6f64.ln().abs());
        window_from_fn(180, 95.0, true, move |t| 95.0 + 70.0 * (-t / tau).exp())
    }

    fn gate_for(config: &PipelineConfig) -> QualityGate<'_> {
        QualityGate::new(&config.gates, &config.confidence, &config.fit)
    }

    #[test]
    fn test_clean_interval_passes_with_high_confidence() {
        let config = PipelineConfig::default();
        let window = clean_window();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let gate = gate_for(&config);

        let assessment = gate.assess(&window, &metrics);
        assert_eq!(assessment.status, QualityStatus::Pass);
        assert!(assessment.flags.is_empty());

        let confidence = gate.confidence(&window, &metrics);
        assert!(confidence > 0.8, "confidence = {}", confidence);

        // The weighted trend metric is drop60 × confidence.
        let d60 = metrics.drop_at(60).unwrap();
        assert!((d60 - 28.0).abs() < 0.5, "d60 = {}", d60);
        let weighted = d60 * confidence;
        assert!((weighted - 28.0 * confidence).abs() < 1e-9);
    }

    #[test]
    fn test_late_reascent_rejects_despite_good_fit() {
        // Clean tau=40 decay for 90s, then +0.15 bpm/s climbing to 120s.
        let window = window_from_fn(120, 95.0, true, |t| {
            if t <= 90.0 {
                95.0 + 70.0 * (-t / 40.0).exp()
            } else {
                95.0 + 70.0 * (-90.0f64 / 40.0).exp() + 0.15 * (t - 90.0)
            }
        });
        let config = PipelineConfig::default();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let gate = gate_for(&config);

        let assessment = gate.assess(&window, &metrics);
        assert_eq!(assessment.status, QualityStatus::Rejected);
        assert_eq!(assessment.reject_reason.as_deref(), Some("activity_resumed"));
    }

    #[test]
    fn test_short_window_rejected_first() {
        let window = window_from_fn(25, 95.0, true, |t| 95.0 + 70.0 * (-t / 40.0).exp());
        let config = PipelineConfig::default();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let assessment = gate_for(&config).assess(&window, &metrics);
        assert_eq!(assessment.status, QualityStatus::Rejected);
        assert_eq!(assessment.reject_reason.as_deref(), Some("window_too_short"));
    }

    #[test]
    fn test_contamination_detected() {
        // A 7 bpm bump at 60-70s inside an otherwise clean decay.
        let window = window_from_fn(120, 95.0, true, |t| {
            let base = 95.0 + 70.0 * (-t / 40.0).exp();
            if (60.0..70.0).contains(&t) {
                base + 7.0
            } else {
                base
            }
        });
        let config = PipelineConfig::default();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let assessment = gate_for(&config).assess(&window, &metrics);
        assert_eq!(assessment.status, QualityStatus::Rejected);
        assert_eq!(assessment.reject_reason.as_deref(), Some("contaminated"));
    }

    #[test]
    fn test_advisory_gate_flags_without_rejecting() {
        let config = {
            let mut c = PipelineConfig::default();
            // Make the full-window gate trip on a clean curve.
            c.gates.thresholds.full_r2_min = 1.01;
            c
        };
        let window = clean_window();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let assessment = gate_for(&config).assess(&window, &metrics);
        assert_eq!(assessment.status, QualityStatus::Flagged);
        assert!(assessment.flags.iter().any(|f| f == "full_window_fit_poor"));
        assert!(assessment.reject_reason.is_none());
    }

    #[test]
    fn test_confidence_computed_for_rejected_interval() {
        let window = window_from_fn(25, 95.0, true, |t| 95.0 + 70.0 * (-t / 40.0).exp());
        let config = PipelineConfig::default();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let gate = gate_for(&config);
        let interval = gate.build_interval(&test_session(), &window, metrics, None);
        assert_eq!(interval.status, QualityStatus::Rejected);
        assert!(interval.confidence > 0.0 && interval.confidence < 1.0);
    }

    #[test]
    fn test_confidence_monotone_in_completeness() {
        let config = PipelineConfig::default();
        let gate = gate_for(&config);
        let mut last = -1.0;
        for len in [40usize, 60, 90, 120, 150] {
            let window = window_from_fn(len, 95.0, true, |t| 95.0 + 70.0 * (-t / 40.0).exp());
            let mut metrics = DecayFitter::new(&config.fit).metrics(&window);
            // Hold everything except completeness fixed.
            metrics.fit_r2 = Some(0.9);
            metrics.checkpoints.clear();
            let c = gate.confidence(&window, &metrics);
            assert!(c >= last, "confidence fell from {} to {} at {}s", last, c, len);
            last = c;
        }
    }

    #[test]
    fn test_override_wins_and_is_idempotent() {
        let config = PipelineConfig::default();
        let window = clean_window();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);
        let gate = gate_for(&config);

        let ov = QualityOverride {
            session_id: "s1".to_string(),
            ordinal: 1,
            forced_status: QualityStatus::Rejected,
            prior_status: None,
            justification: "athlete reported sensor slip".to_string(),
            created_at: Utc::now(),
        };
        let mut interval = gate.build_interval(&test_session(), &window, metrics, Some(&ov));
        assert_eq!(interval.status, QualityStatus::Rejected);
        assert_eq!(interval.pre_override_status, Some(QualityStatus::Pass));

        // Applying again changes nothing, audit trail included.
        apply_override(&mut interval, &ov);
        assert_eq!(interval.status, QualityStatus::Rejected);
        assert_eq!(interval.pre_override_status, Some(QualityStatus::Pass));
    }

    #[test]
    fn test_reordered_gates_change_the_recorded_reason() {
        // A window that is both too short and re-ascending: whichever hard
        // gate runs first wins.
        let window = window_from_fn(30, 95.0, true, |t| 110.0 + 0.2 * t);
        let mut config = PipelineConfig::default();
        let metrics = DecayFitter::new(&config.fit).metrics(&window);

        let first = gate_for(&config).assess(&window, &metrics);
        assert_eq!(first.reject_reason.as_deref(), Some("window_too_short"));

        config.gates.rules.reverse();
        let second = gate_for(&config).assess(&window, &metrics);
        assert_eq!(second.status, QualityStatus::Rejected);
        assert_ne!(second.reject_reason, first.reject_reason);
    }
}

#[cfg(test)]
mod confidence_properties {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::models::{CheckpointDrop, Sample};
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn fixed_window(len_secs: usize) -> ExtractedWindow {
        let peak_time = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let samples: Vec<Sample> = (0..=len_secs)
            .map(|i| Sample::new(peak_time + Duration::seconds(i as i64), 140))
            .collect();
        ExtractedWindow {
            ordinal: 1,
            peak_time,
            peak_hr: 165,
            window_end: samples.last().unwrap().timestamp,
            local_baseline: 95.0,
            baseline_fallback: false,
            censored: true,
            samples,
        }
    }

    fn metrics_with_r2(r2: f64) -> IntervalMetrics {
        IntervalMetrics {
            checkpoints: vec![CheckpointDrop { at_secs: 60, absolute: Some(25.0), fractional: Some(0.36) }],
            fit_r2: Some(r2),
            ..Default::default()
        }
    }

    proptest! {
        /// Increasing full-window R², all else equal, never decreases
        /// confidence.
        #[test]
        fn confidence_monotone_in_fit_r2(a in 0.0f64..1.0, b in 0.0f64..1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let config = PipelineConfig::default();
            let gate = QualityGate::new(&config.gates, &config.confidence, &config.fit);
            let window = fixed_window(120);
            let c_lo = gate.confidence(&window, &metrics_with_r2(lo));
            let c_hi = gate.confidence(&window, &metrics_with_r2(hi));
            prop_assert!(c_hi >= c_lo - 1e-12);
        }

        /// Longer windows (more completeness) never decrease confidence.
        #[test]
        fn confidence_monotone_in_window_length(a in 10usize..200, b in 10usize..200) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let config = PipelineConfig::default();
            let gate = QualityGate::new(&config.gates, &config.confidence, &config.fit);
            let metrics = metrics_with_r2(0.8);
            let c_lo = gate.confidence(&fixed_window(lo), &metrics);
            let c_hi = gate.confidence(&fixed_window(hi), &metrics);
            prop_assert!(c_hi >= c_lo - 1e-12);
        }
    }
}
