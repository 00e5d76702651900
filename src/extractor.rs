//! Interval extraction: locating recovery windows in a session's HR stream
//!
//! A candidate peak is a local maximum preceded by a sustained-effort run (HR
//! continuously above a floor for a minimum duration) and followed by a
//! sustained decline. The recovery window runs from the peak until the first
//! of: recovery plateau, new effort onset, the configured cap, or end of data.
//! Windows closed by anything other than a plateau are censored: they ended
//! before physiological steady state.
//!
//! The local baseline is the median HR over a window ending shortly before
//! the effort onset, never the session minimum, which a single artifact
//! sample would contaminate.
//!
//! # Ordinal stability
//!
//! Ordinals are assigned 1-based by chronological order of (possibly
//! human-shifted) peaks. Extraction is deterministic, so re-running on the
//! same sample set with the same adjustments reproduces identical ordinals,
//! the property that lets annotations key on `(session_id, ordinal)` and
//! survive regeneration.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::ExtractorConfig;
use crate::error::ExtractionError;
use crate::fitter::{linear_slope, median};
use crate::models::{PeakAdjustment, Sample, Session};

/// One extracted recovery window, ready for curve fitting
///
/// `samples` holds the peak-to-window-end slice (inclusive on both ends).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedWindow {
    /// Final 1-based chronological ordinal within the session
    pub ordinal: u32,
    pub peak_time: DateTime<Utc>,
    pub peak_hr: u16,
    pub window_end: DateTime<Utc>,
    /// Median pre-effort HR, bpm
    pub local_baseline: f64,
    /// True when no usable pre-effort samples existed and the baseline fell
    /// back to the window tail
    pub baseline_fallback: bool,
    /// True when the window closed before a recovery plateau
    pub censored: bool,
    pub samples: Vec<Sample>,
}

/// Stateless extractor parameterized by configuration
pub struct Extractor<'a> {
    config: &'a ExtractorConfig,
}

/// A maximal run of consecutive samples at or above the effort floor
struct EffortRun {
    start_idx: usize,
    end_idx: usize,
}

/// Candidate prior to final ordinal assignment
struct Candidate {
    peak_idx: usize,
    onset_idx: Option<usize>,
}

impl<'a> Extractor<'a> {
    pub fn new(config: &'a ExtractorConfig) -> Self {
        Extractor { config }
    }

    /// Extract all recovery windows from one session
    ///
    /// Sessions with no sustained effort yield an empty vector, not an error.
    /// Corrupt sample sequences (non-monotonic time, implausible HR) fail the
    /// whole session so the batch can skip and report it.
    pub fn extract(
        &self,
        session: &Session,
        adjustments: &[PeakAdjustment],
    ) -> Result<Vec<ExtractedWindow>, ExtractionError> {
        self.validate_samples(session)?;
        let samples = &session.samples;

        let runs = self.effort_runs(samples);
        let mut candidates: Vec<Candidate> = Vec::new();
        for run in &runs {
            if let Some(peak_idx) = self.locate_peak(samples, run) {
                candidates.push(Candidate { peak_idx, onset_idx: Some(run.start_idx) });
            }
        }
        debug!(
            session_id = %session.id,
            runs = runs.len(),
            candidates = candidates.len(),
            "effort scan complete"
        );

        // Provisional ordinals follow detection order, which is already
        // chronological; adjustments from the prior run key on these.
        let by_ordinal: HashMap<u32, &PeakAdjustment> = adjustments
            .iter()
            .filter(|a| a.session_id == session.id)
            .map(|a| (a.ordinal, a))
            .collect();

        for (i, candidate) in candidates.iter_mut().enumerate() {
            let ordinal = (i + 1) as u32;
            if let Some(adj) = by_ordinal.get(&ordinal) {
                let shifted = samples[candidate.peak_idx].timestamp
                    + Duration::milliseconds((adj.shift_secs * 1000.0) as i64);
                candidate.peak_idx = self.snap_to_peak(samples, shifted);
                candidate.onset_idx = self.onset_before(&runs, candidate.peak_idx);
            }
        }

        // Final ordinals by chronological order of shifted peaks.
        candidates.sort_by_key(|c| samples[c.peak_idx].timestamp);
        candidates.dedup_by_key(|c| c.peak_idx);

        let mut windows = Vec::with_capacity(candidates.len());
        for (i, candidate) in candidates.iter().enumerate() {
            windows.push(self.build_window(session, candidate, (i + 1) as u32));
        }
        Ok(windows)
    }

    /// Reject sessions whose samples cannot be trusted
    fn validate_samples(&self, session: &Session) -> Result<(), ExtractionError> {
        if session.samples.is_empty() {
            return Err(ExtractionError::EmptySession { session_id: session.id.clone() });
        }
        for pair in session.samples.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(ExtractionError::CorruptSamples {
                    session_id: session.id.clone(),
                    reason: format!("non-monotonic timestamps at {}", pair[1].timestamp),
                });
            }
        }
        for s in &session.samples {
            if s.heart_rate < self.config.min_plausible_hr
                || s.heart_rate > self.config.max_plausible_hr
            {
                return Err(ExtractionError::CorruptSamples {
                    session_id: session.id.clone(),
                    reason: format!("implausible HR {} bpm at {}", s.heart_rate, s.timestamp),
                });
            }
        }
        Ok(())
    }

    /// Maximal runs at or above the effort floor lasting at least
    /// `min_effort_secs`
    fn effort_runs(&self, samples: &[Sample]) -> Vec<EffortRun> {
        let mut runs = Vec::new();
        let mut start: Option<usize> = None;
        for (i, s) in samples.iter().enumerate() {
            if s.heart_rate >= self.config.effort_floor_bpm {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(start_idx) = start.take() {
                self.push_if_long_enough(samples, start_idx, i - 1, &mut runs);
            }
        }
        if let Some(start_idx) = start {
            self.push_if_long_enough(samples, start_idx, samples.len() - 1, &mut runs);
        }
        runs
    }

    fn push_if_long_enough(
        &self,
        samples: &[Sample],
        start_idx: usize,
        end_idx: usize,
        runs: &mut Vec<EffortRun>,
    ) {
        let duration = samples[end_idx].offset_secs(samples[start_idx].timestamp);
        if duration >= self.config.min_effort_secs {
            runs.push(EffortRun { start_idx, end_idx });
        }
    }

    /// Peak of a run: the max-HR sample (last on ties), kept only if followed
    /// by a sustained decline
    fn locate_peak(&self, samples: &[Sample], run: &EffortRun) -> Option<usize> {
        let mut peak_idx = run.start_idx;
        for i in run.start_idx..=run.end_idx {
            if samples[i].heart_rate >= samples[peak_idx].heart_rate {
                peak_idx = i;
            }
        }
        if self.declines_after(samples, peak_idx) {
            Some(peak_idx)
        } else {
            None
        }
    }

    /// Sustained decline: within `decline_check_secs` after the peak no
    /// sample exceeds it and HR has dropped by at least `min_decline_bpm`
    fn declines_after(&self, samples: &[Sample], peak_idx: usize) -> bool {
        let peak = &samples[peak_idx];
        let deadline = peak.timestamp
            + Duration::milliseconds((self.config.decline_check_secs * 1000.0) as i64);
        let mut last_hr = None;
        let mut reached_deadline = false;
        for s in &samples[peak_idx + 1..] {
            if s.heart_rate > peak.heart_rate {
                return false;
            }
            last_hr = Some(s.heart_rate);
            if s.timestamp >= deadline {
                reached_deadline = true;
                break;
            }
        }
        match last_hr {
            Some(hr) if reached_deadline => {
                (peak.heart_rate as f64 - hr as f64) >= self.config.min_decline_bpm
            }
            _ => false,
        }
    }

    /// Snap a human-shifted peak time to the best nearby sample: the max-HR
    /// sample within the snap radius, or the nearest sample if none fall
    /// inside it
    fn snap_to_peak(&self, samples: &[Sample], target: DateTime<Utc>) -> usize {
        let radius = self.config.peak_snap_secs;
        let mut best_in_radius: Option<usize> = None;
        let mut nearest = 0usize;
        let mut nearest_dist = f64::MAX;
        for (i, s) in samples.iter().enumerate() {
            let dist = s.offset_secs(target).abs();
            if dist < nearest_dist {
                nearest_dist = dist;
                nearest = i;
            }
            if dist <= radius {
                let better = match best_in_radius {
                    None => true,
                    Some(b) => s.heart_rate >= samples[b].heart_rate,
                };
                if better {
                    best_in_radius = Some(i);
                }
            }
        }
        best_in_radius.unwrap_or(nearest)
    }

    /// Start of the latest effort run beginning at or before the given peak
    fn onset_before(&self, runs: &[EffortRun], peak_idx: usize) -> Option<usize> {
        runs.iter()
            .filter(|r| r.start_idx <= peak_idx)
            .last()
            .map(|r| r.start_idx)
    }

    /// Bound the recovery window and compute the local baseline
    fn build_window(&self, session: &Session, candidate: &Candidate, ordinal: u32) -> ExtractedWindow {
        let samples = &session.samples;
        let peak = samples[candidate.peak_idx];
        let cfg = self.config;

        let mut end_idx = samples.len() - 1;
        let mut censored = true;
        let mut running_min_hr = peak.heart_rate;
        let mut running_min_idx = candidate.peak_idx;

        for i in candidate.peak_idx + 1..samples.len() {
            let s = &samples[i];
            let elapsed = s.offset_secs(peak.timestamp);

            if s.heart_rate < running_min_hr {
                running_min_hr = s.heart_rate;
                running_min_idx = i;
            }

            // New effort: HR climbing back off the post-peak minimum. The
            // window closes at the minimum, not at the climb.
            if s.heart_rate as f64 >= running_min_hr as f64 + cfg.re_effort_rise_bpm {
                end_idx = running_min_idx;
                censored = true;
                break;
            }

            if elapsed >= cfg.max_window_secs {
                end_idx = i;
                censored = true;
                break;
            }

            if elapsed >= cfg.min_plateau_at_secs {
                if let Some(slope) = self.trailing_slope(samples, candidate.peak_idx, i) {
                    if slope.abs() <= cfg.plateau_slope_bpm_s {
                        end_idx = i;
                        censored = false;
                        break;
                    }
                }
            }
        }

        let (local_baseline, baseline_fallback) =
            self.local_baseline(samples, candidate, end_idx, peak.timestamp);

        ExtractedWindow {
            ordinal,
            peak_time: peak.timestamp,
            peak_hr: peak.heart_rate,
            window_end: samples[end_idx].timestamp,
            local_baseline,
            baseline_fallback,
            censored,
            samples: samples[candidate.peak_idx..=end_idx].to_vec(),
        }
    }

    /// Slope over the trailing plateau window ending at `i`
    fn trailing_slope(&self, samples: &[Sample], peak_idx: usize, i: usize) -> Option<f64> {
        let window_start =
            samples[i].timestamp - Duration::milliseconds((self.config.plateau_window_secs * 1000.0) as i64);
        let pts: Vec<&Sample> = samples[peak_idx..=i]
            .iter()
            .filter(|s| s.timestamp >= window_start)
            .collect();
        if pts.len() < 3 {
            return None;
        }
        let ts: Vec<f64> = pts.iter().map(|s| s.offset_secs(samples[peak_idx].timestamp)).collect();
        let ys: Vec<f64> = pts.iter().map(|s| s.heart_rate as f64).collect();
        linear_slope(&ts, &ys)
    }

    /// Median HR over the pre-effort baseline window; falls back to the tail
    /// of the recovery window when the session starts mid-effort
    fn local_baseline(
        &self,
        samples: &[Sample],
        candidate: &Candidate,
        end_idx: usize,
        peak_time: DateTime<Utc>,
    ) -> (f64, bool) {
        let cfg = self.config;
        let anchor = candidate
            .onset_idx
            .map(|i| samples[i].timestamp)
            .unwrap_or(peak_time);
        let window_end = anchor - Duration::milliseconds((cfg.baseline_gap_secs * 1000.0) as i64);
        let window_start =
            window_end - Duration::milliseconds((cfg.baseline_window_secs * 1000.0) as i64);

        let pre: Vec<f64> = samples
            .iter()
            .take_while(|s| s.timestamp <= window_end)
            .filter(|s| s.timestamp >= window_start)
            .map(|s| s.heart_rate as f64)
            .collect();
        if pre.len() >= 3 {
            if let Some(m) = median(&pre) {
                return (m, false);
            }
        }

        // Tail fallback: the calmest stretch we have for this interval.
        let tail_start = samples[end_idx].timestamp
            - Duration::milliseconds((cfg.plateau_window_secs * 1000.0) as i64);
        let tail: Vec<f64> = samples[candidate.peak_idx..=end_idx]
            .iter()
            .filter(|s| s.timestamp >= tail_start)
            .map(|s| s.heart_rate as f64)
            .collect();
        let value = median(&tail).unwrap_or(samples[end_idx].heart_rate as f64);
        (value, true)
    }
}
