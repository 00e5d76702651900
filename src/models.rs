//! Core data structures for the heart-rate-recovery (HRR) pipeline
//!
//! # Sports Science Background
//!
//! Heart-rate recovery measures how quickly HR falls after exertion stops. The
//! drop over the first 30-60 seconds is dominated by parasympathetic
//! reactivation and is a well-established marker of cardiovascular fitness:
//!
//! - **HRR60 (drop at 60s)**: the primary checkpoint metric. Typical values:
//!   - Well-trained: 25-40+ bpm
//!   - Average: 15-25 bpm
//!   - Concerning: <12 bpm
//!
//! - **Decay constant (tau)**: time constant of the exponential HR decay.
//!   Only interpretable when the recovery window reaches steady state, which
//!   in-session windows rarely do; checkpoint drops are therefore primary.
//!
//! - **Stratum**: recovery after strength intervals and after endurance work
//!   are physiologically different populations. Baselines and drift detection
//!   are always kept per stratum, never pooled.
//!
//! # Identity model
//!
//! Intervals are wholesale deleted and recreated on every extraction run, so
//! row identity is volatile. The durable identity of an interval is its
//! natural key `(session_id, ordinal)`: the 1-based chronological position of
//! its peak within the session. Human annotations key on the natural key only
//! and survive any number of reprocessing runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Training-context stratum for baseline partitioning
///
/// Each stratum carries its own rolling baseline and noise statistic; recovery
/// measurements from different strata are never mixed in one baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stratum {
    /// Resistance training with inter-set recovery windows
    Strength,
    /// Steady-state or tempo endurance work
    Endurance,
    /// Structured high-intensity interval sessions
    Intervals,
    /// Mixed-modality sessions that fit no single context
    Mixed,
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stratum::Strength => write!(f, "Strength"),
            Stratum::Endurance => write!(f, "Endurance"),
            Stratum::Intervals => write!(f, "Intervals"),
            Stratum::Mixed => write!(f, "Mixed"),
        }
    }
}

impl std::str::FromStr for Stratum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strength" => Ok(Stratum::Strength),
            "endurance" => Ok(Stratum::Endurance),
            "intervals" => Ok(Stratum::Intervals),
            "mixed" => Ok(Stratum::Mixed),
            _ => Err(format!("Unknown stratum: {}", s)),
        }
    }
}

/// Recovery posture / measurement protocol tag
///
/// Standing inter-set recovery and a dedicated supine protocol produce HR
/// curves with different autonomic meaning. Postures are bucketed separately
/// within a stratum and never share a baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Posture {
    /// Upright, typically between sets (the in-session default)
    Standing,
    Seated,
    /// Dedicated lying-down recovery protocol
    Supine,
}

impl Default for Posture {
    fn default() -> Self {
        Posture::Standing
    }
}

impl fmt::Display for Posture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Posture::Standing => write!(f, "Standing"),
            Posture::Seated => write!(f, "Seated"),
            Posture::Supine => write!(f, "Supine"),
        }
    }
}

impl std::str::FromStr for Posture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standing" => Ok(Posture::Standing),
            "seated" => Ok(Posture::Seated),
            "supine" => Ok(Posture::Supine),
            _ => Err(format!("Unknown posture: {}", s)),
        }
    }
}

/// A single immutable heart-rate reading within a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp of the reading
    pub timestamp: DateTime<Utc>,

    /// Heart rate in beats per minute
    pub heart_rate: u16,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, heart_rate: u16) -> Self {
        Sample { timestamp, heart_rate }
    }

    /// Seconds elapsed since a reference instant (negative if before it)
    pub fn offset_secs(&self, reference: DateTime<Utc>) -> f64 {
        (self.timestamp - reference).num_milliseconds() as f64 / 1000.0
    }
}

/// One monitored training bout with its ordered sample sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier (assigned by ingestion)
    pub id: String,

    /// Session start time
    pub start_time: DateTime<Utc>,

    /// Training-context stratum
    pub stratum: Stratum,

    /// Recovery posture / protocol tag
    #[serde(default)]
    pub posture: Posture,

    /// Free-form session notes
    pub notes: Option<String>,

    /// Ordered heart-rate samples
    pub samples: Vec<Sample>,
}

/// Quality gate decision for an interval
///
/// State machine: `Pending` → one of `Pass`, `Flagged`, `Rejected`, decided by
/// the ordered gate sequence in [`crate::quality`]. A human QualityOverride may
/// replace the final status; the algorithmic value is then kept for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityStatus {
    /// Not yet evaluated
    Pending,
    /// Clean interval, usable without reservation
    Pass,
    /// Usable but one or more advisory gates tripped
    Flagged,
    /// A hard gate failed; excluded from trend input
    Rejected,
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityStatus::Pending => write!(f, "Pending"),
            QualityStatus::Pass => write!(f, "Pass"),
            QualityStatus::Flagged => write!(f, "Flagged"),
            QualityStatus::Rejected => write!(f, "Rejected"),
        }
    }
}

impl std::str::FromStr for QualityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(QualityStatus::Pending),
            "pass" => Ok(QualityStatus::Pass),
            "flagged" => Ok(QualityStatus::Flagged),
            "rejected" => Ok(QualityStatus::Rejected),
            _ => Err(format!("Unknown quality status: {}", s)),
        }
    }
}

/// Checkpoint drop relative to peak and local baseline
///
/// `absolute` and `fractional` are `None` when no sample exists near the
/// checkpoint (censored window or sensor dropout) or when the fractional
/// denominator degenerates. A null is never replaced by a fabricated zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointDrop {
    /// Checkpoint offset from the peak, in seconds
    pub at_secs: u32,

    /// Peak HR minus HR at the checkpoint, in bpm
    pub absolute: Option<f64>,

    /// Absolute drop normalized by (peak − local baseline)
    pub fractional: Option<f64>,
}

/// Metrics derived for one recovery interval
///
/// Checkpoint drops, slope, and AUC are computed directly from samples and
/// survive fit non-convergence; tau and the R² family degrade to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntervalMetrics {
    /// Drops at the configured checkpoints (chronological order)
    pub checkpoints: Vec<CheckpointDrop>,

    /// Linear HR slope over the first ~15 s, bpm/sec (negative = recovering)
    pub early_slope: Option<f64>,

    /// Fitted exponential time constant in seconds
    pub tau: Option<f64>,

    /// True when tau was clamped at its upper bound (window ended before
    /// physiological steady state)
    pub tau_censored: bool,

    /// Full-window R² of the exponential fit
    pub fit_r2: Option<f64>,

    /// R² of the fit evaluated on first-half samples only
    pub first_half_r2: Option<f64>,

    /// R² of the fit evaluated on second-half samples only
    pub second_half_r2: Option<f64>,

    /// Trapezoidal area under (HR − baseline) from 0 to 60 s, bpm·sec
    pub auc_60: Option<f64>,
}

impl IntervalMetrics {
    /// Absolute drop at the given checkpoint, if measured
    pub fn drop_at(&self, at_secs: u32) -> Option<f64> {
        self.checkpoints
            .iter()
            .find(|c| c.at_secs == at_secs)
            .and_then(|c| c.absolute)
    }

    /// Fractional drop at the given checkpoint, if measured
    pub fn fractional_at(&self, at_secs: u32) -> Option<f64> {
        self.checkpoints
            .iter()
            .find(|c| c.at_secs == at_secs)
            .and_then(|c| c.fractional)
    }
}

/// One quantified recovery measurement, the unit of analysis
///
/// Recreated from scratch on every extraction run; `(session_id, ordinal)` is
/// the only durable identity. The surrogate `id` exists for storage joins and
/// must never be referenced by annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInterval {
    /// Volatile surrogate id (new UUID each extraction run)
    pub id: String,

    /// Owning session
    pub session_id: String,

    /// 1-based chronological position of the peak within the session.
    /// Stable across re-extraction on the same sample set.
    pub ordinal: u32,

    /// Time of the (possibly human-shifted) peak
    pub peak_time: DateTime<Utc>,

    /// HR at the peak, bpm
    pub peak_hr: u16,

    /// Recovery window start (the peak)
    pub window_start: DateTime<Utc>,

    /// Recovery window end (plateau, next effort, cap, or data end)
    pub window_end: DateTime<Utc>,

    /// Local pre-effort baseline HR (median, bpm)
    pub local_baseline: f64,

    /// True when the window was truncated before a recovery plateau
    pub censored_window: bool,

    /// Derived metrics
    pub metrics: IntervalMetrics,

    /// Operational quality decision (after any override)
    pub status: QualityStatus,

    /// Reason code of the first hard gate failure, if rejected
    pub reject_reason: Option<String>,

    /// Advisory flag codes accumulated by the gate sequence
    pub flags: Vec<String>,

    /// Algorithmic status prior to a human override, kept for audit
    pub pre_override_status: Option<QualityStatus>,

    /// Continuous confidence score in [0, 1]; computed for every interval
    /// including rejected ones
    pub confidence: f64,

    /// Stratum inherited from the session
    pub stratum: Stratum,

    /// Posture inherited from the session
    pub posture: Posture,
}

impl RecoveryInterval {
    /// Window duration in seconds
    pub fn window_secs(&self) -> f64 {
        (self.window_end - self.window_start).num_milliseconds() as f64 / 1000.0
    }

    /// Effort magnitude: peak minus local baseline, bpm
    pub fn effort_bpm(&self) -> f64 {
        self.peak_hr as f64 - self.local_baseline
    }
}

/// Human time-shift correction for a mislocated peak
///
/// Applied before fitting on every run, keyed by natural key. Shifts the
/// detected peak by `shift_secs` (positive = later) and recomputes baseline
/// and window around the shifted point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakAdjustment {
    pub session_id: String,
    pub ordinal: u32,

    /// Signed time shift in seconds
    pub shift_secs: f64,

    /// Why the human moved the peak
    pub justification: String,

    pub created_at: DateTime<Utc>,
}

/// Human force-pass / force-reject of an interval
///
/// Wins over the algorithmic gate decision, idempotently, on every run. The
/// algorithmic status at application time is recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOverride {
    pub session_id: String,
    pub ordinal: u32,

    /// Forced status; only `Pass` or `Rejected` are meaningful
    pub forced_status: QualityStatus,

    /// Algorithmic decision observed when the override was authored
    pub prior_status: Option<QualityStatus>,

    /// Mandatory rationale
    pub justification: String,

    pub created_at: DateTime<Utc>,
}

/// Confusion-matrix label for accuracy measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgmentLabel {
    /// Gate passed it and the human agrees it is a real, clean recovery
    TruePositive,
    /// Gate passed it but the human says it should not have
    FalsePositive,
    /// Gate rejected it and the human agrees
    TrueNegative,
    /// Gate rejected a genuine recovery
    FalseNegative,
}

impl fmt::Display for JudgmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JudgmentLabel::TruePositive => write!(f, "TP"),
            JudgmentLabel::FalsePositive => write!(f, "FP"),
            JudgmentLabel::TrueNegative => write!(f, "TN"),
            JudgmentLabel::FalseNegative => write!(f, "FN"),
        }
    }
}

impl std::str::FromStr for JudgmentLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TP" => Ok(JudgmentLabel::TruePositive),
            "FP" => Ok(JudgmentLabel::FalsePositive),
            "TN" => Ok(JudgmentLabel::TrueNegative),
            "FN" => Ok(JudgmentLabel::FalseNegative),
            _ => Err(format!("Unknown judgment label: {} (expected TP/FP/TN/FN)", s)),
        }
    }
}

/// Human accuracy label for an interval decision
///
/// Measurement only; never alters operational status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationJudgment {
    pub session_id: String,
    pub ordinal: u32,
    pub label: JudgmentLabel,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Rolling baseline statistics for one (stratum, posture) bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumBaseline {
    pub stratum: Stratum,
    pub posture: Posture,

    /// Rolling mean of the confidence-weighted metric
    pub mean: f64,

    /// SDD: median absolute difference between consecutive same-bucket
    /// measurements; the robust noise scale for detection thresholds
    pub sdd: f64,

    /// Observations contributing to the current window
    pub count: usize,

    pub updated_at: DateTime<Utc>,
}

/// Persisted drift-detector state for one (stratum, posture) bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendState {
    pub stratum: Stratum,
    pub posture: Posture,

    /// Current EWMA level; `None` before the first observation
    pub ewma_level: Option<f64>,

    /// One-sided CUSUM accumulator (downward drift)
    pub cusum_acc: f64,

    /// True while the accumulator is at or above its alert threshold
    pub cusum_alerting: bool,

    /// Time of the last observation folded in; drives gap detection
    pub last_observation: Option<DateTime<Utc>>,

    /// Consecutive near-baseline observations, for the CUSUM recovery reset
    pub near_baseline_streak: u32,
}

impl TrendState {
    /// Fresh state for a bucket with no history
    pub fn empty(stratum: Stratum, posture: Posture) -> Self {
        TrendState {
            stratum,
            posture,
            ewma_level: None,
            cusum_acc: 0.0,
            cusum_alerting: false,
            last_observation: None,
            near_baseline_streak: 0,
        }
    }
}

/// One confidence-weighted observation in a bucket's chronological stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub value: f64,
}
