//! Pipeline configuration
//!
//! Every threshold in the extraction, fitting, gating, and drift-detection
//! stages lives here rather than in code. Gate ordering and cutoffs were tuned
//! empirically on a single subject's history and continue to move; the ordered
//! gate list is data, and reordering it requires no code change.
//!
//! Configuration round-trips through TOML. The default location is
//! `<config_dir>/hrrs/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Aggregate configuration for the whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    pub extractor: ExtractorConfig,
    pub fit: FitConfig,
    pub gates: GateConfig,
    pub confidence: ConfidenceWeights,
    pub baseline: BaselineConfig,
    pub trend: TrendConfig,
}

/// Interval extraction thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// HR floor that defines sustained effort, bpm
    pub effort_floor_bpm: u16,

    /// Minimum continuous duration above the floor to qualify as effort, secs
    pub min_effort_secs: f64,

    /// Post-peak span checked for sustained decline, secs
    pub decline_check_secs: f64,

    /// Minimum net HR drop over the decline check span, bpm
    pub min_decline_bpm: f64,

    /// Length of the local-baseline median window, secs
    pub baseline_window_secs: f64,

    /// Gap between the baseline window's end and the effort onset, secs
    pub baseline_gap_secs: f64,

    /// Trailing span used for plateau detection, secs
    pub plateau_window_secs: f64,

    /// |slope| below which the recovery is considered plateaued, bpm/sec
    pub plateau_slope_bpm_s: f64,

    /// Minimum window length before a plateau may close it, secs
    pub min_plateau_at_secs: f64,

    /// HR rise above the post-peak running minimum that signals new effort, bpm
    pub re_effort_rise_bpm: f64,

    /// Hard cap on window length, secs
    pub max_window_secs: f64,

    /// Snap radius when re-locating a human-shifted peak, secs
    pub peak_snap_secs: f64,

    /// Plausible HR range; samples outside mark the session corrupt
    pub min_plausible_hr: u16,
    pub max_plausible_hr: u16,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig {
            effort_floor_bpm: 130,
            min_effort_secs: 60.0,
            decline_check_secs: 20.0,
            min_decline_bpm: 5.0,
            baseline_window_secs: 60.0,
            baseline_gap_secs: 10.0,
            plateau_window_secs: 20.0,
            plateau_slope_bpm_s: 0.05,
            min_plateau_at_secs: 45.0,
            re_effort_rise_bpm: 10.0,
            max_window_secs: 180.0,
            peak_snap_secs: 5.0,
            min_plausible_hr: 25,
            max_plausible_hr: 250,
        }
    }
}

/// Decay-fit and metric parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    /// Checkpoint offsets from the peak, secs (chronological order)
    pub checkpoint_secs: Vec<u32>,

    /// Primary checkpoint used for the weighted trend metric
    pub primary_checkpoint_secs: u32,

    /// Nearest-sample tolerance when reading a checkpoint, secs
    pub checkpoint_tolerance_secs: f64,

    /// Early-slope regression span, secs
    pub early_slope_secs: f64,

    /// AUC integration horizon, secs
    pub auc_secs: f64,

    /// Boundary between the two half-window R² spans, secs
    pub half_split_secs: f64,

    /// Upper clamp on the fitted time constant, secs. Windows truncated
    /// before steady state routinely pin tau here; the fit is then censored.
    pub tau_max_secs: f64,

    /// Lower clamp on tau, secs
    pub tau_min_secs: f64,

    /// Levenberg-Marquardt iteration cap
    pub max_iterations: usize,

    /// Relative SSE improvement below which the fit has converged
    pub convergence_tol: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            checkpoint_secs: vec![30, 60],
            primary_checkpoint_secs: 60,
            checkpoint_tolerance_secs: 3.0,
            early_slope_secs: 15.0,
            auc_secs: 60.0,
            half_split_secs: 30.0,
            tau_max_secs: 300.0,
            tau_min_secs: 5.0,
            max_iterations: 100,
            convergence_tol: 1e-9,
        }
    }
}

/// Gate identity; each maps to a stable reason/flag code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    /// Window shorter than the configured minimum
    MinWindowDuration,
    /// Secondary peak/valley inside the window
    Contamination,
    /// Re-ascending slope in the late window
    LateReascent,
    /// Either half-window R² below threshold
    HalfWindowFit,
    /// Full-window R² below threshold
    FullWindowFit,
}

impl GateKind {
    /// Stable code recorded as reject reason or advisory flag
    pub fn code(&self) -> &'static str {
        match self {
            GateKind::MinWindowDuration => "window_too_short",
            GateKind::Contamination => "contaminated",
            GateKind::LateReascent => "activity_resumed",
            GateKind::HalfWindowFit => "half_window_fit_poor",
            GateKind::FullWindowFit => "full_window_fit_poor",
        }
    }
}

/// Gate severity: hard gates reject, advisory gates flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateSeverity {
    Hard,
    Advisory,
}

/// One entry in the ordered gate sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRule {
    pub gate: GateKind,
    pub severity: GateSeverity,
}

/// Ordered gate sequence plus shared thresholds
///
/// The first hard-failing rule wins and records its code as the reject
/// reason; advisory rules append their code as a flag and evaluation
/// continues. The default order reflects current tuning, not a final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub rules: Vec<GateRule>,
    pub thresholds: GateThresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Minimum acceptable window length, secs
    pub min_window_secs: f64,

    /// HR rise above the running minimum that counts as contamination, bpm
    pub contamination_rise_bpm: f64,

    /// Late-window slope above which activity has resumed, bpm/sec
    pub late_slope_bpm_s: f64,

    /// Trailing span over which the late slope is regressed, secs
    pub late_slope_window_secs: f64,

    /// Minimum acceptable half-window R²
    pub half_r2_min: f64,

    /// Minimum acceptable full-window R²
    pub full_r2_min: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            rules: vec![
                GateRule { gate: GateKind::MinWindowDuration, severity: GateSeverity::Hard },
                GateRule { gate: GateKind::Contamination, severity: GateSeverity::Hard },
                GateRule { gate: GateKind::LateReascent, severity: GateSeverity::Hard },
                GateRule { gate: GateKind::HalfWindowFit, severity: GateSeverity::Hard },
                GateRule { gate: GateKind::FullWindowFit, severity: GateSeverity::Advisory },
            ],
            thresholds: GateThresholds {
                min_window_secs: 40.0,
                // Must stay below the extractor's re_effort_rise_bpm: a rise
                // that large ends the window instead of contaminating it.
                contamination_rise_bpm: 6.0,
                late_slope_bpm_s: 0.1,
                late_slope_window_secs: 30.0,
                half_r2_min: 0.55,
                full_r2_min: 0.70,
            },
        }
    }
}

/// Confidence score weights and normalization caps
///
/// Confidence = weighted sum of four [0,1] components, normalized by the
/// weight total. Computed for every interval, rejected ones included, so
/// downstream consumers can apply their own cutoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub effort: f64,
    pub recovery: f64,
    pub fit: f64,
    pub completeness: f64,

    /// Effort magnitude (peak − baseline) that saturates the effort
    /// component, bpm
    pub effort_cap_bpm: f64,

    /// Window length that counts as complete, secs
    pub target_window_secs: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        ConfidenceWeights {
            effort: 0.25,
            recovery: 0.25,
            fit: 0.25,
            completeness: 0.25,
            effort_cap_bpm: 60.0,
            target_window_secs: 120.0,
        }
    }
}

/// Baseline manager parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// Rolling window length in observations
    pub window: usize,

    /// Minimum observations before a bucket has a usable baseline
    pub min_observations: usize,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        BaselineConfig { window: 30, min_observations: 5 }
    }
}

/// Drift-detector parameters
///
/// k and h are expressed as SDD multiples so every bucket self-calibrates to
/// its own noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    /// EWMA smoothing factor λ
    pub ewma_lambda: f64,

    /// EWMA alert when level ≤ baseline − ewma_alert_mult·SDD
    pub ewma_alert_mult: f64,

    /// Observation gap (days) beyond which detector state resets
    pub gap_days: i64,

    /// CUSUM slack k as an SDD multiple
    pub cusum_k_mult: f64,

    /// CUSUM decision threshold h as an SDD multiple
    pub cusum_h_mult: f64,

    /// Consecutive near-baseline observations that reset the accumulator
    pub recovery_reset_count: u32,

    /// Half-width of the near-baseline band as an SDD multiple
    pub near_band_mult: f64,

    /// Minimum confidence for an interval to enter the trend stream
    pub min_confidence: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            ewma_lambda: 0.2,
            ewma_alert_mult: 2.0,
            gap_days: 14,
            cusum_k_mult: 0.5,
            cusum_h_mult: 4.0,
            recovery_reset_count: 5,
            near_band_mult: 1.0,
            min_confidence: 0.3,
        }
    }
}

impl PipelineConfig {
    /// Default config file location: `<config_dir>/hrrs/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("hrrs").join("config.toml"))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    /// Load from the given path, or from the default location, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        if let Some(p) = Self::default_path() {
            if p.exists() {
                return Self::load(&p);
            }
        }
        Ok(PipelineConfig::default())
    }

    /// Save to a TOML file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Sanity-check parameter relationships
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.trend.ewma_lambda) {
            return Err(format!("ewma_lambda must be in [0,1], got {}", self.trend.ewma_lambda));
        }
        if self.trend.cusum_h_mult <= 0.0 {
            return Err("cusum_h_mult must be positive".to_string());
        }
        if self.fit.tau_min_secs >= self.fit.tau_max_secs {
            return Err("tau_min_secs must be below tau_max_secs".to_string());
        }
        if !self.fit.checkpoint_secs.contains(&self.fit.primary_checkpoint_secs) {
            return Err(format!(
                "primary checkpoint {}s is not among the configured checkpoints",
                self.fit.primary_checkpoint_secs
            ));
        }
        let w = &self.confidence;
        if w.effort + w.recovery + w.fit + w.completeness <= 0.0 {
            return Err("confidence weights must sum to a positive value".to_string());
        }
        if self.extractor.min_plausible_hr >= self.extractor.max_plausible_hr {
            return Err("min_plausible_hr must be below max_plausible_hr".to_string());
        }
        if self.baseline.min_observations == 0 || self.baseline.window < self.baseline.min_observations {
            return Err("baseline window must cover at least min_observations".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = PipelineConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = PipelineConfig::default();
        config.trend.ewma_lambda = 0.35;
        config.save(&path).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_lambda_rejected() {
        let mut config = PipelineConfig::default();
        config.trend.ewma_lambda = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_primary_checkpoint_must_exist() {
        let mut config = PipelineConfig::default();
        config.fit.primary_checkpoint_secs = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gate_order_is_data() {
        let mut config = PipelineConfig::default();
        config.gates.rules.reverse();
        assert!(config.validate().is_ok());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.gates.rules, config.gates.rules);
    }
}
