//! Override and audit layer
//!
//! Human judgments are the only truly durable state in this pipeline: the
//! interval table is disposable and regenerated wholesale, while peak
//! adjustments, quality overrides, and validation judgments outlive every
//! extraction run and re-attach by the `(session_id, ordinal)` natural key.
//!
//! Three distinct states are deliberately kept apart: no extraction has run
//! yet, extraction ran and produced nothing, and a human asserts the
//! extractor missed something. The integrity report surfaces the third as an
//! unlinked annotation, never silently dropped.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::AnnotationError;
use crate::models::{
    JudgmentLabel, PeakAdjustment, QualityOverride, QualityStatus, ValidationJudgment,
};

/// The durable natural key joining annotations to regenerated intervals
pub type NaturalKey = (String, u32);

/// Author-side validation for a quality override
pub fn validate_override(ov: &QualityOverride) -> Result<(), AnnotationError> {
    if ov.justification.trim().is_empty() {
        return Err(AnnotationError::MissingJustification { kind: "quality override".to_string() });
    }
    match ov.forced_status {
        QualityStatus::Pass | QualityStatus::Rejected => Ok(()),
        other => Err(AnnotationError::InvalidForcedStatus { status: other.to_string() }),
    }
}

/// Author-side validation for a peak adjustment
pub fn validate_adjustment(adj: &PeakAdjustment) -> Result<(), AnnotationError> {
    if adj.justification.trim().is_empty() {
        return Err(AnnotationError::MissingJustification { kind: "peak adjustment".to_string() });
    }
    if !adj.shift_secs.is_finite() {
        return Err(AnnotationError::MissingJustification {
            kind: format!("peak adjustment shift ({})", adj.shift_secs),
        });
    }
    Ok(())
}

/// Annotations whose natural key no longer matches any current interval
///
/// Produced after every extraction run. A non-empty report is a
/// data-integrity problem for a human to resolve (usually a peak the
/// extractor no longer finds, or an ordinal renumbered by an upstream data
/// fix); the rows themselves stay in the store untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntegrityReport {
    pub unlinked_adjustments: Vec<NaturalKey>,
    pub unlinked_overrides: Vec<NaturalKey>,
    pub unlinked_judgments: Vec<NaturalKey>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.total_unlinked() == 0
    }

    pub fn total_unlinked(&self) -> usize {
        self.unlinked_adjustments.len()
            + self.unlinked_overrides.len()
            + self.unlinked_judgments.len()
    }
}

/// Compare annotation keys against the current interval key set
pub fn integrity_check(
    interval_keys: &HashSet<NaturalKey>,
    adjustments: &[PeakAdjustment],
    overrides: &[QualityOverride],
    judgments: &[ValidationJudgment],
) -> IntegrityReport {
    let missing = |session_id: &str, ordinal: u32| -> Option<NaturalKey> {
        let key = (session_id.to_string(), ordinal);
        if interval_keys.contains(&key) {
            None
        } else {
            Some(key)
        }
    };
    IntegrityReport {
        unlinked_adjustments: adjustments
            .iter()
            .filter_map(|a| missing(&a.session_id, a.ordinal))
            .collect(),
        unlinked_overrides: overrides
            .iter()
            .filter_map(|o| missing(&o.session_id, o.ordinal))
            .collect(),
        unlinked_judgments: judgments
            .iter()
            .filter_map(|j| missing(&j.session_id, j.ordinal))
            .collect(),
    }
}

/// Standing accuracy report over validation judgments
///
/// Judgments label the gate's decisions TP/FP/TN/FN; the report aggregates
/// them into precision/recall/F1. Measurement only; nothing here feeds back
/// into operational status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AccuracyReport {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl AccuracyReport {
    pub fn from_judgments(judgments: &[ValidationJudgment]) -> Self {
        let mut report = AccuracyReport::default();
        for j in judgments {
            match j.label {
                JudgmentLabel::TruePositive => report.true_positives += 1,
                JudgmentLabel::FalsePositive => report.false_positives += 1,
                JudgmentLabel::TrueNegative => report.true_negatives += 1,
                JudgmentLabel::FalseNegative => report.false_negatives += 1,
            }
        }
        report
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.true_negatives + self.false_negatives
    }

    /// TP / (TP + FP); `None` with no positive decisions
    pub fn precision(&self) -> Option<f64> {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            return None;
        }
        Some(self.true_positives as f64 / denom as f64)
    }

    /// TP / (TP + FN); `None` with no actual positives
    pub fn recall(&self) -> Option<f64> {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            return None;
        }
        Some(self.true_positives as f64 / denom as f64)
    }

    /// Harmonic mean of precision and recall
    pub fn f1(&self) -> Option<f64> {
        let p = self.precision()?;
        let r = self.recall()?;
        if p + r == 0.0 {
            return None;
        }
        Some(2.0 * p * r / (p + r))
    }
}
