//! End-to-end reprocessing and query orchestration
//!
//! Reprocessing is the only write path for intervals: extraction, fitting,
//! and gating run per session (in parallel, the stages are pure), then each
//! session's interval set is swapped atomically and every affected
//! (stratum, posture) bucket gets its baseline recomputed and its detectors
//! replayed from the start of the stream. The whole run is deterministic, so
//! reprocessing unchanged inputs reproduces identical metrics.
//!
//! Human annotations are written through here as well, after validation
//! against the current interval set.

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::annotations::{
    self, integrity_check, AccuracyReport, IntegrityReport,
};
use crate::baseline::{bucket_observations, weighted_metric, BaselineManager};
use crate::config::PipelineConfig;
use crate::error::{AnnotationError, HrrError, Result};
use crate::extractor::Extractor;
use crate::fitter::DecayFitter;
use crate::models::{
    JudgmentLabel, Observation, PeakAdjustment, Posture, QualityOverride, QualityStatus,
    RecoveryInterval, Session, StratumBaseline, Stratum, TrendState, ValidationJudgment,
};
use crate::quality::QualityGate;
use crate::store::Store;
use crate::trend::{replay, TrendAlert, TrendParams};

/// Outcome of one reprocessing run
#[derive(Debug, Clone, Default)]
pub struct ReprocessSummary {
    pub sessions_processed: usize,
    /// Sessions skipped with the reason, one entry per corrupt session
    pub sessions_skipped: Vec<(String, String)>,
    pub intervals_written: usize,
    pub buckets_updated: usize,
    /// Detector alerts across all replayed buckets
    pub alerts: Vec<BucketAlert>,
    pub integrity: IntegrityReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAlert {
    pub stratum: Stratum,
    pub posture: Posture,
    pub time: DateTime<Utc>,
    pub alert: TrendAlert,
}

/// One bucket's answer to "how is recovery trending?"
#[derive(Debug, Clone, PartialEq)]
pub struct TrendReport {
    pub stratum: Stratum,
    pub posture: Posture,
    /// Confidence-weighted series inside the requested range
    pub series: Vec<Observation>,
    pub baseline: Option<StratumBaseline>,
    pub state: Option<TrendState>,
    pub alerts: Vec<(DateTime<Utc>, TrendAlert)>,
}

impl TrendReport {
    /// Cold start: too few observations for a baseline, detectors inactive
    pub fn insufficient_data(&self) -> bool {
        self.baseline.is_none()
    }
}

pub struct HrrPipeline {
    config: PipelineConfig,
}

impl HrrPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        HrrPipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reprocess the given sessions (or every stored session)
    ///
    /// Corrupt sessions are skipped and reported without aborting the batch.
    /// The abort flag is honored between sessions: already-committed swaps
    /// stand, nothing is left half-written.
    pub fn reprocess(
        &self,
        store: &mut Store,
        session_ids: Option<&[String]>,
        abort: &AtomicBool,
        show_progress: bool,
    ) -> Result<ReprocessSummary> {
        let ids: Vec<String> = match session_ids {
            Some(ids) => ids.to_vec(),
            None => store.session_ids()?,
        };
        info!(sessions = ids.len(), "starting reprocessing run");

        // Read phase: pull each session with its durable annotations.
        let mut inputs: Vec<(Session, Vec<PeakAdjustment>, Vec<QualityOverride>)> =
            Vec::with_capacity(ids.len());
        let mut summary = ReprocessSummary::default();
        for id in &ids {
            match store.load_session(id)? {
                Some(session) => {
                    let adjustments = store.adjustments_for_session(id)?;
                    let overrides = store.overrides_for_session(id)?;
                    inputs.push((session, adjustments, overrides));
                }
                None => {
                    summary
                        .sessions_skipped
                        .push((id.clone(), "unknown session".to_string()));
                }
            }
        }

        // Compute phase: extraction through gating is pure, so sessions fan
        // out across the thread pool.
        let extractor = Extractor::new(&self.config.extractor);
        let fitter = DecayFitter::new(&self.config.fit);
        let gate = QualityGate::new(&self.config.gates, &self.config.confidence, &self.config.fit);

        let results: Vec<(String, std::result::Result<Vec<RecoveryInterval>, String>)> = inputs
            .par_iter()
            .map(|(session, adjustments, overrides)| {
                let computed = extractor.extract(session, adjustments).map(|windows| {
                    windows
                        .iter()
                        .map(|window| {
                            let metrics = fitter.metrics(window);
                            let ov = overrides.iter().find(|o| o.ordinal == window.ordinal);
                            gate.build_interval(session, window, metrics, ov)
                        })
                        .collect::<Vec<_>>()
                });
                (session.id.clone(), computed.map_err(|e| e.to_string()))
            })
            .collect();

        // Write phase: one atomic swap per session.
        let pb = if show_progress {
            let pb = ProgressBar::new(results.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} sessions")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        for (session_id, result) in results {
            if abort.load(Ordering::SeqCst) {
                warn!("abort requested, stopping before session {}", session_id);
                break;
            }
            match result {
                Ok(intervals) => {
                    store.replace_intervals(&session_id, &intervals)?;
                    debug!(session_id = %session_id, intervals = intervals.len(), "interval set replaced");
                    summary.intervals_written += intervals.len();
                    summary.sessions_processed += 1;
                }
                Err(reason) => {
                    warn!(session_id = %session_id, reason = %reason, "session skipped");
                    summary.sessions_skipped.push((session_id, reason));
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.refresh_buckets(store, &mut summary)?;

        summary.integrity = integrity_check(
            &store.interval_keys()?,
            &store.all_adjustments()?,
            &store.all_overrides()?,
            &store.all_judgments()?,
        );
        if !summary.integrity.is_clean() {
            warn!(
                unlinked = summary.integrity.total_unlinked(),
                "annotations no longer match any interval"
            );
        }

        info!(
            processed = summary.sessions_processed,
            skipped = summary.sessions_skipped.len(),
            intervals = summary.intervals_written,
            alerts = summary.alerts.len(),
            "reprocessing run complete"
        );
        Ok(summary)
    }

    /// Recompute every bucket's baseline and replay its detector stream
    ///
    /// Always runs over the complete store: a retroactive change to one
    /// session shifts everything downstream in its bucket, so incremental
    /// patching is never attempted.
    fn refresh_buckets(&self, store: &mut Store, summary: &mut ReprocessSummary) -> Result<()> {
        let intervals = store.all_intervals()?;
        let streams = bucket_observations(
            &intervals,
            &self.config.trend,
            self.config.fit.primary_checkpoint_secs,
        );
        let manager = BaselineManager::new(&self.config.baseline);

        for (bucket, observations) in &streams {
            let (stratum, posture) = *bucket;
            let Some(baseline) = manager.compute(*bucket, observations) else {
                debug!(%stratum, %posture, n = observations.len(), "bucket below baseline minimum");
                continue;
            };
            store.put_baseline(&baseline)?;

            let params = TrendParams::new(&self.config.trend, &baseline);
            let empty = TrendState::empty(stratum, posture);
            let (state, alerts) = replay(&empty, observations, &params);
            store.put_trend_state(&state)?;

            summary.buckets_updated += 1;
            summary.alerts.extend(alerts.into_iter().map(|(time, alert)| BucketAlert {
                stratum,
                posture,
                time,
                alert,
            }));
        }
        Ok(())
    }

    /// Trend query for one bucket
    ///
    /// The detectors always replay the bucket's full stream; `from`/`to`
    /// restrict only the reported series and alerts.
    pub fn query(
        &self,
        store: &Store,
        stratum: Stratum,
        posture: Posture,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<TrendReport> {
        let intervals = store.intervals_for_bucket(stratum, posture, None, None)?;
        let streams = bucket_observations(
            &intervals,
            &self.config.trend,
            self.config.fit.primary_checkpoint_secs,
        );
        let observations = streams.get(&(stratum, posture)).cloned().unwrap_or_default();

        let in_range = |t: DateTime<Utc>| {
            from.map_or(true, |f| t >= f) && to.map_or(true, |u| t <= u)
        };
        let series: Vec<Observation> =
            observations.iter().copied().filter(|o| in_range(o.time)).collect();

        let manager = BaselineManager::new(&self.config.baseline);
        let Some(baseline) = manager.compute((stratum, posture), &observations) else {
            return Ok(TrendReport {
                stratum,
                posture,
                series,
                baseline: None,
                state: None,
                alerts: Vec::new(),
            });
        };

        let params = TrendParams::new(&self.config.trend, &baseline);
        let empty = TrendState::empty(stratum, posture);
        let (state, alerts) = replay(&empty, &observations, &params);

        Ok(TrendReport {
            stratum,
            posture,
            series,
            baseline: Some(baseline),
            state: Some(state),
            alerts: alerts.into_iter().filter(|(t, _)| in_range(*t)).collect(),
        })
    }

    /// Record a peak adjustment; takes effect on the next reprocess of the
    /// session
    pub fn adjust_peak(
        &self,
        store: &mut Store,
        session_id: &str,
        ordinal: u32,
        shift_secs: f64,
        justification: &str,
    ) -> Result<PeakAdjustment> {
        let adjustment = PeakAdjustment {
            session_id: session_id.to_string(),
            ordinal,
            shift_secs,
            justification: justification.to_string(),
            created_at: Utc::now(),
        };
        annotations::validate_adjustment(&adjustment)?;
        self.require_interval(store, session_id, ordinal)?;
        store.put_adjustment(&adjustment)?;
        info!(session_id, ordinal, shift_secs, "peak adjustment recorded");
        Ok(adjustment)
    }

    /// Record a quality override and apply it to the stored interval
    /// immediately
    pub fn override_quality(
        &self,
        store: &mut Store,
        session_id: &str,
        ordinal: u32,
        forced_status: QualityStatus,
        justification: &str,
    ) -> Result<QualityOverride> {
        self.require_interval(store, session_id, ordinal)?;

        let mut intervals = store.intervals_for_session(session_id)?;
        let target = intervals
            .iter_mut()
            .find(|iv| iv.ordinal == ordinal)
            .ok_or_else(|| AnnotationError::NoSuchInterval {
                session_id: session_id.to_string(),
                ordinal,
            })?;

        let ov = QualityOverride {
            session_id: session_id.to_string(),
            ordinal,
            forced_status,
            prior_status: Some(target.pre_override_status.unwrap_or(target.status)),
            justification: justification.to_string(),
            created_at: Utc::now(),
        };
        annotations::validate_override(&ov)?;

        crate::quality::apply_override(target, &ov);
        store.put_override(&ov)?;
        store.replace_intervals(session_id, &intervals)?;
        info!(session_id, ordinal, status = %forced_status, "quality override recorded");

        // The override changes which intervals are actionable, so downstream
        // state is stale until the buckets are refreshed.
        let mut summary = ReprocessSummary::default();
        self.refresh_buckets(store, &mut summary)?;
        Ok(ov)
    }

    /// Record a validation judgment against an existing interval
    pub fn judge(
        &self,
        store: &mut Store,
        session_id: &str,
        ordinal: u32,
        label: JudgmentLabel,
        notes: Option<&str>,
    ) -> Result<ValidationJudgment> {
        self.require_interval(store, session_id, ordinal)?;
        let judgment = ValidationJudgment {
            session_id: session_id.to_string(),
            ordinal,
            label,
            notes: notes.map(|s| s.to_string()),
            created_at: Utc::now(),
        };
        store.put_judgment(&judgment)?;
        info!(session_id, ordinal, label = %label, "validation judgment recorded");
        Ok(judgment)
    }

    /// Standing gate-accuracy report over all judgments
    pub fn accuracy(&self, store: &Store) -> Result<AccuracyReport> {
        Ok(AccuracyReport::from_judgments(&store.all_judgments()?))
    }

    /// Compare all annotations against the current interval key set
    pub fn integrity(&self, store: &Store) -> Result<IntegrityReport> {
        Ok(integrity_check(
            &store.interval_keys()?,
            &store.all_adjustments()?,
            &store.all_overrides()?,
            &store.all_judgments()?,
        ))
    }

    /// Confidence-weighted metric for one interval, as charted by queries
    pub fn weighted_value(&self, interval: &RecoveryInterval) -> Option<f64> {
        weighted_metric(interval, self.config.fit.primary_checkpoint_secs)
    }

    fn require_interval(&self, store: &Store, session_id: &str, ordinal: u32) -> Result<()> {
        if store.interval_exists(session_id, ordinal)? {
            Ok(())
        } else {
            Err(HrrError::Annotation(AnnotationError::NoSuchInterval {
                session_id: session_id.to_string(),
                ordinal,
            }))
        }
    }
}
