//! SQLite persistence for sessions, intervals, annotations, and trend state
//!
//! The interval table follows a delete-then-recreate contract per session:
//! both halves of the swap happen inside one transaction, so downstream
//! readers see either the old complete set or the new complete set, never a
//! mix. Intervals carry a surrogate id for joins but are uniquely
//! addressable by `(session_id, ordinal)`, the natural key enforced here
//! with a unique index and honored by every annotation table.
//!
//! Sessions and samples are the read-side adapter for the external sample
//! store; the pipeline itself treats them as read-only.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use crate::annotations::NaturalKey;
use crate::error::StoreError;
use crate::models::{
    IntervalMetrics, JudgmentLabel, PeakAdjustment, Posture, QualityOverride, QualityStatus,
    RecoveryInterval, Sample, Session, StratumBaseline, Stratum, TrendState, ValidationJudgment,
};

/// Database connection and schema management
pub struct Store {
    conn: Connection,
}

/// Store-wide counts for the status report
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub session_count: usize,
    pub interval_count: usize,
    pub adjustment_count: usize,
    pub override_count: usize,
    pub judgment_count: usize,
}

impl Store {
    /// Create or open a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                start_time TEXT NOT NULL,
                stratum TEXT NOT NULL,
                posture TEXT NOT NULL,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS samples (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                heart_rate INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY (session_id) REFERENCES sessions (id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS intervals (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                peak_time TEXT NOT NULL,
                peak_hr INTEGER NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                local_baseline REAL NOT NULL,
                censored_window INTEGER NOT NULL,
                metrics TEXT NOT NULL,
                status TEXT NOT NULL,
                reject_reason TEXT,
                flags TEXT NOT NULL,
                pre_override_status TEXT,
                confidence REAL NOT NULL,
                stratum TEXT NOT NULL,
                posture TEXT NOT NULL,
                UNIQUE (session_id, ordinal)
            );

            CREATE INDEX IF NOT EXISTS idx_intervals_peak_time ON intervals (peak_time);
            CREATE INDEX IF NOT EXISTS idx_intervals_bucket ON intervals (stratum, posture);

            CREATE TABLE IF NOT EXISTS peak_adjustments (
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                shift_secs REAL NOT NULL,
                justification TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS quality_overrides (
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                forced_status TEXT NOT NULL,
                prior_status TEXT,
                justification TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS validation_judgments (
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                label TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, ordinal)
            );

            CREATE TABLE IF NOT EXISTS stratum_baselines (
                stratum TEXT NOT NULL,
                posture TEXT NOT NULL,
                mean REAL NOT NULL,
                sdd REAL NOT NULL,
                count INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (stratum, posture)
            );

            CREATE TABLE IF NOT EXISTS trend_states (
                stratum TEXT NOT NULL,
                posture TEXT NOT NULL,
                ewma_level REAL,
                cusum_acc REAL NOT NULL,
                cusum_alerting INTEGER NOT NULL,
                last_observation TEXT,
                near_baseline_streak INTEGER NOT NULL,
                PRIMARY KEY (stratum, posture)
            );
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sessions and samples (ingest boundary; read-only to the pipeline)
    // ------------------------------------------------------------------

    /// Store a session with its full sample sequence, replacing any prior
    /// version atomically
    pub fn put_session(&mut self, session: &Session) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO sessions (id, start_time, stratum, posture, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.start_time,
                session.stratum.to_string(),
                session.posture.to_string(),
                session.notes,
            ],
        )?;
        tx.execute("DELETE FROM samples WHERE session_id = ?1", params![session.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO samples (session_id, seq, timestamp, heart_rate)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (seq, s) in session.samples.iter().enumerate() {
                stmt.execute(params![session.id, seq as i64, s.timestamp, s.heart_rate])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All session ids, ordered by start time
    pub fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM sessions ORDER BY start_time, id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Load one session with its ordered samples
    pub fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let header = self
            .conn
            .query_row(
                "SELECT id, start_time, stratum, posture, notes FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, start_time, stratum, posture, notes)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT timestamp, heart_rate FROM samples WHERE session_id = ?1 ORDER BY seq",
        )?;
        let samples = stmt
            .query_map(params![id], |row| {
                Ok(Sample {
                    timestamp: row.get::<_, DateTime<Utc>>(0)?,
                    heart_rate: row.get::<_, u16>(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Session {
            id,
            start_time,
            stratum: parse_enum::<Stratum>(&stratum)?,
            posture: parse_enum::<Posture>(&posture)?,
            notes,
            samples,
        }))
    }

    // ------------------------------------------------------------------
    // Intervals: delete-then-insert per session, transactional
    // ------------------------------------------------------------------

    /// Replace a session's interval set atomically
    pub fn replace_intervals(
        &mut self,
        session_id: &str,
        intervals: &[RecoveryInterval],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM intervals WHERE session_id = ?1", params![session_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO intervals (
                    id, session_id, ordinal, peak_time, peak_hr, window_start, window_end,
                    local_baseline, censored_window, metrics, status, reject_reason, flags,
                    pre_override_status, confidence, stratum, posture
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;
            for iv in intervals {
                let metrics = serde_json::to_string(&iv.metrics)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let flags = serde_json::to_string(&iv.flags)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                stmt.execute(params![
                    iv.id,
                    iv.session_id,
                    iv.ordinal,
                    iv.peak_time,
                    iv.peak_hr,
                    iv.window_start,
                    iv.window_end,
                    iv.local_baseline,
                    iv.censored_window,
                    metrics,
                    iv.status.to_string(),
                    iv.reject_reason,
                    flags,
                    iv.pre_override_status.map(|s| s.to_string()),
                    iv.confidence,
                    iv.stratum.to_string(),
                    iv.posture.to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Intervals for one session, by ordinal
    pub fn intervals_for_session(&self, session_id: &str) -> Result<Vec<RecoveryInterval>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE session_id = ?1 ORDER BY ordinal",
            SELECT_INTERVAL
        ))?;
        let rows = stmt
            .query_map(params![session_id], interval_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every interval in chronological peak order
    pub fn all_intervals(&self) -> Result<Vec<RecoveryInterval>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY peak_time, session_id, ordinal", SELECT_INTERVAL))?;
        let rows = stmt
            .query_map([], interval_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Chronological intervals for one bucket within a date range
    pub fn intervals_for_bucket(
        &self,
        stratum: Stratum,
        posture: Posture,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<RecoveryInterval>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE stratum = ?1 AND posture = ?2
               AND (?3 IS NULL OR peak_time >= ?3)
               AND (?4 IS NULL OR peak_time <= ?4)
             ORDER BY peak_time, session_id, ordinal",
            SELECT_INTERVAL
        ))?;
        let rows = stmt
            .query_map(
                params![stratum.to_string(), posture.to_string(), from, to],
                interval_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Current natural-key set, for integrity checks and authoring
    /// validation
    pub fn interval_keys(&self) -> Result<HashSet<NaturalKey>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT session_id, ordinal FROM intervals")?;
        let keys = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    pub fn interval_exists(&self, session_id: &str, ordinal: u32) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM intervals WHERE session_id = ?1 AND ordinal = ?2",
            params![session_id, ordinal],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Annotations: keyed solely by (session_id, ordinal), never deleted by
    // reprocessing
    // ------------------------------------------------------------------

    pub fn put_adjustment(&mut self, adj: &PeakAdjustment) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO peak_adjustments
             (session_id, ordinal, shift_secs, justification, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![adj.session_id, adj.ordinal, adj.shift_secs, adj.justification, adj.created_at],
        )?;
        Ok(())
    }

    pub fn adjustments_for_session(&self, session_id: &str) -> Result<Vec<PeakAdjustment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, ordinal, shift_secs, justification, created_at
             FROM peak_adjustments WHERE session_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map(params![session_id], adjustment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_adjustments(&self) -> Result<Vec<PeakAdjustment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, ordinal, shift_secs, justification, created_at
             FROM peak_adjustments ORDER BY session_id, ordinal",
        )?;
        let rows = stmt
            .query_map([], adjustment_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn put_override(&mut self, ov: &QualityOverride) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO quality_overrides
             (session_id, ordinal, forced_status, prior_status, justification, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ov.session_id,
                ov.ordinal,
                ov.forced_status.to_string(),
                ov.prior_status.map(|s| s.to_string()),
                ov.justification,
                ov.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn overrides_for_session(&self, session_id: &str) -> Result<Vec<QualityOverride>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, ordinal, forced_status, prior_status, justification, created_at
             FROM quality_overrides WHERE session_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt
            .query_map(params![session_id], override_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_overrides(&self) -> Result<Vec<QualityOverride>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, ordinal, forced_status, prior_status, justification, created_at
             FROM quality_overrides ORDER BY session_id, ordinal",
        )?;
        let rows = stmt
            .query_map([], override_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn put_judgment(&mut self, j: &ValidationJudgment) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO validation_judgments
             (session_id, ordinal, label, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![j.session_id, j.ordinal, j.label.to_string(), j.notes, j.created_at],
        )?;
        Ok(())
    }

    pub fn all_judgments(&self) -> Result<Vec<ValidationJudgment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, ordinal, label, notes, created_at
             FROM validation_judgments ORDER BY session_id, ordinal",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, DateTime<Utc>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(session_id, ordinal, label, notes, created_at)| {
                Ok(ValidationJudgment {
                    session_id,
                    ordinal,
                    label: parse_enum::<JudgmentLabel>(&label)?,
                    notes,
                    created_at,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Baseline and trend snapshots, one current row per bucket
    // ------------------------------------------------------------------

    pub fn put_baseline(&mut self, b: &StratumBaseline) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO stratum_baselines
             (stratum, posture, mean, sdd, count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                b.stratum.to_string(),
                b.posture.to_string(),
                b.mean,
                b.sdd,
                b.count as i64,
                b.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_baseline(
        &self,
        stratum: Stratum,
        posture: Posture,
    ) -> Result<Option<StratumBaseline>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT mean, sdd, count, updated_at FROM stratum_baselines
                 WHERE stratum = ?1 AND posture = ?2",
                params![stratum.to_string(), posture.to_string()],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(mean, sdd, count, updated_at)| StratumBaseline {
            stratum,
            posture,
            mean,
            sdd,
            count: count as usize,
            updated_at,
        }))
    }

    pub fn put_trend_state(&mut self, s: &TrendState) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO trend_states
             (stratum, posture, ewma_level, cusum_acc, cusum_alerting, last_observation, near_baseline_streak)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                s.stratum.to_string(),
                s.posture.to_string(),
                s.ewma_level,
                s.cusum_acc,
                s.cusum_alerting,
                s.last_observation,
                s.near_baseline_streak,
            ],
        )?;
        Ok(())
    }

    pub fn load_trend_state(
        &self,
        stratum: Stratum,
        posture: Posture,
    ) -> Result<Option<TrendState>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT ewma_level, cusum_acc, cusum_alerting, last_observation, near_baseline_streak
                 FROM trend_states WHERE stratum = ?1 AND posture = ?2",
                params![stratum.to_string(), posture.to_string()],
                |row| {
                    Ok(TrendState {
                        stratum,
                        posture,
                        ewma_level: row.get(0)?,
                        cusum_acc: row.get(1)?,
                        cusum_alerting: row.get(2)?,
                        last_observation: row.get(3)?,
                        near_baseline_streak: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Store-wide counts for the status report
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let count = |table: &str| -> Result<usize, StoreError> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoreStats {
            session_count: count("sessions")?,
            interval_count: count("intervals")?,
            adjustment_count: count("peak_adjustments")?,
            override_count: count("quality_overrides")?,
            judgment_count: count("validation_judgments")?,
        })
    }
}

const SELECT_INTERVAL: &str = "SELECT
    id, session_id, ordinal, peak_time, peak_hr, window_start, window_end,
    local_baseline, censored_window, metrics, status, reject_reason, flags,
    pre_override_status, confidence, stratum, posture
 FROM intervals";

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, StoreError> {
    s.parse::<T>().map_err(StoreError::Serialization)
}

fn interval_from_row(row: &Row) -> rusqlite::Result<RecoveryInterval> {
    let metrics_json: String = row.get("metrics")?;
    let metrics: IntervalMetrics = serde_json::from_str(&metrics_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e)))?;
    let flags_json: String = row.get("flags")?;
    let flags: Vec<String> = serde_json::from_str(&flags_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e)))?;

    let status: String = row.get("status")?;
    let stratum: String = row.get("stratum")?;
    let posture: String = row.get("posture")?;
    let pre_override: Option<String> = row.get("pre_override_status")?;

    let parse = |s: &str| -> rusqlite::Result<QualityStatus> {
        s.parse::<QualityStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, e.into())
        })
    };

    Ok(RecoveryInterval {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        ordinal: row.get("ordinal")?,
        peak_time: row.get("peak_time")?,
        peak_hr: row.get("peak_hr")?,
        window_start: row.get("window_start")?,
        window_end: row.get("window_end")?,
        local_baseline: row.get("local_baseline")?,
        censored_window: row.get("censored_window")?,
        metrics,
        status: parse(&status)?,
        reject_reason: row.get("reject_reason")?,
        flags,
        pre_override_status: pre_override.as_deref().map(parse).transpose()?,
        confidence: row.get("confidence")?,
        stratum: stratum.parse::<Stratum>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(15, rusqlite::types::Type::Text, e.into())
        })?,
        posture: posture.parse::<Posture>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, e.into())
        })?,
    })
}

fn adjustment_from_row(row: &Row) -> rusqlite::Result<PeakAdjustment> {
    Ok(PeakAdjustment {
        session_id: row.get(0)?,
        ordinal: row.get(1)?,
        shift_secs: row.get(2)?,
        justification: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn override_from_row(row: &Row) -> rusqlite::Result<QualityOverride> {
    let forced: String = row.get(2)?;
    let prior: Option<String> = row.get(3)?;
    let parse = |s: &str| -> rusqlite::Result<QualityStatus> {
        s.parse::<QualityStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })
    };
    Ok(QualityOverride {
        session_id: row.get(0)?,
        ordinal: row.get(1)?,
        forced_status: parse(&forced)?,
        prior_status: prior.as_deref().map(parse).transpose()?,
        justification: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckpointDrop, Observation};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
    }

    fn test_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            start_time: t0(),
            stratum: Stratum::Strength,
            posture: Posture::Standing,
            notes: Some("leg day".to_string()),
            samples: (0..10)
                .map(|i| Sample::new(t0() + Duration::seconds(i), 100 + i as u16))
                .collect(),
        }
    }

    fn test_interval(session_id: &str, ordinal: u32) -> RecoveryInterval {
        RecoveryInterval {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            ordinal,
            peak_time: t0() + Duration::seconds(300 * ordinal as i64),
            peak_hr: 165,
            window_start: t0() + Duration::seconds(300 * ordinal as i64),
            window_end: t0() + Duration::seconds(300 * ordinal as i64 + 120),
            local_baseline: 95.0,
            censored_window: true,
            metrics: IntervalMetrics {
                checkpoints: vec![CheckpointDrop { at_secs: 60, absolute: Some(28.0), fractional: Some(0.4) }],
                tau: Some(61.2),
                fit_r2: Some(0.93),
                ..Default::default()
            },
            status: QualityStatus::Pass,
            reject_reason: None,
            flags: vec![],
            pre_override_status: None,
            confidence: 0.85,
            stratum: Stratum::Strength,
            posture: Posture::Standing,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let mut store = Store::open_in_memory().unwrap();
        let session = test_session("s1");
        store.put_session(&session).unwrap();
        let loaded = store.load_session("s1").unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(store.load_session("missing").unwrap().is_none());
        assert_eq!(store.session_ids().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_interval_round_trip_preserves_metrics() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        let interval = test_interval("s1", 1);
        store.replace_intervals("s1", &[interval.clone()]).unwrap();
        let loaded = store.intervals_for_session("s1").unwrap();
        assert_eq!(loaded, vec![interval]);
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        store
            .replace_intervals("s1", &[test_interval("s1", 1), test_interval("s1", 2)])
            .unwrap();
        assert_eq!(store.intervals_for_session("s1").unwrap().len(), 2);

        // A new run that finds only one interval removes the other.
        store.replace_intervals("s1", &[test_interval("s1", 1)]).unwrap();
        let after = store.intervals_for_session("s1").unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].ordinal, 1);
    }

    #[test]
    fn test_annotations_survive_interval_replacement() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        store.replace_intervals("s1", &[test_interval("s1", 1)]).unwrap();

        let ov = QualityOverride {
            session_id: "s1".to_string(),
            ordinal: 1,
            forced_status: QualityStatus::Rejected,
            prior_status: Some(QualityStatus::Pass),
            justification: "sensor artifact".to_string(),
            created_at: t0(),
        };
        store.put_override(&ov).unwrap();

        // Wipe and regenerate the interval table.
        store.replace_intervals("s1", &[]).unwrap();
        store.replace_intervals("s1", &[test_interval("s1", 1)]).unwrap();

        assert_eq!(store.overrides_for_session("s1").unwrap(), vec![ov]);
    }

    #[test]
    fn test_natural_key_is_unique() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        let duplicate = vec![test_interval("s1", 1), test_interval("s1", 1)];
        assert!(store.replace_intervals("s1", &duplicate).is_err());
        // The failed transaction left nothing behind.
        assert!(store.intervals_for_session("s1").unwrap().is_empty());
    }

    #[test]
    fn test_bucket_query_filters_range() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        store
            .replace_intervals("s1", &[test_interval("s1", 1), test_interval("s1", 2)])
            .unwrap();

        let all = store
            .intervals_for_bucket(Stratum::Strength, Posture::Standing, None, None)
            .unwrap();
        assert_eq!(all.len(), 2);

        let to_first = store
            .intervals_for_bucket(
                Stratum::Strength,
                Posture::Standing,
                None,
                Some(t0() + Duration::seconds(400)),
            )
            .unwrap();
        assert_eq!(to_first.len(), 1);

        let other_bucket = store
            .intervals_for_bucket(Stratum::Endurance, Posture::Standing, None, None)
            .unwrap();
        assert!(other_bucket.is_empty());
    }

    #[test]
    fn test_baseline_and_trend_state_round_trip() {
        let mut store = Store::open_in_memory().unwrap();
        let baseline = StratumBaseline {
            stratum: Stratum::Endurance,
            posture: Posture::Supine,
            mean: 23.8,
            sdd: 2.1,
            count: 28,
            updated_at: t0(),
        };
        store.put_baseline(&baseline).unwrap();
        assert_eq!(
            store.load_baseline(Stratum::Endurance, Posture::Supine).unwrap(),
            Some(baseline)
        );
        assert!(store.load_baseline(Stratum::Strength, Posture::Standing).unwrap().is_none());

        let state = TrendState {
            stratum: Stratum::Endurance,
            posture: Posture::Supine,
            ewma_level: Some(22.9),
            cusum_acc: 1.4,
            cusum_alerting: false,
            last_observation: Some(t0()),
            near_baseline_streak: 2,
        };
        store.put_trend_state(&state).unwrap();
        assert_eq!(
            store.load_trend_state(Stratum::Endurance, Posture::Supine).unwrap(),
            Some(state)
        );
    }

    #[test]
    fn test_stats_counts() {
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        store.replace_intervals("s1", &[test_interval("s1", 1)]).unwrap();
        store
            .put_judgment(&ValidationJudgment {
                session_id: "s1".to_string(),
                ordinal: 1,
                label: JudgmentLabel::TruePositive,
                notes: None,
                created_at: t0(),
            })
            .unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.session_count, 1);
        assert_eq!(stats.interval_count, 1);
        assert_eq!(stats.judgment_count, 1);
        assert_eq!(stats.override_count, 0);
    }

    #[test]
    fn test_observation_struct_sortable() {
        // Guard: the bucket query result ordering feeds straight into the
        // detectors, which require chronological input.
        let mut store = Store::open_in_memory().unwrap();
        store.put_session(&test_session("s1")).unwrap();
        store
            .replace_intervals("s1", &[test_interval("s1", 2), test_interval("s1", 1)])
            .unwrap();
        let rows = store
            .intervals_for_bucket(Stratum::Strength, Posture::Standing, None, None)
            .unwrap();
        let times: Vec<_> = rows.iter().map(|r| r.peak_time).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
        let _ = Observation { time: t0(), value: 1.0 };
    }
}
