//! Unified error hierarchy for the HRR pipeline
//!
//! Session-level input defects are recoverable (the batch skips and reports
//! them); numerical degeneracy degrades individual metrics to `None` inside
//! the fitter rather than surfacing here; only storage unavailability is
//! fatal to an entire run.

use thiserror::Error;

/// Top-level error type for all pipeline operations
#[derive(Debug, Error)]
pub enum HrrError {
    /// Per-session extraction defects (corrupt samples, unknown session)
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// Persistence-layer failures
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Annotation authoring/reattachment failures
    #[error("Annotation error: {0}")]
    Annotation(#[from] AnnotationError),

    /// Configuration load/save/validation errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors (config files, session ingest)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Session-level extraction errors
///
/// These recover locally: the batch logs the session and continues.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Sample sequence violates ordering or plausibility invariants
    #[error("Corrupt samples in session {session_id}: {reason}")]
    CorruptSamples { session_id: String, reason: String },

    /// Session id not present in the sample store
    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    /// Session has no samples at all (distinct from "no sustained effort")
    #[error("Session {session_id} has no samples")]
    EmptySession { session_id: String },
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),
}

/// Annotation authoring and reattachment errors
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// The referenced (session, ordinal) pair has no current interval
    #[error("No interval at ({session_id}, {ordinal})")]
    NoSuchInterval { session_id: String, ordinal: u32 },

    /// Overrides and adjustments require a rationale
    #[error("Justification text is required for {kind}")]
    MissingJustification { kind: String },

    /// Override must force Pass or Rejected, nothing else
    #[error("Invalid forced status: {status}")]
    InvalidForcedStatus { status: String },
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, HrrError>;

/// Error severity levels, mapped to tracing levels at the log boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    Error,
    Warning,
}

impl HrrError {
    /// Whether the whole batch must stop, or just the current session
    pub fn is_fatal(&self) -> bool {
        matches!(self, HrrError::Store(_) | HrrError::Internal(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HrrError::Extraction(_) => ErrorSeverity::Warning,
            HrrError::Annotation(_) => ErrorSeverity::Warning,
            HrrError::Configuration(_) => ErrorSeverity::Error,
            HrrError::Io(_) => ErrorSeverity::Error,
            HrrError::Store(_) => ErrorSeverity::Critical,
            HrrError::Internal(_) => ErrorSeverity::Critical,
        }
    }
}

impl ErrorSeverity {
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical | ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_are_not_fatal() {
        let err = HrrError::Extraction(ExtractionError::CorruptSamples {
            session_id: "s1".to_string(),
            reason: "non-monotonic timestamps".to_string(),
        });
        assert!(!err.is_fatal());
        assert_eq!(err.severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_store_errors_are_fatal() {
        let err = HrrError::Store(StoreError::NotFound("intervals".to_string()));
        assert!(err.is_fatal());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }
}
