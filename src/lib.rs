// Library interface for the hrrs modules
// This allows integration tests to access the core functionality

pub mod annotations;
pub mod baseline;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fitter;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod quality;
pub mod store;
pub mod trend;

// Re-export commonly used types for convenience
pub use models::*;
pub use annotations::{AccuracyReport, IntegrityReport, NaturalKey};
pub use config::PipelineConfig;
pub use error::{HrrError, Result};
pub use extractor::{ExtractedWindow, Extractor};
pub use fitter::{DecayFit, DecayFitter};
pub use pipeline::{HrrPipeline, ReprocessSummary, TrendReport};
pub use quality::QualityGate;
pub use store::Store;
pub use trend::{TrendAlert, TrendParams};
