//! Error types for the reconstruction pipeline.
//!
//! Clean error handling using `thiserror` for ergonomic error definitions.
//! Recoverable failures (bad input files, codec corruption, refused events)
//! are surfaced as `Err`; broken internal invariants panic and are caught at
//! the worker boundary, where the offending (asset, date) pair is marked
//! failed without taking down the rest of the pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Main error type for reconstruction and pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Event carries a type the engine does not support (e.g. `change`)
    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(u8),

    /// Event field failed validation before reaching the book
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Compressed column data is corrupt or truncated
    #[error("Codec corruption in column '{column}': {detail}")]
    CodecCorruption {
        column: &'static str,
        detail: String,
    },

    /// Declared value count disagrees with the consumer's expectation
    #[error("Value count mismatch in column '{column}': header says {found}, expected {expected}")]
    CountMismatch {
        column: &'static str,
        expected: usize,
        found: usize,
    },

    /// Unknown auto-select algorithm tag in a compressed column
    #[error("Unknown codec algorithm tag: {0}")]
    UnknownAlgorithm(u8),

    /// Encoded file's name and header disagree about the record count
    #[error("Record count mismatch for {path}: filename says {filename_count}, header says {header_count}")]
    FileCountMismatch {
        path: PathBuf,
        filename_count: u64,
        header_count: u64,
    },

    /// Feature store used out of protocol (bad date, level, or index)
    #[error("Feature store misuse: {0}")]
    StoreMisuse(String),

    /// Tensor lifecycle transition that the state machine forbids
    #[error("Invalid tensor state transition for {date}: {from} -> {to}")]
    InvalidTensorTransition {
        date: String,
        from: &'static str,
        to: &'static str,
    },

    /// Pool cannot satisfy an allocation (capacity governor engaged)
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    /// Configuration problem detected before any work started
    #[error("Configuration error: {0}")]
    Config(String),

    /// Archive extraction or supplier file problem for one (asset, date)
    #[error("Input error for {asset} on {date}: {detail}")]
    Input {
        asset: String,
        date: String,
        detail: String,
    },

    /// The pipeline was asked to stop (SIGINT)
    #[error("Shutdown requested")]
    Shutdown,

    /// Underlying I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for catalogs or diagnostics export
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Generic(String),
}

impl PipelineError {
    /// Create a generic error from any string-like type.
    pub fn generic(msg: impl Into<String>) -> Self {
        PipelineError::Generic(msg.into())
    }

    /// Create a codec corruption error with context.
    pub fn corrupt(column: &'static str, detail: impl Into<String>) -> Self {
        PipelineError::CodecCorruption {
            column,
            detail: detail.into(),
        }
    }

    /// True for failures that should fail one (asset, date) pair but not
    /// halt the pipeline.
    pub fn is_pair_local(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedEvent(_)
                | PipelineError::InvalidEvent(_)
                | PipelineError::CodecCorruption { .. }
                | PipelineError::CountMismatch { .. }
                | PipelineError::UnknownAlgorithm(_)
                | PipelineError::FileCountMismatch { .. }
                | PipelineError::Input { .. }
        )
    }
}

impl From<String> for PipelineError {
    fn from(err: String) -> Self {
        PipelineError::Generic(err)
    }
}

impl From<&str> for PipelineError {
    fn from(err: &str) -> Self {
        PipelineError::Generic(err.to_string())
    }
}
