//! Error types for varasto buffers and the buffer stage

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub use varasto_core::CodecError;

/// Result type alias for buffer operations
pub type Result<T> = std::result::Result<T, VarastoError>;

/// Main error type for varasto buffers
#[derive(Error, Debug)]
pub enum VarastoError {
    /// Encoded message can never fit, regardless of backlog
    #[error("message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    /// Buffer or stage was closed
    #[error("buffer closed")]
    Closed,

    /// Shift called with no pending message
    #[error("nothing to shift")]
    NothingToShift,

    /// A stage channel was bound twice
    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    /// Deadline elapsed before the stage finished closing
    #[error("timed out after {0:?} waiting for close")]
    Timeout(Duration),

    /// Stored data does not decode
    #[error("corrupt buffer data: {0}")]
    Corrupt(#[from] CodecError),

    /// Segment file I/O failed
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl VarastoError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VarastoError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for errors that leave the buffer unusable
    ///
    /// Storage failures close the buffer; the caller should stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VarastoError::Corrupt(_) | VarastoError::Io { .. })
    }

    /// Short label for metrics
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            VarastoError::MessageTooLarge { .. } => "too_large",
            VarastoError::Closed => "closed",
            VarastoError::NothingToShift => "nothing_to_shift",
            VarastoError::AlreadyStarted(_) => "already_started",
            VarastoError::Timeout(_) => "timeout",
            VarastoError::Corrupt(_) => "corrupt",
            VarastoError::Io { .. } => "io",
            VarastoError::Config(_) => "config",
            VarastoError::Metrics(_) => "metrics",
        }
    }
}
