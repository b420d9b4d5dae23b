//! Error Taxonomy
//!
//! Parse and validation failures are reportable with full detail.
//! Storage failures are surfaced for the affected coordinate or file and
//! never repaired silently.

use thiserror::Error;

use crate::delta::DeltaError;
use crate::validation::ValidationResult;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed coordinate '{input}': {reason}")]
    MalformedCoordinate { input: String, reason: String },

    #[error("Validation rejected {coordinate}: {}", .result.summary())]
    ValidationRejected {
        coordinate: String,
        result: ValidationResult,
    },

    #[error("Broken delta chain at {coordinate}: base block {base} is missing")]
    BrokenDeltaChain { coordinate: String, base: String },

    #[error("Delta chain for {coordinate} exceeds maximum depth {max_depth}")]
    ChainDepthExceeded { coordinate: String, max_depth: u8 },

    #[error("Corrupt VKT file: {0}")]
    CorruptFile(String),

    #[error("Content hash mismatch for {coordinate}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        coordinate: String,
        expected: String,
        actual: String,
    },

    #[error("Coordinate not found: {0}")]
    NotFound(String),

    #[error("Coordinate is tombstoned: {0}")]
    Tombstoned(String),

    #[error("VKT file is already open for writing: {0}")]
    WriterLocked(String),

    #[error("Delta error: {0}")]
    Delta(#[from] DeltaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        CoreError::MalformedCoordinate {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        CoreError::CorruptFile(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
