/// Error types for factsync operations.
///
/// The variants follow the way failures are handled by the engine:
/// shape and fact errors are programmer mistakes reported synchronously,
/// storage and network errors come from providers and are recovered by
/// the coordinator wherever a propagation round can continue without them.
use crate::fact::FactReference;
use thiserror::Error;

/// The main error type for factsync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A template or condition could not be resolved into query steps.
    #[error("Shape error: {reason}")]
    Shape {
        /// Description of the malformed shape
        reason: String,
    },

    /// A fact payload could not be normalized into records.
    #[error("Invalid fact: {reason}")]
    InvalidFact {
        /// Description of why the fact is invalid
        reason: String,
    },

    /// Canonical query text could not be parsed.
    #[error("Query syntax error at {position}: {reason}")]
    QuerySyntax {
        /// Byte offset of the offending token
        position: usize,
        /// What the parser expected
        reason: String,
    },

    /// A referenced fact is not present in storage.
    #[error("Fact {reference} not found")]
    FactNotFound {
        /// The reference that could not be loaded
        reference: FactReference,
    },

    /// Storage provider operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network provider operation failed
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        Self::Shape {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_fact(reason: impl Into<String>) -> Self {
        Self::InvalidFact {
            reason: reason.into(),
        }
    }
}

/// Result type alias for factsync operations.
pub type SyncResult<T> = Result<T, SyncError>;
