//! Error types for the counter aggregation engine
//!
//! A single `TallyError` enum covers every failure the engine can observe.
//! Callers at a recovery boundary (an aggregation plan, a cleanup
//! transaction, a stats write) log the error and move on; nothing here is
//! fatal to the process.

use std::io;
use thiserror::Error;

/// Result type alias for tally operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// Error types for the aggregation engine
#[derive(Debug, Error)]
pub enum TallyError {
    /// The worker or controller metadata changed underneath a transaction.
    ///
    /// Never retried inside the same round: the next scheduling trigger
    /// reconciles state.
    #[error("ownership lost: {path} changed since it was read")]
    OwnershipLost {
        /// Path of the metadata document that no longer matches
        path: String,
    },

    /// Optimistic transaction kept conflicting with concurrent writers
    #[error("transaction aborted after {attempts} attempt(s): {reason}")]
    TransactionConflict {
        /// Number of attempts made before giving up
        attempts: usize,
        /// Description of the last conflict
        reason: String,
    },

    /// Transient document store failure (read, query or write)
    #[error("storage error: {message}")]
    Storage {
        /// Error message
        message: String,
    },

    /// An internal planning invariant did not hold
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Malformed document path
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid argument passed by the caller
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// Document (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TallyError {
    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        TallyError::Storage {
            message: message.into(),
        }
    }

    /// Create an ownership-lost error for a metadata document
    pub fn ownership_lost(path: impl Into<String>) -> Self {
        TallyError::OwnershipLost { path: path.into() }
    }

    /// Create an invalid-input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        TallyError::InvalidInput(message.into())
    }

    /// Create an invalid-path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        TallyError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invariant-violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        TallyError::InvariantViolation(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        TallyError::Config(message.into())
    }

    /// True for failures that a later attempt may not hit again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallyError::TransactionConflict { .. } | TallyError::Storage { .. }
        )
    }

    /// True when the failure came from optimistic conflict detection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TallyError::TransactionConflict { .. })
    }

    /// True when the caller no longer owns the slice it was working on.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, TallyError::OwnershipLost { .. })
    }
}
