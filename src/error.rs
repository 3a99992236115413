//! Error types for Pelta.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`PeltaError`] enum. Variants map one-to-one to the ways a database
//! operation can fail from the caller's point of view.
//!
//! # Examples
//!
//! ```
//! use pelta::error::{PeltaError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(PeltaError::validation("text must be a string"))
//! }
//!
//! assert!(example_operation().is_err());
//! ```

use std::io;

use thiserror::Error;

use crate::store::Key;

/// The main error type for Pelta operations.
#[derive(Error, Debug)]
pub enum PeltaError {
    /// A record or partial record does not conform to its table definition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The addressed record does not exist.
    #[error("Record {id} not found in table {table}")]
    RecordNotFound { table: String, id: Key },

    /// The addressed table has no definition.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A vector does not have the configured number of dimensions.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The database was used before `load` completed.
    #[error("Database not loaded; call load() first")]
    NotLoaded,

    /// An authorization hook rejected the operation.
    #[error("{operation} operation not authorized on table {table}")]
    AuthorizationDenied { operation: String, table: String },

    /// The commit failed and none of its writes were applied.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// A uniqueness constraint (primary key) was violated.
    #[error("Constraint error: {0}")]
    Constraint(String),

    /// Schema definition or migration errors.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Query-related errors (malformed predicates, cursors, etc.)
    #[error("Query error: {0}")]
    Query(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid operation
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with PeltaError.
pub type Result<T> = std::result::Result<T, PeltaError>;

impl PeltaError {
    /// Create a new validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        PeltaError::Validation(msg.into())
    }

    /// Create a new record-not-found error.
    pub fn record_not_found<S: Into<String>>(table: S, id: Key) -> Self {
        PeltaError::RecordNotFound {
            table: table.into(),
            id,
        }
    }

    /// Create a new table-not-found error.
    pub fn table_not_found<S: Into<String>>(table: S) -> Self {
        PeltaError::TableNotFound(table.into())
    }

    /// Create a new dimension mismatch error.
    pub fn dimension_mismatch(expected: usize, actual: usize) -> Self {
        PeltaError::DimensionMismatch { expected, actual }
    }

    /// Create a new authorization error.
    pub fn unauthorized<S: Into<String>, T: Into<String>>(operation: S, table: T) -> Self {
        PeltaError::AuthorizationDenied {
            operation: operation.into(),
            table: table.into(),
        }
    }

    /// Create a new transaction-aborted error.
    pub fn aborted<S: Into<String>>(msg: S) -> Self {
        PeltaError::TransactionAborted(msg.into())
    }

    /// Create a new constraint error.
    pub fn constraint<S: Into<String>>(msg: S) -> Self {
        PeltaError::Constraint(msg.into())
    }

    /// Create a new schema error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        PeltaError::Schema(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        PeltaError::Query(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PeltaError::Storage(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        PeltaError::InvalidOperation(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        PeltaError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        PeltaError::Other(format!("Invalid argument: {}", msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = PeltaError::validation("text must be a string");
        assert_eq!(error.to_string(), "Validation error: text must be a string");

        let error = PeltaError::record_not_found("messages", Key::Int(7));
        assert_eq!(error.to_string(), "Record 7 not found in table messages");

        let error = PeltaError::unauthorized("Insert", "messages");
        assert_eq!(
            error.to_string(),
            "Insert operation not authorized on table messages"
        );

        let error = PeltaError::dimension_mismatch(3, 2);
        assert_eq!(error.to_string(), "Dimension mismatch: expected 3, got 2");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let pelta_error = PeltaError::from(io_error);

        match pelta_error {
            PeltaError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }
}
