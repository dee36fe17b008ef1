//! Storage error types
//!
//! Errors reported by a `Storage` backend. The write pipeline intercepts
//! `DuplicateValue` to re-diagnose which unique field was taken; every
//! other variant converts straight into an `EngineError`.

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// A unique index rejected the write
    ///
    /// `field` names the offending field when the backend can tell.
    #[error("duplicate value for unique field {}", field.as_deref().unwrap_or("<unknown>"))]
    DuplicateValue { field: Option<String> },

    /// The object to update or destroy does not exist (or is not visible)
    #[error("object not found")]
    ObjectNotFound,

    /// A value does not match the declared field type
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A field name is not allowed in this class
    #[error("invalid field name: {0}")]
    InvalidKey(String),

    /// Constraint the backend cannot evaluate
    #[error("{0}")]
    InvalidQuery(String),

    /// Backend failure unrelated to the request
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn duplicate(field: impl Into<String>) -> Self {
        Self::DuplicateValue {
            field: Some(field.into()),
        }
    }

    /// Returns true for unique-index violations
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::DuplicateValue { .. })
    }
}
