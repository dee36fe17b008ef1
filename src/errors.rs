//! # Engine Errors
//!
//! Error taxonomy shared by the constraint compiler, the access-control
//! resolver and both REST pipelines. Every variant carries a stable
//! numeric code that clients match on, plus a human-readable message.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Data engine errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    // ==================
    // Query Errors
    // ==================
    /// Malformed subquery operator payload
    #[error("{0}")]
    InvalidQuery(String),

    /// Unknown or malformed request option
    #[error("{0}")]
    InvalidJson(String),

    // ==================
    // Access Errors
    // ==================
    /// Disallowed class creation, read-only write, foreign user mutation
    #[error("{0}")]
    OperationForbidden(String),

    /// Missing or invalid session for a session-scoped operation
    #[error("{0}")]
    InvalidSessionToken(String),

    /// Caller is not authenticated for a user mutation
    #[error("{0}")]
    SessionMissing(String),

    /// ACL could not be resolved
    #[error("Invalid ACL.")]
    InvalidAcl,

    // ==================
    // Write Validation Errors
    // ==================
    /// Reserved or immutable field write attempt
    #[error("{0}")]
    InvalidKeyName(String),

    /// Required field missing
    #[error("{0}")]
    MissingRequiredField(String),

    /// Schema type mismatch reported by storage
    #[error("{0}")]
    IncorrectType(String),

    /// Password does not satisfy the configured policy or history
    #[error("{0}")]
    PasswordPolicyViolation(String),

    /// Sign-up without username
    #[error("bad or missing username")]
    UsernameMissing,

    /// Sign-up without password
    #[error("password is required")]
    PasswordMissing,

    /// E-mail address fails the format check
    #[error("Email address format is invalid.")]
    InvalidEmailAddress,

    /// Auth-data provider is not supported
    #[error("This authentication method is unsupported.")]
    UnsupportedService,

    // ==================
    // Uniqueness Errors
    // ==================
    /// Username already used by another account
    #[error("Account already exists for this username.")]
    UsernameTaken,

    /// E-mail already used by another account
    #[error("Account already exists for this email address.")]
    EmailTaken,

    /// Unique constraint violated on an undetermined field
    #[error("A duplicate value for a field with unique values was provided")]
    DuplicateValue,

    /// Linked identity already belongs to another user
    #[error("this auth is already used")]
    AccountAlreadyLinked,

    // ==================
    // Installation Errors
    // ==================
    /// Object to update does not exist
    #[error("{0}")]
    ObjectNotFound(String),

    /// Immutable installation identity field change
    #[error("{0}")]
    InstallationConflict(String),

    /// Device token matches several installations
    #[error("Must specify installationId when deviceToken matches multiple Installation objects")]
    MustSpecifyInstallationId,

    // ==================
    // Runtime Errors
    // ==================
    /// Trigger rejected the operation
    #[error("{0}")]
    ScriptFailed(String),

    /// Request was cancelled before completion
    #[error("Request cancelled")]
    Timeout,

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable numeric error code exposed to clients
    pub fn code(&self) -> u32 {
        match self {
            EngineError::Internal(_) => 1,
            EngineError::ObjectNotFound(_) => 101,
            EngineError::InvalidQuery(_) => 102,
            EngineError::InvalidKeyName(_) => 105,
            EngineError::InvalidJson(_) => 107,
            EngineError::IncorrectType(_) => 111,
            EngineError::OperationForbidden(_) => 119,
            EngineError::InvalidAcl => 123,
            EngineError::Timeout => 124,
            EngineError::InvalidEmailAddress => 125,
            EngineError::MustSpecifyInstallationId => 132,
            EngineError::MissingRequiredField(_) => 135,
            EngineError::InstallationConflict(_) => 136,
            EngineError::DuplicateValue => 137,
            EngineError::ScriptFailed(_) => 141,
            EngineError::PasswordPolicyViolation(_) => 142,
            EngineError::UsernameMissing => 200,
            EngineError::PasswordMissing => 201,
            EngineError::UsernameTaken => 202,
            EngineError::EmailTaken => 203,
            EngineError::SessionMissing(_) => 206,
            EngineError::AccountAlreadyLinked => 208,
            EngineError::InvalidSessionToken(_) => 209,
            EngineError::UnsupportedService => 252,
        }
    }

    /// HTTP status code for the transport boundary
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidSessionToken(_) | EngineError::SessionMissing(_) => 401,
            EngineError::OperationForbidden(_) => 403,
            EngineError::ObjectNotFound(_) => 404,
            EngineError::Timeout => 408,
            EngineError::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Returns whether this error was caused by the request itself
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::OperationForbidden(msg.into())
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKeyName(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DuplicateValue { .. } => EngineError::DuplicateValue,
            StorageError::ObjectNotFound => {
                EngineError::ObjectNotFound("Object not found.".to_string())
            }
            StorageError::SchemaMismatch(msg) => EngineError::IncorrectType(msg),
            StorageError::InvalidKey(msg) => EngineError::InvalidKeyName(msg),
            StorageError::InvalidQuery(msg) => EngineError::InvalidQuery(msg),
            StorageError::Backend(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(EngineError::invalid_query("x").code(), 102);
        assert_eq!(EngineError::forbidden("x").code(), 119);
        assert_eq!(EngineError::UsernameTaken.code(), 202);
        assert_eq!(EngineError::EmailTaken.code(), 203);
        assert_eq!(EngineError::DuplicateValue.code(), 137);
        assert_eq!(EngineError::AccountAlreadyLinked.code(), 208);
        assert_eq!(EngineError::MustSpecifyInstallationId.code(), 132);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::forbidden("x").status_code(), 403);
        assert_eq!(
            EngineError::InvalidSessionToken("x".into()).status_code(),
            401
        );
        assert_eq!(EngineError::internal("x").status_code(), 500);
        assert!(EngineError::UsernameTaken.is_client_error());
        assert!(!EngineError::internal("x").is_client_error());
    }

    #[test]
    fn test_storage_duplicate_converts_to_generic_duplicate() {
        let err: EngineError = StorageError::DuplicateValue {
            field: Some("username".into()),
        }
        .into();
        assert_eq!(err, EngineError::DuplicateValue);
    }
}
