//! # Error Types
//!
//! Structured error types for lca_core. Batch-level failures (persistence,
//! collaborators, invalid reference data) are `EngineError` values.
//! Record-level failures (an unmapped material, a missing density) are not
//! errors: they travel as [`crate::calculations::Outcome::Failed`] so that a
//! batch always keeps every valid result.
//!
//! ## Example
//!
//! ```rust
//! use lca_core::errors::{EngineError, EngineResult};
//!
//! fn validate_life_span(years: u32) -> EngineResult<()> {
//!     if years == 0 {
//!         return Err(EngineError::invalid_input(
//!             "years",
//!             years.to_string(),
//!             "Life span must be positive",
//!         ));
//!     }
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for lca_core operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Structured error type for engine operations.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum EngineError {
    /// An input value is invalid (out of range, wrong shape, etc.)
    #[error("Invalid input for '{field}': {value} - {reason}")]
    InvalidInput {
        field: String,
        value: String,
        reason: String,
    },

    /// A required field is missing
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Reference rows rejected at ingestion
    #[error("Invalid {kind} reference data for version '{version}': {reason}")]
    InvalidReferenceData {
        kind: String,
        version: String,
        reason: String,
    },

    /// Requested reference-data version is not loaded
    #[error("Reference version not found: {kind} '{version}'")]
    VersionNotFound { kind: String, version: String },

    /// Reference versions are immutable; a loaded version cannot be reloaded
    #[error("Reference version already exists: {kind} '{version}'")]
    VersionExists { kind: String, version: String },

    /// A kind has no active version and none was requested
    #[error("No active reference version for {kind}")]
    NoActiveVersion { kind: String },

    /// Project status may only move forward
    #[error("Invalid status transition for project '{project_id}': {from} -> {to}")]
    InvalidStatusTransition {
        project_id: String,
        from: String,
        to: String,
    },

    /// Durable store failure; fatal to the batch
    #[error("Persistence error: {operation} - {reason}")]
    Persistence { operation: String, reason: String },

    /// File I/O error
    #[error("File error: {operation} on '{path}' - {reason}")]
    FileError {
        operation: String,
        path: String,
        reason: String,
    },

    /// File is locked by another user/process
    #[error("File locked: '{path}' is locked by {locked_by} since {locked_at}")]
    FileLocked {
        path: String,
        locked_by: String,
        locked_at: String,
    },

    /// JSON/TOML serialization or deserialization error
    #[error("Serialization error: {reason}")]
    SerializationError { reason: String },

    /// Configuration value rejected
    #[error("Invalid configuration '{key}': {reason}")]
    Config { key: String, reason: String },

    /// An external collaborator (extraction, transport, export) failed
    #[error("Collaborator error: {collaborator} - {reason}")]
    Collaborator { collaborator: String, reason: String },

    /// Bounded retries ran out
    #[error("Retries exhausted for {operation} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Generic internal error (should be rare)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Create an InvalidInput error
    pub fn invalid_input(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a MissingField error
    pub fn missing_field(field: impl Into<String>) -> Self {
        EngineError::MissingField {
            field: field.into(),
        }
    }

    /// Create an InvalidReferenceData error
    pub fn invalid_reference(kind: impl Into<String>, version: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidReferenceData {
            kind: kind.into(),
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Create a VersionNotFound error
    pub fn version_not_found(kind: impl Into<String>, version: impl Into<String>) -> Self {
        EngineError::VersionNotFound {
            kind: kind.into(),
            version: version.into(),
        }
    }

    /// Create a VersionExists error
    pub fn version_exists(kind: impl Into<String>, version: impl Into<String>) -> Self {
        EngineError::VersionExists {
            kind: kind.into(),
            version: version.into(),
        }
    }

    /// Create a Persistence error from any displayable cause
    pub fn persistence(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::Persistence {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a FileError
    pub fn file_error(operation: impl Into<String>, path: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::FileError {
            operation: operation.into(),
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a FileLocked error
    pub fn file_locked(path: impl Into<String>, locked_by: impl Into<String>, locked_at: impl Into<String>) -> Self {
        EngineError::FileLocked {
            path: path.into(),
            locked_by: locked_by.into(),
            locked_at: locked_at.into(),
        }
    }

    /// Create a Config error
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a Collaborator error
    pub fn collaborator(collaborator: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Collaborator {
            collaborator: collaborator.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a recoverable error (e.g., can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::FileLocked { .. } | EngineError::Collaborator { .. }
        )
    }

    /// Get a short error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::InvalidInput { .. } => "INVALID_INPUT",
            EngineError::MissingField { .. } => "MISSING_FIELD",
            EngineError::InvalidReferenceData { .. } => "INVALID_REFERENCE_DATA",
            EngineError::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            EngineError::VersionExists { .. } => "VERSION_EXISTS",
            EngineError::NoActiveVersion { .. } => "NO_ACTIVE_VERSION",
            EngineError::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::Persistence { .. } => "PERSISTENCE_ERROR",
            EngineError::FileError { .. } => "FILE_ERROR",
            EngineError::FileLocked { .. } => "FILE_LOCKED",
            EngineError::SerializationError { .. } => "SERIALIZATION_ERROR",
            EngineError::Config { .. } => "CONFIG_ERROR",
            EngineError::Collaborator { .. } => "COLLABORATOR_ERROR",
            EngineError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            EngineError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::persistence("sqlite", e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::SerializationError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialization() {
        let error = EngineError::version_not_found("materials", "2024");
        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("\"type\":\"VersionNotFound\""));
        let roundtrip: EngineError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, roundtrip);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::missing_field("project_id").error_code(), "MISSING_FIELD");
        assert_eq!(
            EngineError::version_exists("cost", "2023").error_code(),
            "VERSION_EXISTS"
        );
        assert_eq!(
            EngineError::persistence("commit", "disk full").error_code(),
            "PERSISTENCE_ERROR"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(EngineError::collaborator("extractor", "timeout").is_recoverable());
        assert!(!EngineError::persistence("commit", "constraint").is_recoverable());
        assert!(!EngineError::invalid_input("x", "1", "bad").is_recoverable());
    }
}
