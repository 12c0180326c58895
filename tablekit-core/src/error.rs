//! Structured error types for tablekit-core.
//!
//! Uses `thiserror` so library consumers can match on the failure kind.
//! The binary crate (tablekit-cli) wraps these in `anyhow` for reporting.

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::entity::MappingError;

/// Raw failure reported by a backend handle.
///
/// `message` is whatever the backend produced: a structured JSON error body
/// when the store answered, or transport text when the call never got that far.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl BackendError {
    pub fn new(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }

    /// Failure that happened before the store could respond.
    pub fn transport(err: impl fmt::Display) -> Self {
        Self {
            message: err.to_string(),
            status_code: None,
        }
    }
}

/// Backend error codes with a dedicated message template.
///
/// Anything the store reports outside this set lands in `Other` and keeps the
/// backend's own message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TableAlreadyExists,
    TableNotFound,
    ResourceNotFound,
    InvalidInput,
    TableBeingDeleted,
    EntityAlreadyExists,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "TableAlreadyExists" => Self::TableAlreadyExists,
            "TableNotFound" => Self::TableNotFound,
            "ResourceNotFound" => Self::ResourceNotFound,
            "InvalidInput" => Self::InvalidInput,
            "TableBeingDeleted" => Self::TableBeingDeleted,
            "EntityAlreadyExists" => Self::EntityAlreadyExists,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TableAlreadyExists => "TableAlreadyExists",
            Self::TableNotFound => "TableNotFound",
            Self::ResourceNotFound => "ResourceNotFound",
            Self::InvalidInput => "InvalidInput",
            Self::TableBeingDeleted => "TableBeingDeleted",
            Self::EntityAlreadyExists => "EntityAlreadyExists",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified backend failure.
///
/// Only [`crate::classify::classify`] builds these; application code reads
/// `code` (or [`DomainError::kind`]) to decide whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
    pub code: String,
    pub status_code: u16,
}

impl DomainError {
    pub(crate) fn new(message: String, code: &ErrorCode, status_code: u16) -> Self {
        Self {
            message,
            code: code.as_str().to_string(),
            status_code,
        }
    }

    pub fn kind(&self) -> ErrorCode {
        ErrorCode::parse(&self.code)
    }

    pub fn is_table_already_exists(&self) -> bool {
        self.kind() == ErrorCode::TableAlreadyExists
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorCode::ResourceNotFound
    }
}

/// Error returned by every repository operation
#[derive(Error, Debug)]
pub enum RepoError {
    /// The store answered with a structured error
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The call failed before the store produced a structured answer
    #[error(transparent)]
    Transport(BackendError),

    /// Handle construction failed on malformed configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Entity could not be converted to or from the wire record
    #[error("entity mapping error: {0}")]
    Mapping(#[from] MappingError),
}

impl RepoError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;
