//! Error types for sitesync-core

use thiserror::Error;

use crate::models::SyncErrorKind;

/// Result type alias using sitesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sitesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure reaching the remote (timeout, DNS, refused, 5xx)
    #[error("Network error: {0}")]
    Network(String),

    /// Payload rejected by the remote; retrying cannot succeed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote signalled divergent state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A data migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify this error for the sync error log.
    pub const fn sync_kind(&self) -> SyncErrorKind {
        match self {
            Self::Network(_) => SyncErrorKind::Network,
            Self::Validation(_) | Self::InvalidInput(_) => SyncErrorKind::Validation,
            Self::Conflict(_) => SyncErrorKind::Conflict,
            Self::Migration(_) => SyncErrorKind::Migration,
            Self::Database(_)
            | Self::LibSql(_)
            | Self::Io(_)
            | Self::NotFound(_)
            | Self::Serialization(_)
            | Self::Config(_) => SyncErrorKind::Storage,
        }
    }

    /// Whether retrying the same request may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.without_url().to_string())
    }
}
