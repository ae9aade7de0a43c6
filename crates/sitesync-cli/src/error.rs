use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] sitesync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Field must look like key=value: {0}")]
    InvalidField(String),
    #[error("--json must be a JSON object")]
    InvalidJsonFields,
    #[error("No fields provided")]
    EmptyFields,
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Sync failed: {0}")]
    SyncFailed(String),
    #[error("Sync skipped: {0}")]
    SyncSkipped(String),
    #[error("Sync is not configured. Pass --server-url or set SITESYNC_SERVER_URL.")]
    SyncNotConfigured,
}
