use thiserror::Error;

use crate::api::ApiError;
use crate::sanitize::SanitizeError;

/// Errors raised by the local database layer (mirror tables, queue, settings).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("invalid document: {0}")]
    Sanitize(#[from] SanitizeError),

    #[error("a change with idempotency key {key} is already queued for {kind} {id}")]
    DuplicateKey { key: String, kind: String, id: String },

    #[error("invalid stored value: {0}")]
    InvalidData(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database open failed: {0}")]
    Open(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors surfaced by the sync engine and resync paths.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote api error: {0}")]
    Api(#[from] ApiError),

    #[error("session expired or revoked; sign in again to resume sync")]
    SessionExpired,

    #[error("sync is not configured: {0}")]
    NotConfigured(String),

    #[error("{0} queued change(s) could not be synced; refusing to discard them")]
    PendingEntriesRemain(usize),
}

/// Errors raised while writing a diagnostics bundle.
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
