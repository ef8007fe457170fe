use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

use crate::google::RemoteError;
use crate::state::StateError;

/// Typed download errors enabling retry classification.
///
/// `is_retryable()` separates transient failures (server errors, rate limits,
/// truncated transfers) from permanent ones; `is_systemic()` marks local
/// conditions that will fail every remaining item too.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error {status} downloading {path}")]
    HttpStatus { status: u16, path: String },

    #[error("HTTP error downloading {path}: {source}")]
    Http {
        source: reqwest::Error,
        path: String,
    },

    #[error("Truncated download of {path}: expected {expected} bytes, got {actual}")]
    Truncated {
        expected: u64,
        actual: u64,
        path: String,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Download of {path} failed after {retries} retries: {last_error}")]
    RetriesExhausted {
        retries: u32,
        path: String,
        last_error: String,
    },

    #[error("{path} is already taken by another item")]
    Collision { path: PathBuf },
}

impl DownloadError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            DownloadError::Http { .. } => true,
            DownloadError::Truncated { .. } => true,
            DownloadError::Disk(_) => false,
            DownloadError::RetriesExhausted { .. } => false,
            DownloadError::Collision { .. } => false,
        }
    }

    /// Local storage conditions that make continuing the run pointless.
    pub fn is_systemic(&self) -> bool {
        match self {
            DownloadError::Disk(e) => matches!(
                e.kind(),
                ErrorKind::StorageFull | ErrorKind::ReadOnlyFilesystem | ErrorKind::QuotaExceeded
            ),
            _ => false,
        }
    }
}

/// Errors that abort a whole sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote media index unavailable")]
    RemoteUnavailable(#[source] RemoteError),

    #[error("Ledger unavailable")]
    LedgerUnavailable(#[from] StateError),

    #[error("Filesystem error at {path}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
