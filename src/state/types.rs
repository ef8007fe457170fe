//! Types for the ledger.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::google::{MediaItem, MediaMetadata};

/// Sync status of a media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Seen and assigned a path, download not yet confirmed.
    Pending,
    /// Bytes are on disk at `local_path`. Terminal.
    Downloaded,
    /// Excluded by the path planner. Terminal.
    Skipped,
    /// Last download attempt failed; retried on the next run.
    Failed,
}

impl SyncStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloaded" => Some(Self::Downloaded),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One ledger row: the sync state of a single media item.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub id: String,
    pub filename: String,
    /// Absent only for `Skipped` records.
    pub local_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: MediaMetadata,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Failed download attempts so far.
    pub attempts: u32,
    pub status: SyncStatus,
}

impl SyncRecord {
    fn from_item(item: &MediaItem, status: SyncStatus, local_path: Option<PathBuf>) -> Self {
        Self {
            id: item.id.clone(),
            filename: item.filename.clone(),
            local_path,
            last_error: None,
            mime_type: item.mime_type.clone(),
            metadata: item.metadata.clone(),
            created_at: item.creation_time,
            last_attempt_at: None,
            attempts: 0,
            status,
        }
    }

    /// First sighting of an item that is about to be downloaded to `path`.
    pub fn pending(item: &MediaItem, path: PathBuf) -> Self {
        Self::from_item(item, SyncStatus::Pending, Some(path))
    }

    /// An item the path planner excluded.
    pub fn skipped(item: &MediaItem) -> Self {
        Self::from_item(item, SyncStatus::Skipped, None)
    }

    pub fn into_downloaded(self, path: PathBuf) -> Self {
        Self {
            local_path: Some(path),
            last_error: None,
            last_attempt_at: Some(Utc::now()),
            status: SyncStatus::Downloaded,
            ..self
        }
    }

    pub fn into_failed(self, error: impl Into<String>) -> Self {
        Self {
            last_error: Some(error.into()),
            last_attempt_at: Some(Utc::now()),
            attempts: self.attempts.saturating_add(1),
            status: SyncStatus::Failed,
            ..self
        }
    }
}

/// Statistics for a single sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRunStats {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Whether the run stopped early on a shutdown signal.
    pub interrupted: bool,
}

/// Summary of the ledger for `status`.
#[derive(Debug, Clone, Default)]
pub struct LedgerSummary {
    pub total: u64,
    pub downloaded: u64,
    pub pending: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
}
