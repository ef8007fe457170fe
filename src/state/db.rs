//! Ledger trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{LedgerSummary, SyncRecord, SyncRunStats, SyncStatus};
use crate::google::MediaMetadata;

/// Persistent mapping from media item id to sync state.
///
/// Object-safe so the engine and linker can take `&dyn Ledger`.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SyncRecord>, StateError>;

    /// Insert or replace the record for `record.id`.
    ///
    /// A `Downloaded` row is never overwritten by a non-`Downloaded` record;
    /// such an upsert is silently ignored.
    async fn upsert(&self, record: &SyncRecord) -> Result<(), StateError>;

    /// `(id, local_path)` for every downloaded item.
    async fn all_downloaded(&self) -> Result<Vec<(String, PathBuf)>, StateError>;

    /// Id of the item whose record claims `path`, if any.
    async fn path_owner(&self, path: &Path) -> Result<Option<String>, StateError>;

    async fn failed(&self) -> Result<Vec<SyncRecord>, StateError>;

    async fn summary(&self) -> Result<LedgerSummary, StateError>;

    /// Record the start of a sync run and return its id.
    async fn start_run(&self) -> Result<i64, StateError>;

    async fn complete_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;
}

/// SQLite implementation of the ledger.
pub struct SqliteLedger {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const RECORD_COLUMNS: &str = "id, filename, local_path, last_error, mime_type, width, height, \
     camera_make, camera_model, created_at, last_attempt_at, attempts, status";

impl SqliteLedger {
    /// Open or create a ledger at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL: a crash mid-write leaves either the old or the new row
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Opened ledger");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open a throwaway in-memory ledger. Used by dry runs that find no
    /// ledger on disk, and by tests.
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get(&self, id: &str) -> Result<Option<SyncRecord>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM media_items WHERE id = ?1"),
            [id],
            row_to_record,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn upsert(&self, record: &SyncRecord) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO media_items (id, filename, local_path, last_error, mime_type, width, height,
                camera_make, camera_model, created_at, last_attempt_at, attempts, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                local_path = excluded.local_path,
                last_error = excluded.last_error,
                mime_type = excluded.mime_type,
                width = excluded.width,
                height = excluded.height,
                camera_make = excluded.camera_make,
                camera_model = excluded.camera_model,
                created_at = excluded.created_at,
                last_attempt_at = excluded.last_attempt_at,
                attempts = excluded.attempts,
                status = excluded.status
            WHERE media_items.status != 'downloaded' OR excluded.status = 'downloaded'
            "#,
            rusqlite::params![
                &record.id,
                &record.filename,
                record.local_path.as_deref().map(|p| p.to_string_lossy()),
                &record.last_error,
                &record.mime_type,
                record.metadata.width,
                record.metadata.height,
                &record.metadata.camera_make,
                &record.metadata.camera_model,
                record.created_at.timestamp(),
                record.last_attempt_at.map(|dt| dt.timestamp()),
                record.attempts,
                record.status.as_str(),
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn all_downloaded(&self) -> Result<Vec<(String, PathBuf)>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, local_path FROM media_items WHERE status = 'downloaded' AND local_path IS NOT NULL ORDER BY local_path",
            )
            .map_err(StateError::query)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(rows)
    }

    async fn path_owner(&self, path: &Path) -> Result<Option<String>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id FROM media_items WHERE local_path = ?1",
            [path.to_string_lossy()],
            |row| row.get(0),
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn failed(&self) -> Result<Vec<SyncRecord>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM media_items WHERE status = 'failed' ORDER BY created_at"
            ))
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], row_to_record)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(records)
    }

    async fn summary(&self) -> Result<LedgerSummary, StateError> {
        let conn = self.lock()?;
        let mut summary = LedgerSummary::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM media_items GROUP BY status")
            .map_err(StateError::query)?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(StateError::query)?;
        for row in counts {
            let (status, count) = row.map_err(StateError::query)?;
            let count = count as u64;
            summary.total += count;
            match SyncStatus::from_str(&status) {
                Some(SyncStatus::Downloaded) => summary.downloaded += count,
                Some(SyncStatus::Pending) => summary.pending += count,
                Some(SyncStatus::Skipped) => summary.skipped += count,
                Some(SyncStatus::Failed) => summary.failed += count,
                None => tracing::warn!(status, "Unknown status in ledger"),
            }
        }

        let last_run: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        if let Some((started, completed)) = last_run {
            summary.last_run_started = from_timestamp(started);
            summary.last_run_completed = completed.and_then(from_timestamp);
        }
        Ok(summary)
    }

    async fn start_run(&self) -> Result<i64, StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [Utc::now().timestamp()],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, downloaded = ?2, skipped = ?3, failed = ?4, interrupted = ?5 WHERE id = ?6",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.downloaded as i64,
                stats.skipped as i64,
                stats.failed as i64,
                stats.interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }
}

fn from_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
    let status: String = row.get(12)?;
    let created_at: i64 = row.get(9)?;
    let last_attempt_at: Option<i64> = row.get(10)?;
    let attempts: i64 = row.get(11)?;

    Ok(SyncRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        local_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        last_error: row.get(3)?,
        mime_type: row.get(4)?,
        metadata: MediaMetadata {
            width: row.get(5)?,
            height: row.get(6)?,
            camera_make: row.get(7)?,
            camera_model: row.get(8)?,
        },
        created_at: from_timestamp(created_at).unwrap_or(DateTime::UNIX_EPOCH),
        last_attempt_at: last_attempt_at.and_then(from_timestamp),
        attempts: attempts.max(0) as u32,
        status: SyncStatus::from_str(&status).unwrap_or(SyncStatus::Pending),
    })
}
