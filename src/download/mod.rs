//! Sync engine: walks the remote index for a date window, consults the
//! ledger for each item and downloads whatever is not yet on disk.
//!
//! Items are processed one at a time. Every state change is committed to the
//! ledger before moving on, so an interrupted run resumes where it stopped.

pub mod error;
pub mod file;
pub mod paths;

use std::collections::HashMap;
use std::fs::FileTimes;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use self::error::{DownloadError, SyncError};
use crate::google::{MediaIndex, MediaItem};
use crate::retry::RetryConfig;
use crate::state::{Ledger, SyncRecord, SyncRunStats, SyncStatus};
use crate::types::{CollisionPolicy, SyncWindow};

/// Subset of application config consumed by the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) directory: PathBuf,
    pub(crate) collision_policy: CollisionPolicy,
    pub(crate) retry: RetryConfig,
    /// Retry items recorded `Failed` by an earlier run.
    pub(crate) retry_failed: bool,
    pub(crate) dry_run: bool,
    pub(crate) no_progress_bar: bool,
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub interrupted: bool,
}

impl From<SyncReport> for SyncRunStats {
    fn from(r: SyncReport) -> Self {
        Self {
            downloaded: r.downloaded,
            skipped: r.skipped,
            failed: r.failed,
            interrupted: r.interrupted,
        }
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    WouldDownload { path: PathBuf },
    AlreadyDownloaded,
    PreviouslySkipped,
    FailedNotRetried,
    Filtered,
    Failed { path: PathBuf, error: DownloadError },
}

enum Destination {
    Free(PathBuf),
    Collision(PathBuf),
}

pub struct SyncEngine<'a> {
    index: &'a dyn MediaIndex,
    ledger: &'a dyn Ledger,
    client: Client,
    config: &'a SyncConfig,
    /// Paths handed out during a dry run, which never reach the ledger.
    planned: Mutex<HashMap<PathBuf, String>>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        index: &'a dyn MediaIndex,
        ledger: &'a dyn Ledger,
        client: Client,
        config: &'a SyncConfig,
    ) -> Self {
        Self {
            index,
            ledger,
            client,
            config,
            planned: Mutex::new(HashMap::new()),
        }
    }

    /// Sync every remote item created inside `window`.
    ///
    /// Per-item download failures are counted and recorded, not returned.
    /// The run aborts only when listing fails after retries, the ledger
    /// cannot be written, or local storage is systemically unusable.
    pub async fn run(
        &self,
        window: &SyncWindow,
        shutdown: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let run_id = if self.config.dry_run {
            self.planned.lock().await.clear();
            None
        } else {
            Some(self.ledger.start_run().await?)
        };

        tracing::info!(
            window = %window,
            directory = %self.config.directory.display(),
            "Starting sync"
        );

        let mut report = SyncReport::default();
        let pb = create_progress_bar(self.config.no_progress_bar);
        let result = self.sync_window(window, shutdown, &pb, &mut report).await;
        pb.finish_and_clear();

        if let Some(run_id) = run_id {
            if let Err(e) = self.ledger.complete_run(run_id, &report.into()).await {
                tracing::warn!(error = %e, "Failed to record sync run");
                result?;
                return Err(e.into());
            }
        }
        result?;

        log_summary(&report, self.config, started.elapsed());
        Ok(report)
    }

    async fn sync_window(
        &self,
        window: &SyncWindow,
        shutdown: &CancellationToken,
        pb: &ProgressBar,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut page_token: Option<String> = None;
        loop {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let page = self
                .index
                .list_media_items(window, page_token.as_deref())
                .await
                .map_err(SyncError::RemoteUnavailable)?;

            for item in &page.items {
                if shutdown.is_cancelled() {
                    report.interrupted = true;
                    pb.suspend(|| tracing::info!("Shutdown requested, stopping sync"));
                    return Ok(());
                }
                pb.set_message(item.filename.clone());
                let outcome = self.process_item(item).await?;
                pb.inc(1);
                self.tally(item, outcome, pb, report)?;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(())
    }

    /// Count and log one outcome. A systemic disk error ends the run.
    fn tally(
        &self,
        item: &MediaItem,
        outcome: ItemOutcome,
        pb: &ProgressBar,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let id = item.id.as_str();
        match outcome {
            ItemOutcome::Downloaded { path, bytes } => {
                report.downloaded += 1;
                pb.suspend(|| {
                    tracing::info!(id, path = %path.display(), bytes, "Downloaded");
                });
            }
            ItemOutcome::WouldDownload { path } => {
                report.downloaded += 1;
                pb.suspend(|| {
                    tracing::info!(id, path = %path.display(), "[DRY RUN] Would download");
                });
            }
            ItemOutcome::AlreadyDownloaded => {
                report.skipped += 1;
                tracing::debug!(id, status = "downloaded", "Already downloaded");
            }
            ItemOutcome::PreviouslySkipped => {
                report.skipped += 1;
                tracing::debug!(id, status = "skipped", "Previously skipped");
            }
            ItemOutcome::FailedNotRetried => {
                report.skipped += 1;
                tracing::debug!(id, status = "failed", "Previously failed, retry disabled");
            }
            ItemOutcome::Filtered => {
                report.skipped += 1;
                pb.suspend(|| {
                    tracing::info!(id, filename = %item.filename, "Skipping excluded file");
                });
            }
            ItemOutcome::Failed { path, error } => {
                report.failed += 1;
                pb.suspend(|| {
                    tracing::error!(id, path = %path.display(), error = %error, "Download failed");
                });
                let systemic = error.is_systemic();
                if let (true, DownloadError::Disk(source)) = (systemic, error) {
                    return Err(SyncError::Filesystem { path, source });
                }
            }
        }
        Ok(())
    }

    async fn process_item(&self, item: &MediaItem) -> Result<ItemOutcome, SyncError> {
        let existing = self.ledger.get(&item.id).await?;
        match existing.as_ref().map(|r| r.status) {
            Some(SyncStatus::Downloaded) => return Ok(ItemOutcome::AlreadyDownloaded),
            Some(SyncStatus::Skipped) => return Ok(ItemOutcome::PreviouslySkipped),
            Some(SyncStatus::Failed) if !self.config.retry_failed => {
                return Ok(ItemOutcome::FailedNotRetried)
            }
            _ => {}
        }

        let Some(planned) = paths::plan(item, &self.config.directory) else {
            if !self.config.dry_run {
                self.ledger.upsert(&SyncRecord::skipped(item)).await?;
            }
            return Ok(ItemOutcome::Filtered);
        };

        let path = match self.resolve_destination(item, planned).await? {
            Destination::Free(path) => path,
            Destination::Collision(path) => {
                // Keep any path this item already owns; never claim the taken one.
                let mut record = existing.unwrap_or_else(|| SyncRecord::pending(item, path.clone()));
                if record.local_path.as_deref() == Some(path.as_path()) {
                    record.local_path = None;
                }
                let error = DownloadError::Collision { path: path.clone() };
                if !self.config.dry_run {
                    self.ledger
                        .upsert(&record.into_failed(error.to_string()))
                        .await?;
                }
                return Ok(ItemOutcome::Failed { path, error });
            }
        };

        if self.config.dry_run {
            self.planned
                .lock()
                .await
                .insert(path.clone(), item.id.clone());
            return Ok(ItemOutcome::WouldDownload { path });
        }

        let record = match existing {
            Some(prev) => SyncRecord {
                status: prev.status,
                attempts: prev.attempts,
                last_error: prev.last_error,
                last_attempt_at: prev.last_attempt_at,
                ..SyncRecord::pending(item, path.clone())
            },
            None => SyncRecord::pending(item, path.clone()),
        };
        self.ledger.upsert(&record).await?;

        match self.fetch(item, &path).await {
            Ok(bytes) => {
                self.ledger
                    .upsert(&record.into_downloaded(path.clone()))
                    .await?;
                Ok(ItemOutcome::Downloaded { path, bytes })
            }
            Err(error) => {
                self.ledger
                    .upsert(&record.into_failed(error.to_string()))
                    .await?;
                Ok(ItemOutcome::Failed { path, error })
            }
        }
    }

    async fn resolve_destination(
        &self,
        item: &MediaItem,
        planned: PathBuf,
    ) -> Result<Destination, SyncError> {
        if self.is_free_for(item, &planned).await? {
            return Ok(Destination::Free(planned));
        }
        match self.config.collision_policy {
            CollisionPolicy::Fail => Ok(Destination::Collision(planned)),
            CollisionPolicy::SuffixId => {
                let alt = paths::with_id_suffix(&planned, &item.id);
                tracing::debug!(
                    id = %item.id,
                    planned = %planned.display(),
                    path = %alt.display(),
                    "Name collision, using id suffix"
                );
                if self.is_free_for(item, &alt).await? {
                    Ok(Destination::Free(alt))
                } else {
                    Ok(Destination::Collision(alt))
                }
            }
        }
    }

    /// A path is free for `item` if the ledger (or, in a dry run, an earlier
    /// planned download) attributes it to `item`, or if nothing claims it and
    /// nothing exists there on disk.
    async fn is_free_for(&self, item: &MediaItem, path: &Path) -> Result<bool, SyncError> {
        if let Some(owner) = self.planned.lock().await.get(path) {
            return Ok(*owner == item.id);
        }
        match self.ledger.path_owner(path).await? {
            Some(owner) => Ok(owner == item.id),
            None => Ok(!tokio::fs::try_exists(path).await.unwrap_or(true)),
        }
    }

    async fn fetch(&self, item: &MediaItem, path: &Path) -> Result<u64, DownloadError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::debug!(id = %item.id, path = %path.display(), "Downloading");
        let bytes =
            file::download_file(&self.client, &item.download_url(), path, &self.config.retry)
                .await?;

        if let Err(e) = set_file_mtime(path, item.creation_time.timestamp()) {
            tracing::warn!(path = %path.display(), error = %e, "Could not set mtime");
        }
        Ok(bytes)
    }
}

/// Spinner showing items processed so far; the total is not known upfront.
///
/// Hidden when the user passed `--no-progress-bar` or stdout is not a TTY.
fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {pos} items {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn log_summary(report: &SyncReport, config: &SyncConfig, elapsed: Duration) {
    if config.dry_run {
        tracing::info!("── Dry Run Summary ──");
        tracing::info!(
            "  {} would be downloaded, {} skipped, {} failed",
            report.downloaded,
            report.skipped,
            report.failed
        );
    } else {
        tracing::info!("── Summary ──");
        tracing::info!(
            "  {} downloaded, {} skipped, {} failed",
            report.downloaded,
            report.skipped,
            report.failed
        );
    }
    if report.interrupted {
        tracing::info!("  interrupted; rerun to resume");
    }
    tracing::info!("  destination: {}", config.directory.display());
    tracing::info!("  elapsed: {}", format_duration(elapsed));
}

pub(crate) fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Set the modification and access times of a file to the given Unix
/// timestamp. Dates before 1970 are supported.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::{MediaMetadata, MediaPage, RemoteError, StaticIndex};
    use crate::state::SqliteLedger;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(server: &MockServer, id: &str, filename: &str, y: i32, m: u32, d: u32) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            filename: filename.to_string(),
            creation_time: Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            base_url: format!("{}/{}", server.uri(), id),
            mime_type: Some("image/jpeg".to_string()),
            metadata: MediaMetadata::default(),
        }
    }

    fn window() -> SyncWindow {
        SyncWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(),
        )
        .unwrap()
    }

    fn config(dir: &Path) -> SyncConfig {
        SyncConfig {
            directory: dir.to_path_buf(),
            collision_policy: CollisionPolicy::SuffixId,
            retry: RetryConfig {
                max_retries: 0,
                min_delay_secs: 0,
                max_delay_secs: 0,
            },
            retry_failed: true,
            dry_run: false,
            no_progress_bar: true,
        }
    }

    /// Every content URL answers with a body derived from its path.
    async fn serve_all(server: &MockServer) {
        Mock::given(method("GET"))
            .respond_with(|req: &wiremock::Request| {
                ResponseTemplate::new(200).set_body_string(format!("bytes of {}", req.url.path()))
            })
            .mount(server)
            .await;
    }

    async fn scenario_items(server: &MockServer) -> Vec<MediaItem> {
        vec![
            item(server, "a", "IMG_0001.jpg", 2024, 1, 15),
            item(server, "w", "IMG-20240115-WA0003.jpg", 2024, 1, 16),
            item(server, "b", "IMG_0002.jpg", 2024, 1, 20),
            item(server, "c", "IMG_0003.jpg", 2024, 2, 1),
        ]
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn snapshot(ledger: &SqliteLedger, ids: &[&str]) -> Vec<Option<SyncRecord>> {
        let mut out = Vec::new();
        for id in ids {
            out.push(ledger.get(id).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(scenario_items(&server).await);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);
        let report = engine.run(&window(), &CancellationToken::new()).await.unwrap();

        assert_eq!(
            report,
            SyncReport {
                downloaded: 3,
                skipped: 1,
                failed: 0,
                interrupted: false
            }
        );
        assert_eq!(
            files_in(&dir.path().join("2024-01")),
            ["IMG_0001.jpg", "IMG_0002.jpg"]
        );
        assert_eq!(files_in(&dir.path().join("2024-02")), ["IMG_0003.jpg"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("2024-02/IMG_0003.jpg")).unwrap(),
            "bytes of /c=d"
        );

        let summary = ledger.summary().await.unwrap();
        assert_eq!(summary.downloaded, 3);
        assert_eq!(summary.skipped, 1);
        let skipped = ledger.get("w").await.unwrap().unwrap();
        assert_eq!(skipped.status, SyncStatus::Skipped);
        assert!(skipped.local_path.is_none());
        assert!(summary.last_run_completed.is_some());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(scenario_items(&server).await);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);

        engine.run(&window(), &CancellationToken::new()).await.unwrap();
        let before = snapshot(&ledger, &["a", "w", "b", "c"]).await;
        let requests_before = server.received_requests().await.unwrap().len();

        let report = engine.run(&window(), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 4);
        assert_eq!(snapshot(&ledger, &["a", "w", "b", "c"]).await, before);
        assert_eq!(server.received_requests().await.unwrap().len(), requests_before);
    }

    /// Cancels the token when the second page is requested, so exactly the
    /// first page is processed.
    struct CancelAfterFirstPage {
        inner: StaticIndex,
        token: CancellationToken,
    }

    #[async_trait]
    impl MediaIndex for CancelAfterFirstPage {
        async fn list_media_items(
            &self,
            window: &SyncWindow,
            page_token: Option<&str>,
        ) -> Result<MediaPage, RemoteError> {
            if page_token.is_some() {
                self.token.cancel();
            }
            self.inner.list_media_items(window, page_token).await
        }

        async fn list_albums(
            &self,
            page_token: Option<&str>,
        ) -> Result<crate::google::AlbumPage, RemoteError> {
            self.inner.list_albums(page_token).await
        }

        async fn list_album_items(
            &self,
            album_id: &str,
            page_token: Option<&str>,
        ) -> Result<MediaPage, RemoteError> {
            self.inner.list_album_items(album_id, page_token).await
        }
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_remaining_items() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let items = vec![
            item(&server, "a", "a.jpg", 2024, 1, 2),
            item(&server, "b", "b.jpg", 2024, 1, 3),
            item(&server, "c", "c.jpg", 2024, 1, 4),
            item(&server, "d", "d.jpg", 2024, 1, 5),
        ];
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let token = CancellationToken::new();
        let interrupting = CancelAfterFirstPage {
            inner: StaticIndex::new(items.clone()),
            token: token.clone(),
        };
        let first = SyncEngine::new(&interrupting, &ledger, Client::new(), &cfg)
            .run(&window(), &token)
            .await
            .unwrap();
        assert!(first.interrupted);
        assert_eq!(first.downloaded, 2);

        let index = StaticIndex::new(items);
        let second = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.downloaded, 2);
        assert_eq!(second.skipped, 2);

        let mut paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, ["/a=d", "/b=d", "/c=d", "/d=d"]);
    }

    #[tokio::test]
    async fn test_failed_item_retried_on_next_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let index = StaticIndex::new(vec![item(&server, "a", "a.jpg", 2024, 1, 2)]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);

        let report = engine.run(&window(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        let failed = ledger.get("a").await.unwrap().unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.is_some());
        assert!(!dir.path().join("2024-01/a.jpg").exists());

        server.reset().await;
        serve_all(&server).await;

        let report = engine.run(&window(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.downloaded, 1);
        let done = ledger.get("a").await.unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Downloaded);
        assert_eq!(done.attempts, 1);
        assert!(dir.path().join("2024-01/a.jpg").exists());
    }

    #[tokio::test]
    async fn test_failed_item_left_alone_when_retry_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let index = StaticIndex::new(vec![item(&server, "a", "a.jpg", 2024, 1, 2)]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.retry_failed = false;
        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);

        engine.run(&window(), &CancellationToken::new()).await.unwrap();
        let requests = server.received_requests().await.unwrap().len();

        let report = engine.run(&window(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(server.received_requests().await.unwrap().len(), requests);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_run() {
        let server = MockServer::start().await;
        let mut index = StaticIndex::new(vec![item(&server, "a", "a.jpg", 2024, 1, 2)]);
        index.fail_listing = true;
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let err = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
        // the run is still closed out
        assert!(ledger.summary().await.unwrap().last_run_completed.is_some());
    }

    #[tokio::test]
    async fn test_same_name_same_month_gets_id_suffix() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(vec![
            item(&server, "first", "IMG_0001.jpg", 2024, 1, 2),
            item(&server, "second", "IMG_0001.jpg", 2024, 1, 9),
        ]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        let report = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, 2);

        let suffixed = format!("IMG_0001-{}.jpg", paths::id_suffix("second"));
        let month = dir.path().join("2024-01");
        assert_eq!(
            std::fs::read_to_string(month.join("IMG_0001.jpg")).unwrap(),
            "bytes of /first=d"
        );
        assert_eq!(
            std::fs::read_to_string(month.join(&suffixed)).unwrap(),
            "bytes of /second=d"
        );
        let second = ledger.get("second").await.unwrap().unwrap();
        assert_eq!(second.local_path, Some(month.join(suffixed)));
    }

    #[tokio::test]
    async fn test_collision_fail_policy_records_failure() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(vec![
            item(&server, "first", "IMG_0001.jpg", 2024, 1, 2),
            item(&server, "second", "IMG_0001.jpg", 2024, 1, 9),
        ]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.collision_policy = CollisionPolicy::Fail;

        let report = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("2024-01/IMG_0001.jpg")).unwrap(),
            "bytes of /first=d"
        );
        let second = ledger.get("second").await.unwrap().unwrap();
        assert_eq!(second.status, SyncStatus::Failed);
        assert!(second.local_path.is_none());
    }

    #[tokio::test]
    async fn test_foreign_file_is_never_overwritten() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(vec![item(&server, "a", "a.jpg", 2024, 1, 2)]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let month = dir.path().join("2024-01");
        std::fs::create_dir_all(&month).unwrap();
        std::fs::write(month.join("a.jpg"), "user's own file").unwrap();
        let cfg = config(dir.path());

        SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(month.join("a.jpg")).unwrap(),
            "user's own file"
        );
        let record = ledger.get("a").await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Downloaded);
        assert_ne!(record.local_path, Some(month.join("a.jpg")));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let index = StaticIndex::new(scenario_items(&server).await);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.dry_run = true;

        let report = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.downloaded, 3);
        assert_eq!(report.skipped, 1);
        assert!(files_in(dir.path()).is_empty());
        assert_eq!(ledger.summary().await.unwrap().total, 0);
        assert!(ledger.summary().await.unwrap().last_run_started.is_none());
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_processes_nothing() {
        let server = MockServer::start().await;
        let index = StaticIndex::new(scenario_items(&server).await);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let token = CancellationToken::new();
        token.cancel();

        let report = SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &token)
            .await
            .unwrap();
        assert!(report.interrupted);
        assert_eq!(report.downloaded + report.skipped + report.failed, 0);
    }

    #[tokio::test]
    async fn test_downloaded_file_mtime_is_creation_time() {
        let server = MockServer::start().await;
        serve_all(&server).await;
        let it = item(&server, "a", "a.jpg", 2024, 1, 2);
        let expected = it.creation_time.timestamp();
        let index = StaticIndex::new(vec![it]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());

        SyncEngine::new(&index, &ledger, Client::new(), &cfg)
            .run(&window(), &CancellationToken::new())
            .await
            .unwrap();

        let mtime = std::fs::metadata(dir.path().join("2024-01/a.jpg"))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(mtime as i64, expected);
    }

    #[tokio::test]
    async fn test_systemic_disk_error_aborts_run() {
        let server = MockServer::start().await;
        let it = item(&server, "a", "a.jpg", 2024, 1, 2);
        let index = StaticIndex::new(vec![]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);
        let pb = ProgressBar::hidden();
        let path = dir.path().join("2024-01/a.jpg");

        let mut report = SyncReport::default();
        let full = ItemOutcome::Failed {
            path: path.clone(),
            error: DownloadError::Disk(std::io::Error::from(std::io::ErrorKind::StorageFull)),
        };
        let result = engine.tally(&it, full, &pb, &mut report);
        assert!(
            matches!(result, Err(SyncError::Filesystem { path: ref p, .. }) if *p == path),
            "{result:?}"
        );
        assert_eq!(report.failed, 1);

        let mut report = SyncReport::default();
        let denied = ItemOutcome::Failed {
            path,
            error: DownloadError::Disk(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )),
        };
        assert!(engine.tally(&it, denied, &pb, &mut report).is_ok());
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_dry_run_plans_collisions_like_a_real_run() {
        let server = MockServer::start().await;
        let first = item(&server, "first", "IMG_0001.jpg", 2024, 1, 3);
        let second = item(&server, "second", "IMG_0001.jpg", 2024, 1, 9);
        let index = StaticIndex::new(vec![]);
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.dry_run = true;
        let engine = SyncEngine::new(&index, &ledger, Client::new(), &cfg);

        let planned = dir.path().join("2024-01/IMG_0001.jpg");
        let ItemOutcome::WouldDownload { path: a } = engine.process_item(&first).await.unwrap()
        else {
            panic!("expected a planned download");
        };
        let ItemOutcome::WouldDownload { path: b } = engine.process_item(&second).await.unwrap()
        else {
            panic!("expected a planned download");
        };
        assert_eq!(a, planned);
        assert_eq!(b, paths::with_id_suffix(&planned, "second"));

        // the same item planned again keeps its path
        let ItemOutcome::WouldDownload { path: again } =
            engine.process_item(&first).await.unwrap()
        else {
            panic!("expected a planned download");
        };
        assert_eq!(again, planned);
        drop(engine);

        cfg.collision_policy = CollisionPolicy::Fail;
        let strict = SyncEngine::new(&index, &ledger, Client::new(), &cfg);
        strict.process_item(&first).await.unwrap();
        assert!(matches!(
            strict.process_item(&second).await.unwrap(),
            ItemOutcome::Failed { error: DownloadError::Collision { .. }, .. }
        ));
        assert_eq!(ledger.summary().await.unwrap().total, 0);
    }

    #[test]
    fn test_set_file_mtime_negative_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("old.jpg");
        std::fs::write(&p, b"x").unwrap();
        set_file_mtime(&p, -86400).unwrap();
    }

    #[test]
    fn test_set_file_mtime_nonexistent_file() {
        assert!(set_file_mtime(Path::new("/nonexistent/file.jpg"), 0).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(754)), "12m 34s");
        assert_eq!(format_duration(Duration::from_secs(5025)), "1h 23m 45s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        assert!(create_progress_bar(true).is_hidden());
    }
}
