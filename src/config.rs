use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};

use crate::cli::{GlobalArgs, RemoteArgs, SyncArgs};
use crate::download::SyncConfig;
use crate::google::token::{self, TokenError};
use crate::retry::RetryConfig;
use crate::types::{CollisionPolicy, SyncWindow};

const LEDGER_FILE_NAME: &str = ".gphotos-backup.db";
const ALBUMS_DIR_NAME: &str = "Albums";

/// Ceiling for the retry backoff, unless `--retry-delay` asks for more.
const DEFAULT_MAX_RETRY_DELAY_SECS: u64 = 10;

/// Where everything lives on disk. All paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub directory: PathBuf,
    pub albums_directory: PathBuf,
    pub ledger_path: PathBuf,
}

impl StoragePaths {
    pub fn from_args(global: &GlobalArgs) -> anyhow::Result<Self> {
        let directory = absolute(&global.directory)?;
        let albums_directory = match &global.albums_directory {
            Some(d) => absolute(d)?,
            None => directory.join(ALBUMS_DIR_NAME),
        };
        let ledger_path = match &global.ledger {
            Some(p) => absolute(p)?,
            None => directory.join(LEDGER_FILE_NAME),
        };
        Ok(Self {
            directory,
            albums_directory,
            ledger_path,
        })
    }
}

/// Where the bearer token comes from.
pub struct RemoteConfig {
    pub access_token: Option<String>,
    pub token_file: PathBuf,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("token_file", &self.token_file)
            .finish()
    }
}

impl RemoteConfig {
    pub fn from_args(args: &RemoteArgs) -> Self {
        Self {
            access_token: args.access_token.clone(),
            token_file: expand_tilde(&args.token_file),
        }
    }

    pub fn load_token(&self, now: DateTime<Utc>) -> Result<String, TokenError> {
        token::load_access_token(self.access_token.as_deref(), &self.token_file, now)
    }
}

/// Resolved settings for a `sync` run.
#[derive(Debug)]
pub struct Config {
    pub paths: StoragePaths,
    pub remote: RemoteConfig,
    pub window: SyncWindow,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub collision_policy: CollisionPolicy,
    pub retry_failed: bool,
    pub skip_albums: bool,
    pub dry_run: bool,
    pub no_progress_bar: bool,
}

impl Config {
    pub fn from_sync_args(
        global: &GlobalArgs,
        args: &SyncArgs,
        today: NaiveDate,
    ) -> anyhow::Result<Self> {
        let start = parse_date_or_interval(&args.start_date, today)
            .context("Invalid --start-date")?;
        let end = match &args.end_date {
            Some(s) => parse_date_or_interval(s, today).context("Invalid --end-date")?,
            None => today,
        };
        let window = SyncWindow::new(start, end)?;

        Ok(Self {
            paths: StoragePaths::from_args(global)?,
            remote: RemoteConfig::from_args(&args.remote),
            window,
            max_retries: args.max_retries,
            retry_delay_secs: args.retry_delay,
            collision_policy: args.collision_policy,
            retry_failed: !args.no_retry_failed,
            skip_albums: args.skip_albums,
            dry_run: args.dry_run,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            min_delay_secs: self.retry_delay_secs,
            max_delay_secs: self.retry_delay_secs.max(DEFAULT_MAX_RETRY_DELAY_SECS),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            directory: self.paths.directory.clone(),
            collision_policy: self.collision_policy,
            retry: self.retry_config(),
            retry_failed: self.retry_failed,
            dry_run: self.dry_run,
            no_progress_bar: self.no_progress_bar,
        }
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn absolute(path: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_tilde(path);
    std::path::absolute(&expanded)
        .with_context(|| format!("Cannot resolve path {}", Path::new(path).display()))
}

/// Parse an ISO date (`2024-01-15`) or a day interval back from `today`
/// (`30d`).
pub(crate) fn parse_date_or_interval(s: &str, today: NaiveDate) -> anyhow::Result<NaiveDate> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<u32>() {
            return today
                .checked_sub_days(chrono::Days::new(u64::from(days)))
                .with_context(|| format!("Interval '{}' reaches before the supported date range", s));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date);
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02) or interval (20d)",
        s
    )
}
