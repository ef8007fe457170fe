//! gphotos-backup: incremental Google Photos backup.
//!
//! Lists media items for a date window through the Library API, downloads
//! each one into `<directory>/YYYY-MM/`, records progress in a SQLite ledger
//! so interrupted runs resume, and mirrors albums as symlink folders.

#![warn(clippy::all)]

mod albums;
mod cli;
mod config;
mod download;
mod google;
mod logfile;
mod retry;
mod shutdown;
mod state;
mod types;
mod verify;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use albums::{AlbumLinker, LinkReport};
use cli::{Command, GlobalArgs};
use config::{Config, RemoteConfig, StoragePaths};
use download::error::SyncError;
use download::SyncEngine;
use google::{GooglePhotosClient, MediaIndex, RemoteError};
use logfile::RotatingFile;
use retry::RetryConfig;
use state::{Ledger, SqliteLedger};

/// The log file always gets debug output from this crate.
const FILE_LOG_FILTER: &str = "info,gphotos_backup=debug";

fn init_logging(global: &GlobalArgs) -> anyhow::Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(global.log_level.as_filter()));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file = match &global.log_file {
        Some(path) => {
            let path = config::expand_tilde(path);
            let file = RotatingFile::open(&path, logfile::MAX_LOG_BYTES, logfile::LOG_BACKUPS)
                .with_context(|| format!("Cannot open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::new(FILE_LOG_FILTER)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();
    Ok(())
}

/// Wrap a 401/403 with a hint; the token cannot be refreshed from here.
fn auth_failure(e: RemoteError) -> anyhow::Error {
    anyhow::Error::new(e).context(
        "Access token was rejected. Refresh it (it needs the photoslibrary.readonly scope) and rerun",
    )
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn open_ledger(path: &Path, dry_run: bool) -> anyhow::Result<SqliteLedger> {
    if dry_run && !path.exists() {
        tracing::info!(path = %path.display(), "No ledger yet; dry run starts from an empty one");
        return Ok(SqliteLedger::open_in_memory()?);
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    Ok(SqliteLedger::open(path).await?)
}

/// Open an existing ledger, or report that there is none yet.
async fn open_existing_ledger(path: &Path) -> anyhow::Result<Option<SqliteLedger>> {
    if !path.exists() {
        println!("No ledger found at {}", path.display());
        println!("Run a sync first to create it.");
        return Ok(None);
    }
    Ok(Some(SqliteLedger::open(path).await?))
}

fn remote_client(remote: &RemoteConfig, retry: RetryConfig) -> anyhow::Result<GooglePhotosClient> {
    let token = remote.load_token(Utc::now())?;
    Ok(GooglePhotosClient::new(token, retry)?)
}

async fn refresh_album_links(
    index: &dyn MediaIndex,
    ledger: &dyn Ledger,
    albums_root: &Path,
    dry_run: bool,
) -> anyhow::Result<LinkReport> {
    let albums = match albums::fetch_album_entries(index).await {
        Ok(albums) => albums,
        Err(e) if e.is_auth_failure() => return Err(auth_failure(e)),
        Err(e) => return Err(anyhow::Error::new(e).context("Failed to list albums")),
    };
    let report = AlbumLinker::new(ledger, albums_root.to_path_buf(), dry_run)
        .link_albums(&albums)
        .await?;

    tracing::info!(
        linked = report.linked,
        missing = report.missing,
        failed = report.failed,
        albums_root = %albums_root.display(),
        "Album links refreshed"
    );
    if report.failed > 0 {
        tracing::warn!("{} album links could not be created", report.failed);
    }
    Ok(report)
}

async fn run_sync(global: &GlobalArgs, args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = Config::from_sync_args(global, &args, Utc::now().date_naive())?;
    tracing::debug!(?config, "Resolved configuration");

    let remote = remote_client(&config.remote, config.retry_config())?;
    if !config.dry_run {
        tokio::fs::create_dir_all(&config.paths.directory)
            .await
            .with_context(|| format!("Cannot create {}", config.paths.directory.display()))?;
    }
    let ledger = open_ledger(&config.paths.ledger_path, config.dry_run).await?;
    let shutdown_token = shutdown::install_signal_handler()?;

    let sync_config = config.sync_config();
    let engine = SyncEngine::new(&remote, &ledger, remote.download_client(), &sync_config);
    let report = match engine.run(&config.window, &shutdown_token).await {
        Ok(report) => report,
        Err(SyncError::RemoteUnavailable(e)) if e.is_auth_failure() => {
            return Err(auth_failure(e))
        }
        Err(e) => return Err(e.into()),
    };

    if config.skip_albums {
        tracing::debug!("Album linking disabled");
    } else if report.interrupted {
        tracing::info!("Skipping album links after interrupted sync");
    } else {
        refresh_album_links(
            &remote,
            &ledger,
            &config.paths.albums_directory,
            config.dry_run,
        )
        .await?;
    }

    if report.failed > 0 {
        anyhow::bail!("{} items failed to download; rerun to retry them", report.failed);
    }
    Ok(())
}

async fn run_link(global: &GlobalArgs, args: cli::LinkArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::from_args(global)?;
    let Some(ledger) = open_existing_ledger(&paths.ledger_path).await? else {
        return Ok(());
    };
    let remote = remote_client(&RemoteConfig::from_args(&args.remote), RetryConfig::default())?;

    let report =
        refresh_album_links(&remote, &ledger, &paths.albums_directory, args.dry_run).await?;
    println!(
        "Albums: {} linked, {} missing, {} failed",
        report.linked, report.missing, report.failed
    );
    Ok(())
}

async fn run_status(global: &GlobalArgs, args: cli::StatusArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::from_args(global)?;
    let Some(ledger) = open_existing_ledger(&paths.ledger_path).await? else {
        return Ok(());
    };
    let summary = ledger.summary().await?;

    println!("Ledger: {}", ledger.path().display());
    println!();
    println!("Items:");
    println!("  Total:      {}", summary.total);
    println!("  Downloaded: {}", summary.downloaded);
    println!("  Pending:    {}", summary.pending);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Failed:     {}", summary.failed);
    println!();

    if let Some(started) = &summary.last_run_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_run_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed items:");
        for record in ledger.failed().await? {
            println!(
                "  {} ({}) after {} attempt(s) - {}",
                record.filename,
                record.id,
                record.attempts,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

async fn run_verify(global: &GlobalArgs) -> anyhow::Result<()> {
    let paths = StoragePaths::from_args(global)?;
    let Some(ledger) = open_existing_ledger(&paths.ledger_path).await? else {
        return Ok(());
    };

    let report = verify::check(&ledger, &paths.directory).await?;
    for (id, path) in &report.phantoms {
        println!("MISSING: {} ({})", path.display(), id);
    }
    for path in &report.orphans {
        println!("UNTRACKED: {}", path.display());
    }

    println!();
    println!("Results:");
    println!("  Verified:  {}", report.verified);
    println!("  Missing:   {}", report.phantoms.len());
    println!("  Untracked: {}", report.orphans.len());

    if !report.is_consistent() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_reset_state(global: &GlobalArgs, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = StoragePaths::from_args(global)?.ledger_path;

    if !db_path.exists() {
        println!("No ledger found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the ledger at:");
        println!("  {}", db_path.display());
        println!("Downloaded files are kept, but the next sync will not know about them.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)
        .with_context(|| format!("Cannot delete {}", db_path.display()))?;
    println!("Ledger deleted.");

    for suffix in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(sibling_with_suffix(&db_path, suffix));
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(&cli.global)?;

    match cli.effective_command() {
        Command::Sync(args) => run_sync(&cli.global, args).await,
        Command::Link(args) => run_link(&cli.global, args).await,
        Command::Status(args) => run_status(&cli.global, args).await,
        Command::Verify => run_verify(&cli.global).await,
        Command::ResetState(args) => run_reset_state(&cli.global, args).await,
    }
}
