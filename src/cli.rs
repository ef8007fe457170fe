use clap::{Args, Parser, Subcommand};

use crate::types::{CollisionPolicy, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "gphotos-backup",
    version,
    about = "Back up Google Photos into a year-month tree with album symlinks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub global: GlobalArgs,
}

impl Cli {
    /// The subcommand to run; a bare invocation means `sync` with defaults.
    pub fn effective_command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Sync(SyncOnly::parse_from(["gphotos-backup"]).args))
    }
}

/// Parser used only to materialise `SyncArgs` defaults for a bare invocation.
#[derive(Parser, Debug)]
struct SyncOnly {
    #[command(flatten)]
    args: SyncArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Local directory for the year-month tree
    #[arg(short = 'd', long, global = true, env = "GPHOTOS_DIRECTORY", default_value = "~/gphotos-backup")]
    pub directory: String,

    /// Directory for album symlinks [default: <directory>/Albums]
    #[arg(long, global = true)]
    pub albums_directory: Option<String>,

    /// Ledger database path [default: <directory>/.gphotos-backup.db]
    #[arg(long, global = true)]
    pub ledger: Option<String>,

    /// Console log level (overridden by RUST_LOG)
    #[arg(long, value_enum, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Also write a debug-level log to this file
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download new items, then refresh album links (default)
    Sync(SyncArgs),
    /// Refresh album links from the ledger without downloading
    Link(LinkArgs),
    /// Show ledger summary
    Status(StatusArgs),
    /// Check the year-month tree against the ledger
    Verify,
    /// Delete the ledger and start fresh
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Access token with the photoslibrary.readonly scope
    #[arg(long, env = "GPHOTOS_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// JSON token file written by an OAuth installed-app flow
    #[arg(long, default_value = "~/.gphotos-backup/token.json")]
    pub token_file: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Earliest creation date: ISO date or interval (e.g. 2024-01-01 or 30d)
    #[arg(long, default_value = "365d")]
    pub start_date: String,

    /// Latest creation date: ISO date or interval [default: today]
    #[arg(long)]
    pub end_date: Option<String>,

    /// What to do when two items map to the same file name
    #[arg(long, value_enum, default_value = "suffix-id")]
    pub collision_policy: CollisionPolicy,

    /// Do not retry items that failed in an earlier run
    #[arg(long)]
    pub no_retry_failed: bool,

    /// Skip album linking after the download pass
    #[arg(long)]
    pub skip_albums: bool,

    /// Log what would happen without downloading or writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Retries per download and per API page on transient errors
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Minimum seconds between retries
    #[arg(long, default_value_t = 4)]
    pub retry_delay: u64,

    /// Disable the progress spinner
    #[arg(long)]
    pub no_progress_bar: bool,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LinkArgs {
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub remote: RemoteArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// List failed items with their last error
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}
