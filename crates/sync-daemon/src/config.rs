//! Command-line arguments and validated daemon configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use sync_core::settings::{SyncSettings, DEFAULT_DEBOUNCE, MAX_INTERVAL, MIN_INTERVAL};
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Offline-first vault sync daemon")]
pub struct Args {
    /// Path to the vault directory
    #[arg(short, long, env = "SYNC_VAULT")]
    pub vault: PathBuf,

    /// Path to the remote blob file (e.g. on a mounted share)
    #[arg(short, long, env = "SYNC_REMOTE")]
    pub remote: PathBuf,

    /// Minutes between periodic syncs (1-120)
    #[arg(long, env = "SYNC_INTERVAL_MINUTES", default_value_t = 5)]
    pub interval_minutes: u64,

    /// Quiet period after a local change before syncing, in milliseconds
    #[arg(long, env = "SYNC_DEBOUNCE_MS", default_value_t = DEFAULT_DEBOUNCE.as_millis() as u64)]
    pub debounce_ms: u64,

    /// Seconds between remote reachability checks
    #[arg(long, default_value_t = 30)]
    pub connectivity_poll_secs: u64,

    /// Only sync on startup and when reachability returns
    #[arg(long)]
    pub no_auto_sync: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Vault directory does not exist: {0}")]
    VaultMissing(PathBuf),

    #[error("Remote path must name a file: {0}")]
    RemoteNotAFile(PathBuf),

    #[error("Sync interval must be between {min} and {max} minutes, got {got}")]
    IntervalOutOfRange { got: u64, min: u64, max: u64 },

    #[error("Connectivity poll interval must be at least one second")]
    PollIntervalZero,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub vault: PathBuf,
    /// Directory holding the remote blob
    pub remote_dir: PathBuf,
    /// Blob file name inside `remote_dir`
    pub remote_file: String,
    pub settings: SyncSettings,
    pub connectivity_poll: Duration,
}

impl DaemonConfig {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        if !args.vault.is_dir() {
            return Err(ConfigError::VaultMissing(args.vault.clone()));
        }

        let remote_file = args
            .remote
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ConfigError::RemoteNotAFile(args.remote.clone()))?;
        let remote_dir = match args.remote.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let min = MIN_INTERVAL.as_secs() / 60;
        let max = MAX_INTERVAL.as_secs() / 60;
        if !(min..=max).contains(&args.interval_minutes) {
            return Err(ConfigError::IntervalOutOfRange {
                got: args.interval_minutes,
                min,
                max,
            });
        }
        if args.connectivity_poll_secs == 0 {
            return Err(ConfigError::PollIntervalZero);
        }

        let settings = SyncSettings::new(
            !args.no_auto_sync,
            Duration::from_secs(args.interval_minutes * 60),
        )
        .with_debounce(Duration::from_millis(args.debounce_ms));

        Ok(Self {
            vault: args.vault.clone(),
            remote_dir,
            remote_file,
            settings,
            connectivity_poll: Duration::from_secs(args.connectivity_poll_secs),
        })
    }

    /// Configuration with default settings, used by tests and embedders.
    pub fn new(vault: PathBuf, remote_dir: PathBuf, remote_file: impl Into<String>) -> Self {
        Self {
            vault,
            remote_dir,
            remote_file: remote_file.into(),
            settings: SyncSettings::default(),
            connectivity_poll: Duration::from_secs(30),
        }
    }
}
