//! sync-daemon: Headless vault sync daemon.
//!
//! Keeps a vault's local replica in sync with a remote blob file, using the
//! same sync-core scheduler as every other client.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sync_daemon::watcher::{FileEventKind, FileWatcher};
use sync_daemon::{Args, Daemon, DaemonConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug"
    } else {
        "info,sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::from_args(&args)?;

    info!("Starting sync-daemon");
    info!("Vault path: {:?}", config.vault);
    info!("Remote blob: {:?}", config.remote_dir.join(&config.remote_file));

    let mut daemon = Daemon::open(&config).await?;
    let mut watcher = FileWatcher::new(config.vault.clone())?;
    info!("Replica watcher started");

    daemon.start();
    let mut poll = tokio::time::interval(config.connectivity_poll);

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                if event.kind == FileEventKind::Deleted {
                    info!("Replica file removed; it is rewritten by the next sync");
                }
                if let Err(e) = daemon.on_replica_changed().await {
                    error!("Failed to process replica change: {}", e);
                }
            }

            Some(event) = daemon.next_event() => {
                if let Err(e) = daemon.on_sync_event(event).await {
                    error!("Failed to handle sync event: {}", e);
                }
            }

            _ = poll.tick() => {
                daemon.poll_connectivity().await;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    daemon.shutdown().await?;
    Ok(())
}
