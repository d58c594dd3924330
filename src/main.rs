//! IM Bridge - serves messaging sessions to a host process.
//!
//! The host writes `{"type":"call",...}` lines to stdin and reads results,
//! notifications and signature requests from stdout. Logs go to stderr.

mod cli;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::Args;
use im_bridge::host::{immediate, stdio, StdioHost};
use im_bridge::{Bridge, MemorySdk};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    // Initialize logging
    init_logging(args.verbose, args.log_filter.as_deref())?;

    let config = args.bridge_config();
    info!(
        "Starting bridge (queue: {}, query limit: {})",
        config.command_buffer, config.default_query_limit
    );

    let sdk = MemorySdk::with_event_buffer(args.event_buffer);
    let (host, outbox) = StdioHost::channel();
    let bridge = Bridge::new(sdk, host.clone(), immediate(), config);

    let served = tokio::select! {
        result = stdio::serve(bridge.clone(), host, outbox, tokio::io::stdin(), tokio::io::stdout()) => {
            result.context("Host connection failed")
        }
        _ = interrupted() => {
            info!("Interrupted, shutting down...");
            Ok(())
        }
    };

    bridge.shutdown().await;
    info!("Bridge stopped");
    served
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Initialize the tracing subscriber for logging
fn init_logging(verbose: bool, directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives).context("Invalid log filter")?,
        None if verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
    Ok(())
}
