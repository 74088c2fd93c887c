//! Relay Daemon - Health-Aware Dispatch Host
//!
//! Loads a registry document, builds HTTP adapters for every server that
//! declares an endpoint, keeps their health monitored and periodically logs
//! a diagnostics report (system health, cache stats, performance metrics).
//!
//! # Usage
//!
//! ```bash
//! # Start with the default document ($XDG_CONFIG_HOME/relay/registry.toml)
//! relay-daemon
//!
//! # Custom document, report every 30 seconds
//! relay-daemon --config /etc/relay/registry.toml --report-interval-secs 30
//!
//! # Validate a document and exit
//! relay-daemon --config registry.toml --check
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload the registry document

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use relay_core::ConfigOverrides;

use server::DaemonServer;

/// Relay Daemon - health-aware request routing across backend providers
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Registry document path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between diagnostics reports
    #[arg(long, env = "RELAY_REPORT_INTERVAL_SECS", default_value_t = 60)]
    report_interval_secs: u64,

    /// Validate the registry document and exit
    #[arg(long)]
    check: bool,

    /// Override the health probe interval (seconds)
    #[arg(long, value_name = "SECS")]
    health_interval_secs: Option<u64>,

    /// Override the probe concurrency cap
    #[arg(long, value_name = "N")]
    max_concurrent_probes: Option<usize>,

    /// Override the cache capacity
    #[arg(long, value_name = "N")]
    cache_max_entries: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            health_interval_secs: self.health_interval_secs,
            max_concurrent_probes: self.max_concurrent_probes,
            cache_max_entries: self.cache_max_entries,
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let overrides = args.overrides();

    if args.check {
        let config = server::load_document(args.config.clone(), &overrides)?;
        println!(
            "{}: {} servers, {} routing rules (source: {})",
            config
                .config_file_path
                .as_ref()
                .map_or_else(|| "<defaults>".to_string(), |p| p.display().to_string()),
            config.servers.len(),
            config.routing_rules.len(),
            config.source()
        );
        for method in config.declared_methods() {
            println!("  {method}");
        }
        return Ok(());
    }

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Install handlers before anything is spawned so failures surface here
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));

    let shutdown_clone = Arc::clone(&shutdown);
    let reload_clone = Arc::clone(&reload);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking registry document for reload");
                    reload_clone.store(true, Ordering::SeqCst);
                }
            }
        }
    });

    let server = DaemonServer::new(
        args.config,
        overrides,
        Duration::from_secs(args.report_interval_secs.max(1)),
    )?;

    let result = server.run(shutdown, reload).await;

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
