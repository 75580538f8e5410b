//! Test progress daemon.
//!
//! Refreshes the stored total and passing test sets at startup, on webhook
//! pushes and optionally on a timer, and serves `total/passing` over HTTP.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use progress_common::config::env::parse_log_level;
use progress_common::{LogConfig, ProgressConfig, init_logging};
use progressd::DaemonContext;
use progressd::http_api;
use progressd::scheduler::RefreshScheduler;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "progressd")]
#[command(author, version, about = "Test progress daemon - tracks passing vs. total tests")]
struct Cli {
    /// Path to the configuration file (defaults to ./config.toml if present)
    #[arg(short, long, env = "PROGRESS_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port, overriding the configuration
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error), overriding the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Enable verbose output (same as --log-level debug)
    #[arg(short, long)]
    verbose: bool,

    /// Load and validate the configuration, print it and exit
    #[arg(long)]
    check_config: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ProgressConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    if let Some(level) = cli.log_level.as_deref() {
        let Some(level) = parse_log_level(level) else {
            bail!("Invalid --log-level '{}'", level);
        };
        config.log_level = level.to_string();
    }
    if cli.verbose {
        config.log_level = "debug".to_string();
    }

    if cli.check_config {
        println!("{}", config.to_redacted_toml());
        return Ok(());
    }

    let mut log_config = LogConfig::from_env(&config.log_level);
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_file_dir(dir);
    }
    let _log_guards = init_logging(&log_config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting progress daemon...");
    info!(
        database = %config.database.path.display(),
        checkout = %config.git.checkout_dir.display(),
        manifest = %config.manifest_url,
        "Configuration loaded"
    );

    let allow_initial_failure = config.refresh.allow_initial_failure;
    let interval = config.refresh.interval();
    let addr = format!("{}:{}", config.http.bind, config.http.port);

    let context = DaemonContext::build(config)?;

    // Initial population
    let initial = context.reconciler.refresh_all().await;
    for (set, e) in initial.errors() {
        if allow_initial_failure {
            warn!(kind = %set, error = %e, "Initial refresh failed, serving stored snapshot");
        } else {
            error!(kind = %set, error = %e, "Initial refresh failed");
        }
    }
    if !initial.is_ok() && !allow_initial_failure {
        bail!("Initial refresh failed; set refresh.allow_initial_failure to start anyway");
    }

    let scheduler = interval.map(|period| RefreshScheduler::new(context.reconciler.clone(), period).start());

    for source in context.dispatcher.sources() {
        info!(source = %source.name, route = %source.route(), kind = %source.refresh, "Webhook enabled");
    }

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let router = http_api::create_router(context.http_state());
    http_api::serve(listener, router, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if let Some(handle) = scheduler {
        handle.abort();
    }
    info!("Daemon shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
