//! # Captcha Service
//!
//! Process entry point launched by the external supervisor. Resolves
//! configuration, connects the cache backend, and keeps the cache alive for
//! the captcha service until a shutdown signal arrives.
//!
//! ## Exit codes
//! - 0: graceful shutdown (SIGINT / SIGTERM)
//! - 1: startup failed (configuration or cache initialization)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use captcha_common::StartupError;
use captcha_service::{ServiceContext, config};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Captcha Service - configuration and cache bootstrap
#[derive(Parser, Debug)]
#[command(name = "captcha-service")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (the CONFIG environment variable wins)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // .env is optional; real deployments pass variables through the supervisor
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();

    let filter_handle = init_logging(args.log_level.as_deref().unwrap_or("info"), args.json_logs)?;

    info!("Starting captcha service v{}", env!("CARGO_PKG_VERSION"));
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded .env file");
    }

    let env = config::from_process_env();
    let resolved = match config::ResolvedConfig::resolve(args.config.as_deref(), &env) {
        Ok(resolved) => resolved,
        Err(e) => {
            let e = StartupError::from(e);
            error!(origin = e.origin(), error = %e, "Startup failed");
            return Ok(ExitCode::FAILURE);
        }
    };

    // A level from the config file applies only when nothing more specific was
    // given. It takes effect before the cache connects, so messages emitted while
    // resolving the config file itself still use the CLI/default level.
    if let Some(level) = &resolved.log_level {
        if args.log_level.is_none() && std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
            filter_handle
                .modify(|filter| *filter = EnvFilter::new(level))
                .context("Failed to apply configured log level")?;
        }
    }

    info!(
        service_name = %resolved.service_name,
        cache_type = %resolved.cache_type,
        config_file = ?resolved.config_file_path,
        "Configuration resolved"
    );

    let context = match ServiceContext::from_config(resolved).await {
        Ok(context) => context,
        Err(e) => {
            error!(origin = e.origin(), error = %e, "Startup failed");
            return Ok(ExitCode::FAILURE);
        }
    };

    info!(
        service_name = %context.config.service_name,
        cache_type = %context.cache.cache_type(),
        go_captcha_config = ?context.config.go_captcha_config_path,
        "Captcha service ready"
    );

    let signal = shutdown_signal().await;
    match &signal {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to wait for shutdown signal"),
    }

    // The cache is closed on every exit path
    if let Err(e) = context.shutdown().await {
        warn!(error = %e, "Cache did not close cleanly");
    }

    signal?;
    info!("Captcha service shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<FilterHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(handle)
}

/// Wait for Ctrl+C or, on Unix, SIGTERM from the supervisor
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    Ok(())
}
