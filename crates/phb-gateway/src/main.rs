//! phbgateway: trust-anchored WebSocket relay for one household.
//!
//! Routes JSON envelopes between a single desktop principal and its paired
//! devices. Devices trust the desktop, not each other; the gateway enforces
//! that trust at the socket boundary and relays by device_id.

mod config;
mod handshake;
mod registry;
mod relay;
mod server;
mod state;

use clap::Parser;
use config::GatewayConfig;
use server::Gateway;
use state::StateStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// Command-line options for the relay gateway.
#[derive(Parser, Debug)]
#[command(name = "phbgateway", version, about = "Private Home Box relay gateway")]
struct Cli {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP port
    #[arg(long, default_value_t = 8765)]
    port: u16,

    /// Directory for the gateway identity and desktop binding
    #[arg(long, default_value = "~/.phbgateway")]
    state_dir: String,

    /// Directory for the rotating log file (stdout only when omitted)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Maximum concurrent connections (unlimited when omitted)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Per-session idle timeout in seconds (disabled when omitted)
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _log_guard = init_tracing(&cli.log_level, cli.log_dir.as_deref());

    let state_dir = expand_tilde(&cli.state_dir);
    let config = GatewayConfig::resolve(
        cli.host,
        cli.port,
        Some(state_dir),
        cli.max_connections,
        cli.idle_timeout_secs,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        state_dir = %config.state_dir.display(),
        "starting phbgateway"
    );

    let state = match StateStore::load_or_init(&config.state_dir) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, path = %config.state_dir.display(), "failed to open state directory");
            std::process::exit(1);
        }
    };
    info!(
        gateway_public_key = %state.gateway_public_key_b64(),
        claimed = state.is_claimed().await,
        "gateway identity loaded"
    );

    let gateway = match Gateway::bind(config, state).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = gateway.run(shutdown_signal()).await {
        error!(error = %e, "gateway error");
        std::process::exit(1);
    }

    info!("phbgateway stopped");
}

/// Stdout fmt layer, plus a daily-rolling file layer when a log dir is given.
/// The returned guard keeps the non-blocking file writer alive.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("cannot create log dir {}: {e}", dir.display());
                std::process::exit(1);
            }
            let appender = tracing_appender::rolling::daily(dir, "phbgateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            None
        }
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
