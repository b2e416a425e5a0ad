//! `tgate` binary: a reverse proxy whose upstream is reached through a
//! chain of authenticated tunnel links.

mod config;
mod gateway;
mod proxy;
mod tunnel;

use clap::Parser;
use config::{CliOverrides, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tgate_core::LinkDialer;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunnel::tls::TlsDialer;

#[derive(Parser, Debug)]
#[command(name = "tgate", version, about = "Tunnel-backed HTTP gateway")]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, default_value = "~/.tgate/config.toml")]
    config: PathBuf,

    /// Listen port (overrides config file and LISTEN_PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream base URL (overrides config file and UPSTREAM_BASE_URL).
    #[arg(long)]
    upstream: Option<String>,

    /// Log filter when RUST_LOG is unset, e.g. "debug" or "tgate_server=trace".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let overrides = CliOverrides {
        listen_port: cli.port,
        upstream_url: cli.upstream,
    };
    let config = match Config::load(Some(cli.config.as_path()), overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let dialer: Arc<dyn LinkDialer> = match &config.tls_ca_file {
        Some(path) => match TlsDialer::from_ca_file(path) {
            Ok(dialer) => Arc::new(dialer),
            Err(e) => {
                error!(error = %e, "cannot load CA bundle");
                std::process::exit(1);
            }
        },
        None => Arc::new(TlsDialer::without_roots()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if let Err(fatal) = gateway::run(config, dialer, shutdown_rx).await {
        error!(error = %fatal, "gateway failed");
        std::process::exit(fatal.exit_code());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
