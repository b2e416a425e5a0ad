//! Gateway orchestration: bring the tunnel chain up, then serve HTTP.
//!
//! Startup order is a hard requirement. The HTTP listener must not accept a
//! single request until the chain is up, because the upstream is unreachable
//! without it. Shutdown runs in reverse: stop accepting, drain in-flight
//! requests within the grace period, then tear the chain down.

use crate::config::Config;
use crate::proxy::{self, ProxyState};
use crate::tunnel::chain::{self, ChainHandle};
use crate::tunnel::ChainStatus;
use std::sync::Arc;
use std::time::Duration;
use tgate_core::LinkDialer;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Unrecoverable failures, mapped onto process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum Fatal {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("tunnel chain failed to start: {0}")]
    ChainStartup(String),
    #[error("cannot bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
}

impl Fatal {
    pub fn exit_code(&self) -> i32 {
        match self {
            Fatal::Config(_) => 1,
            Fatal::ChainStartup(_) => 2,
            // a listener that died is the same loss as one that never bound
            Fatal::Bind(..) | Fatal::Serve(_) => 3,
        }
    }
}

enum ChainWait {
    Ready,
    Interrupted,
}

/// Run the gateway until `shutdown_rx` flips to `true`.
pub async fn run(
    config: Config,
    dialer: Arc<dyn LinkDialer>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Fatal> {
    let chain = if config.hops.is_empty() {
        info!("no tunnel hops configured, serving upstream directly");
        None
    } else {
        let chain = chain::start(config.hops.clone(), dialer, config.link_backoff);
        match wait_chain_up(&chain, config.startup_timeout, &mut shutdown_rx).await {
            Ok(ChainWait::Ready) => Some(chain),
            Ok(ChainWait::Interrupted) => {
                chain.stop().await;
                return Ok(());
            }
            Err(fatal) => {
                chain.stop().await;
                return Err(fatal);
            }
        }
    };

    let state = ProxyState::new(
        config.upstream.clone(),
        chain.as_ref().map(|c| c.status_rx()),
    )
    .map_err(|e| Fatal::Config(e.to_string()))?;
    let app = proxy::router(state);

    let addr = format!("{}:{}", config.listen_addr, config.listen_port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            if let Some(chain) = chain {
                chain.stop().await;
            }
            return Err(Fatal::Bind(addr, e));
        }
    };
    info!(%addr, upstream = %config.upstream.base_url, "gateway listening");

    let mut serve_shutdown = shutdown_rx.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        while !*serve_shutdown.borrow() {
            if serve_shutdown.changed().await.is_err() {
                break;
            }
        }
    });

    // Drain in-flight requests, but only for the grace period.
    let mut grace_shutdown = shutdown_rx.clone();
    let grace = config.shutdown_grace;
    let deadline = async move {
        while !*grace_shutdown.borrow() {
            if grace_shutdown.changed().await.is_err() {
                break;
            }
        }
        tokio::time::sleep(grace).await;
    };

    let mut server_error = None;
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
                // an error during shutdown is expected churn; one while
                // serving means the listener died out from under us
                if !*shutdown_rx.borrow() {
                    server_error = Some(e);
                }
            }
        }
        _ = deadline => {
            warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed, dropping remaining connections");
        }
    }

    if let Some(chain) = chain {
        info!("stopping tunnel chain");
        chain.stop().await;
    }
    if let Some(e) = server_error {
        return Err(Fatal::Serve(e));
    }
    info!("gateway stopped");
    Ok(())
}

/// Block until the chain reaches `Up`, bounded by the startup timeout.
async fn wait_chain_up(
    chain: &ChainHandle,
    timeout: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ChainWait, Fatal> {
    let mut rx = chain.status_rx();
    let wait = async {
        loop {
            match *rx.borrow() {
                ChainStatus::Up => return Ok(()),
                ChainStatus::Failed => {
                    return Err(Fatal::ChainStartup(
                        "a hop's authentication was rejected".to_string(),
                    ))
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Fatal::ChainStartup("chain supervisor exited".to_string()));
            }
        }
    };

    tokio::select! {
        result = tokio::time::timeout(timeout, wait) => match result {
            Ok(Ok(())) => Ok(ChainWait::Ready),
            Ok(Err(fatal)) => Err(fatal),
            Err(_) => Err(Fatal::ChainStartup(format!(
                "not up within {}ms",
                timeout.as_millis()
            ))),
        },
        _ = shutdown_rx.changed() => {
            info!("shutdown requested during chain startup");
            Ok(ChainWait::Interrupted)
        }
    }
}
