//! Chain manager: sequential bring-up and supervision of stacked links.
//!
//! Hops start strictly in order, because hop N dials through hop N-1's local
//! listener. When a hop drops, every hop stacked on top of it is torn down
//! and rebuilt once the dropped hop reconnects; hops below it keep running.
//! A single authentication rejection fails the whole chain.

use super::link::{self, LinkHandle};
use super::{ChainStatus, LinkSpec, LinkStatus};
use std::sync::Arc;
use tgate_core::{BackoffPolicy, LinkDialer};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ChainHandle {
    status_rx: watch::Receiver<ChainStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChainHandle {
    pub fn status(&self) -> ChainStatus {
        *self.status_rx.borrow()
    }

    pub fn status_rx(&self) -> watch::Receiver<ChainStatus> {
        self.status_rx.clone()
    }

    /// Tear the chain down, last hop first, and wait for completion.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Start the chain under its own supervisor task.
pub fn start(
    specs: Vec<LinkSpec>,
    dialer: Arc<dyn LinkDialer>,
    policy: BackoffPolicy,
) -> ChainHandle {
    let (status_tx, status_rx) = watch::channel(ChainStatus::Connecting);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervise(specs, dialer, policy, status_tx, shutdown_rx));
    ChainHandle {
        status_rx,
        shutdown_tx,
        task,
    }
}

async fn supervise(
    specs: Vec<LinkSpec>,
    dialer: Arc<dyn LinkDialer>,
    policy: BackoffPolicy,
    status_tx: watch::Sender<ChainStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut links: Vec<LinkHandle> = Vec::new();

    loop {
        // Bring up the missing hops, in order.
        while links.len() < specs.len() {
            if *shutdown_rx.borrow() {
                teardown(&mut links).await;
                let _ = status_tx.send(ChainStatus::Stopped);
                return;
            }
            let spec = specs[links.len()].clone();
            let hop = spec.name.clone();
            let handle = link::start(spec, dialer.clone(), policy);
            let mut rx = handle.status_rx();

            let settled = tokio::select! {
                settled = wait_settled(&mut rx) => settled,
                _ = shutdown_rx.changed() => {
                    handle.stop().await;
                    teardown(&mut links).await;
                    let _ = status_tx.send(ChainStatus::Stopped);
                    return;
                }
            };
            match settled {
                LinkStatus::Up => {
                    info!(%hop, position = links.len() + 1, "hop up");
                    links.push(handle);
                }
                _ => {
                    warn!(%hop, "hop failed to authenticate, chain failed");
                    handle.stop().await;
                    teardown(&mut links).await;
                    let _ = status_tx.send(ChainStatus::Failed);
                    return;
                }
            }
        }

        if specs.is_empty() {
            let _ = status_tx.send(ChainStatus::Up);
            info!(hops = specs.len(), "tunnel chain up");
            // Nothing to supervise; park until shutdown.
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
            let _ = status_tx.send(ChainStatus::Stopped);
            return;
        }

        // A hop below a recovered one may have dropped while we waited on
        // the recovery, so publish Up only when every link concurrently
        // reports it; otherwise handle the dropped hop directly.
        let (idx, status) = match first_not_up(&links) {
            None => {
                let _ = status_tx.send(ChainStatus::Up);
                info!(hops = specs.len(), "tunnel chain up");

                let mut rxs: Vec<_> = links.iter().map(|l| l.status_rx()).collect();
                tokio::select! {
                    dropped = wait_any_not_up(&mut rxs) => dropped,
                    _ = shutdown_rx.changed() => {
                        teardown(&mut links).await;
                        let _ = status_tx.send(ChainStatus::Stopped);
                        return;
                    }
                }
            }
            Some(dropped) => dropped,
        };

        if status == LinkStatus::Failed {
            warn!(hop = links[idx].name(), "hop authentication rejected, chain failed");
            teardown(&mut links).await;
            let _ = status_tx.send(ChainStatus::Failed);
            return;
        }

        warn!(hop = links[idx].name(), "hop dropped, chain degraded");
        let _ = status_tx.send(ChainStatus::Degraded);

        // Hops stacked on the dropped one dial through its dead listener;
        // rebuild them once it recovers.
        while links.len() > idx + 1 {
            if let Some(link) = links.pop() {
                link.stop().await;
            }
        }

        let mut rx = links[idx].status_rx();
        let settled = tokio::select! {
            settled = wait_settled(&mut rx) => settled,
            _ = shutdown_rx.changed() => {
                teardown(&mut links).await;
                let _ = status_tx.send(ChainStatus::Stopped);
                return;
            }
        };
        if settled != LinkStatus::Up {
            warn!(hop = links[idx].name(), "hop authentication rejected, chain failed");
            teardown(&mut links).await;
            let _ = status_tx.send(ChainStatus::Failed);
            return;
        }
    }
}

/// The lowest link that does not currently report `Up`, if any.
fn first_not_up(links: &[LinkHandle]) -> Option<(usize, LinkStatus)> {
    links
        .iter()
        .enumerate()
        .map(|(idx, link)| (idx, link.status()))
        .find(|(_, status)| *status != LinkStatus::Up)
}

/// Wait until a link is either up or terminally failed.
async fn wait_settled(rx: &mut watch::Receiver<LinkStatus>) -> LinkStatus {
    loop {
        let status = *rx.borrow();
        if matches!(status, LinkStatus::Up | LinkStatus::Failed) {
            return status;
        }
        if rx.changed().await.is_err() {
            return LinkStatus::Failed;
        }
    }
}

/// Resolve with the index and status of the first link that is not up.
async fn wait_any_not_up(rxs: &mut [watch::Receiver<LinkStatus>]) -> (usize, LinkStatus) {
    let watchers = rxs
        .iter_mut()
        .enumerate()
        .map(|(idx, rx)| {
            Box::pin(async move {
                loop {
                    let status = *rx.borrow();
                    if status != LinkStatus::Up {
                        return (idx, status);
                    }
                    if rx.changed().await.is_err() {
                        return (idx, LinkStatus::Failed);
                    }
                }
            })
        })
        .collect::<Vec<_>>();
    futures_util::future::select_all(watchers).await.0
}

async fn teardown(links: &mut Vec<LinkHandle>) {
    while let Some(link) = links.pop() {
        link.stop().await;
    }
}
