//! Tunnel links and the chain manager.
//!
//! A *link* is one encrypted point-to-point forward: a local TCP listener
//! whose accepted connections are multiplexed as independent streams over a
//! single authenticated session to the remote forward endpoint. A *chain*
//! composes links end-to-end so the final hop's local port reaches a host
//! with no direct route.

pub mod chain;
pub mod link;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::time::Duration;
use tgate_core::Credential;

/// One hop in a tunnel chain. Immutable once the chain starts.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub name: String,
    pub local_bind_addr: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub auth: Credential,
    pub connect_timeout: Duration,
}

impl LinkSpec {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_bind_addr, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Observable state of a single link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Dialing or handshaking (also the state between reconnect attempts).
    Connecting,
    /// Session authenticated and the local listener is accepting.
    Up,
    /// Session lost; a reconnect is pending.
    Down,
    /// Authentication was rejected. Terminal — credentials won't fix
    /// themselves, so the link does not retry.
    Failed,
}

/// Observable state of a whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Stopped,
    Connecting,
    Up,
    /// At least one hop dropped; reconnect and downstream restart in progress.
    Degraded,
    /// Terminal until manual restart (a hop's authentication was rejected).
    Failed,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainStatus::Stopped => "stopped",
            ChainStatus::Connecting => "connecting",
            ChainStatus::Up => "up",
            ChainStatus::Degraded => "degraded",
            ChainStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
