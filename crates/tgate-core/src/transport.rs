//! Abstract dialer for link sessions.
//!
//! Production links dial TLS; tests dial plain TCP against an in-process
//! peer. Both yield the same boxed byte stream.

use crate::error::GateResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream carrying one link session.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

pub type BoxedLinkStream = Box<dyn LinkStream>;

/// Dials the encrypted session underlying a tunnel link.
pub trait LinkDialer: Send + Sync {
    /// Connect to `host:port`, bounded by `timeout`.
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = GateResult<BoxedLinkStream>> + Send + 'a>>;
}
