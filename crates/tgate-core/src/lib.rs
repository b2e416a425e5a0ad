//! tgate-core: Shared library for the tgate tunnel-broker gateway.
//!
//! Provides the link control protocol (CBOR frames + codec), credential
//! handling for the link handshake, the exponential backoff policy shared by
//! tunnel reconnects and upstream retries, and the abstract dialer trait that
//! lets tunnel links run over TLS in production and plain TCP in tests.

pub mod backoff;
pub mod codec;
pub mod credential;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use backoff::{Backoff, BackoffPolicy};
pub use codec::{encode_frame, write_frame, FrameDecoder, FramedReader};
pub use credential::{Credential, Secret};
pub use error::{GateError, GateResult};
pub use messages::{AuthMethod, Frame, PROTOCOL_VERSION};
pub use transport::{LinkDialer, LinkStream};
