//! Control frames for the link protocol.
//!
//! Every frame travels as a length-prefixed CBOR map with a `type` tag (see
//! [`crate::codec`]). The handshake is client-driven:
//!
//! 1. Client sends `Hello`
//! 2. Peer answers with a `Challenge` carrying a random nonce
//! 3. Client sends `Auth` (Ed25519 signature over the transcript, or password)
//! 4. Peer answers `AuthOk` or `AuthFail`
//!
//! After `AuthOk` the session is a stream multiplexer: `Open`/`OpenOk`/
//! `OpenFail` manage per-stream lifecycle, `Data` carries payload bytes, and
//! `Close` ends one stream without touching the others.

use crate::credential::Secret;
use serde::{Deserialize, Serialize};

/// Protocol version string, part of the auth transcript.
pub const PROTOCOL_VERSION: &str = "tgate-v1";

/// Authentication method carried in an `Auth` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Pubkey,
    Password,
}

/// A control frame on the link session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        version: String,
    },
    Challenge {
        nonce: Vec<u8>,
    },
    Auth {
        method: AuthMethod,
        /// Hex-encoded Ed25519 verifying key (pubkey auth only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        /// Signature over the challenge transcript (pubkey auth only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<Secret>,
    },
    AuthOk {},
    AuthFail {
        reason: String,
    },
    Open {
        stream_id: u64,
    },
    OpenOk {
        stream_id: u64,
    },
    OpenFail {
        stream_id: u64,
        reason: String,
    },
    Data {
        stream_id: u64,
        data: Vec<u8>,
    },
    Close {
        stream_id: u64,
    },
    Ping {},
    Pong {},
}
