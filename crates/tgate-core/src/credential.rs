//! Link credentials and the challenge-response handshake primitives.
//!
//! A hop authenticates with either an Ed25519 key file (OpenSSH format,
//! optionally passphrase-encrypted) or a password. Secret material is wrapped
//! in [`Secret`] so it can never leak through `Debug` output or logs.

use crate::error::{GateError, GateResult};
use crate::messages::{AuthMethod, Frame, PROTOCOL_VERSION};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// A string that must never appear in logs or debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying secret. Callers must not log the result.
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// How a tunnel link authenticates to its remote forward endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    KeyFile {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    Password {
        secret: Secret,
    },
}

impl Credential {
    /// Build the `Auth` frame answering a challenge nonce.
    ///
    /// Key problems (missing file, wrong passphrase, non-Ed25519 key) are
    /// reported as `Auth` errors: they are as terminal as a rejected password
    /// and must not enter the reconnect loop.
    pub fn answer(&self, nonce: &[u8]) -> GateResult<Frame> {
        match self {
            Credential::KeyFile { path, passphrase } => {
                let key = load_signing_key(path, passphrase.as_ref())?;
                let (public_key, signature) = sign_challenge(&key, nonce);
                Ok(Frame::Auth {
                    method: AuthMethod::Pubkey,
                    public_key: Some(public_key),
                    signature: Some(signature),
                    password: None,
                })
            }
            Credential::Password { secret } => Ok(Frame::Auth {
                method: AuthMethod::Password,
                public_key: None,
                signature: None,
                password: Some(secret.clone()),
            }),
        }
    }
}

/// Build the challenge transcript: `SHA-256(version || "\0" || nonce)`.
pub fn transcript(nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(PROTOCOL_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(nonce);
    hasher.finalize().to_vec()
}

/// Sign a challenge nonce, returning (hex verifying key, signature bytes).
pub fn sign_challenge(key: &SigningKey, nonce: &[u8]) -> (String, Vec<u8>) {
    let sig = key.sign(&transcript(nonce));
    let public = hex::encode(key.verifying_key().to_bytes());
    (public, sig.to_bytes().to_vec())
}

/// Verify a challenge signature against a hex-encoded verifying key.
pub fn verify_challenge(public_key_hex: &str, nonce: &[u8], signature: &[u8]) -> bool {
    let Ok(raw) = hex::decode(public_key_hex) else {
        return false;
    };
    let raw: [u8; 32] = match raw.try_into() {
        Ok(raw) => raw,
        Err(_) => return false,
    };
    let Ok(key) = VerifyingKey::from_bytes(&raw) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(&transcript(nonce), &sig).is_ok()
}

/// Generate a random 32-byte challenge nonce.
pub fn generate_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill(&mut nonce[..]);
    nonce
}

/// Load an Ed25519 signing key from an OpenSSH private key file.
pub fn load_signing_key(
    path: &std::path::Path,
    passphrase: Option<&Secret>,
) -> GateResult<SigningKey> {
    let pem = std::fs::read(path)
        .map_err(|e| GateError::Auth(format!("cannot read key file {}: {e}", path.display())))?;

    let mut key = ssh_key::PrivateKey::from_openssh(&pem)
        .map_err(|e| GateError::Auth(format!("cannot parse key file {}: {e}", path.display())))?;

    if key.is_encrypted() {
        let Some(pass) = passphrase else {
            return Err(GateError::Auth(format!(
                "key file {} is encrypted but no passphrase was configured",
                path.display()
            )));
        };
        key = key
            .decrypt(pass.reveal())
            .map_err(|e| GateError::Auth(format!("cannot decrypt key file: {e}")))?;
    }

    match key.key_data() {
        ssh_key::private::KeypairData::Ed25519(pair) => {
            Ok(SigningKey::from_bytes(&pair.private.to_bytes()))
        }
        other => Err(GateError::Auth(format!(
            "unsupported key algorithm in {}: {:?} (only ed25519 is supported)",
            path.display(),
            other.algorithm().map(|a| a.to_string()).unwrap_or_default()
        ))),
    }
}
