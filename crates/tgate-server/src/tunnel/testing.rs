//! In-process fake forward endpoint for link and chain tests.
//!
//! Speaks the link protocol over plain TCP (tests inject [`TcpDialer`]
//! instead of the TLS dialer). Echo mode answers every stream with its own
//! bytes; forward mode relays opened streams to another TCP address, which is
//! how a chained peer behaves.

use super::link::LinkHandle;
use super::LinkStatus;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tgate_core::codec::{write_frame, FramedReader};
use tgate_core::credential::{generate_nonce, sign_challenge, verify_challenge};
use tgate_core::transport::{BoxedLinkStream, LinkDialer};
use tgate_core::{BackoffPolicy, Frame, GateError, GateResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

pub const TEST_PASSWORD: &str = "open-sesame";

/// Dials plain TCP, no TLS. Test-only stand-in for the production dialer.
pub struct TcpDialer;

impl LinkDialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> Pin<Box<dyn std::future::Future<Output = GateResult<BoxedLinkStream>> + Send + 'a>> {
        Box::pin(async move {
            let sock = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
                .await
                .map_err(|_| GateError::Network(format!("connect to {host}:{port} timed out")))?
                .map_err(|e| GateError::Network(format!("connect to {host}:{port}: {e}")))?;
            Ok(Box::new(sock) as BoxedLinkStream)
        })
    }
}

#[derive(Clone)]
pub enum PeerAuth {
    /// Accepts [`TEST_PASSWORD`].
    Password,
    /// Accepts signatures from this hex-encoded verifying key.
    Key(String),
    RejectAll,
}

impl PeerAuth {
    pub fn password() -> Self {
        PeerAuth::Password
    }
}

#[derive(Clone, Copy)]
pub enum PeerMode {
    /// Echo every stream's bytes back.
    Echo,
    /// Relay every opened stream to this address.
    Forward(SocketAddr),
}

pub struct FakePeer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    kill_tx: broadcast::Sender<()>,
}

impl FakePeer {
    pub async fn spawn(auth: PeerAuth, mode: PeerMode) -> Self {
        Self::spawn_with_delay(auth, mode, Duration::ZERO).await
    }

    /// Like [`FakePeer::spawn`], but waits `challenge_delay` before sending
    /// the challenge. Used to observe bring-up ordering.
    pub async fn spawn_with_delay(auth: PeerAuth, mode: PeerMode, challenge_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (kill_tx, _) = broadcast::channel(4);

        let accepted_clone = accepted.clone();
        let kill = kill_tx.clone();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let auth = auth.clone();
                let kill_rx = kill.subscribe();
                tokio::spawn(peer_session(sock, auth, mode, challenge_delay, kill_rx));
            }
        });

        Self {
            port,
            accepted,
            kill_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of TCP connections accepted so far.
    pub fn sessions_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drop every live session, simulating a broker restart.
    pub fn kill_sessions(&self) {
        let _ = self.kill_tx.send(());
    }
}

async fn peer_session(
    sock: TcpStream,
    auth: PeerAuth,
    mode: PeerMode,
    challenge_delay: Duration,
    mut kill_rx: broadcast::Receiver<()>,
) {
    let (read_half, write_half) = sock.into_split();
    let mut reader = FramedReader::new(read_half);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    tokio::spawn(async move {
        let mut writer = write_half;
        while let Some(frame) = out_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                return;
            }
        }
    });

    match reader.next().await {
        Ok(Frame::Hello { .. }) => {}
        _ => return,
    }
    if !challenge_delay.is_zero() {
        tokio::time::sleep(challenge_delay).await;
    }
    let nonce = generate_nonce();
    let _ = out_tx
        .send(Frame::Challenge {
            nonce: nonce.clone(),
        })
        .await;

    let ok = match reader.next().await {
        Ok(Frame::Auth {
            public_key,
            signature,
            password,
            ..
        }) => match &auth {
            PeerAuth::Password => password
                .map(|p| p.reveal() == TEST_PASSWORD)
                .unwrap_or(false),
            PeerAuth::Key(expected) => match (public_key, signature) {
                (Some(pk), Some(sig)) => pk == *expected && verify_challenge(&pk, &nonce, &sig),
                _ => false,
            },
            PeerAuth::RejectAll => false,
        },
        _ => return,
    };
    if !ok {
        let _ = out_tx
            .send(Frame::AuthFail {
                reason: "credentials rejected".into(),
            })
            .await;
        return;
    }
    let _ = out_tx.send(Frame::AuthOk {}).await;

    // Established session: one sender per open stream feeds either the echo
    // loop or the forwarded socket.
    let mut streams: std::collections::HashMap<u64, mpsc::Sender<Vec<u8>>> =
        std::collections::HashMap::new();

    loop {
        tokio::select! {
            _ = kill_rx.recv() => return,
            frame = reader.next() => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(_) => return,
                };
                match frame {
                    Frame::Open { stream_id } => match mode {
                        PeerMode::Echo => {
                            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
                            streams.insert(stream_id, tx);
                            let out = out_tx.clone();
                            tokio::spawn(async move {
                                while let Some(data) = rx.recv().await {
                                    if out.send(Frame::Data { stream_id, data }).await.is_err() {
                                        return;
                                    }
                                }
                            });
                            let _ = out_tx.send(Frame::OpenOk { stream_id }).await;
                        }
                        PeerMode::Forward(addr) => match TcpStream::connect(addr).await {
                            Ok(upstream) => {
                                let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
                                streams.insert(stream_id, tx);
                                tokio::spawn(forward_peer_stream(stream_id, upstream, rx, out_tx.clone()));
                                let _ = out_tx.send(Frame::OpenOk { stream_id }).await;
                            }
                            Err(e) => {
                                let _ = out_tx.send(Frame::OpenFail {
                                    stream_id,
                                    reason: e.to_string(),
                                }).await;
                            }
                        },
                    },
                    Frame::Data { stream_id, data } => {
                        if let Some(tx) = streams.get(&stream_id) {
                            let _ = tx.send(data).await;
                        }
                    }
                    Frame::Close { stream_id } => {
                        streams.remove(&stream_id);
                    }
                    Frame::Ping {} => {
                        let _ = out_tx.send(Frame::Pong {}).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Peer side of one forwarded stream.
async fn forward_peer_stream(
    stream_id: u64,
    upstream: TcpStream,
    mut rx: mpsc::Receiver<Vec<u8>>,
    out: mpsc::Sender<Frame>,
) {
    let (mut read_half, mut write_half) = upstream.into_split();
    let mut buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = out.send(Frame::Close { stream_id }).await;
                        return;
                    }
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        if out.send(Frame::Data { stream_id, data }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            let _ = out.send(Frame::Close { stream_id }).await;
                            return;
                        }
                    }
                    None => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Grab a port the kernel considers free right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Backoff tuned so reconnect tests finish in tens of milliseconds.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

/// Write a throwaway Ed25519 key in OpenSSH format; returns the file path
/// and the hex-encoded verifying key.
pub fn write_test_key(seed: &[u8; 32]) -> (PathBuf, String) {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let pair = ssh_key::private::Ed25519Keypair::from_seed(seed);
    let key = ssh_key::PrivateKey::new(ssh_key::private::KeypairData::Ed25519(pair), "test")
        .unwrap();
    let pem = key.to_openssh(ssh_key::LineEnding::LF).unwrap();

    let path = std::env::temp_dir().join(format!(
        "tgate-test-key-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::write(&path, pem.as_bytes()).unwrap();

    let signing = ed25519_dalek::SigningKey::from_bytes(seed);
    let (public, _) = sign_challenge(&signing, b"probe");
    (path, public)
}

/// Poll until the condition holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_link_status(handle: &LinkHandle, want: LinkStatus) {
    wait_until("link status", || handle.status() == want).await;
}

pub async fn wait_link_left(handle: &LinkHandle, gone: LinkStatus) {
    wait_until("link status change", || handle.status() != gone).await;
}
