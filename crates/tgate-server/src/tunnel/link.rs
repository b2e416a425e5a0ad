//! A single tunnel link: authenticated session + local listener + relays.
//!
//! The supervisor task owns the link lifecycle: dial, handshake, bind the
//! local listener, then serve until the session drops. Network failures feed
//! an exponential backoff reconnect loop; an authentication rejection is
//! terminal. Each accepted local connection becomes one multiplexed stream —
//! stream errors are contained to their own relay task.

use super::{LinkSpec, LinkStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tgate_core::codec::{write_frame, FramedReader};
use tgate_core::messages::PROTOCOL_VERSION;
use tgate_core::transport::BoxedLinkStream;
use tgate_core::{Backoff, BackoffPolicy, Credential, Frame, GateError, GateResult, LinkDialer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-stream queue depth. A consumer that stops draining for this many
/// frames is cut loose rather than stalling the session demultiplexer.
const STREAM_QUEUE_DEPTH: usize = 256;

type SharedStreams = Arc<Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>;
type SharedPending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

/// Handle to a running link. Dropping it detaches the supervisor; call
/// [`LinkHandle::stop`] for an orderly teardown.
pub struct LinkHandle {
    name: String,
    status_rx: watch::Receiver<LinkStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status transitions.
    pub fn status_rx(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Signal shutdown and wait for the supervisor to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Start a link under its own supervisor task.
pub fn start(spec: LinkSpec, dialer: Arc<dyn LinkDialer>, policy: BackoffPolicy) -> LinkHandle {
    let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let name = spec.name.clone();
    let task = tokio::spawn(supervise(spec, dialer, policy, status_tx, shutdown_rx));
    LinkHandle {
        name,
        status_rx,
        shutdown_tx,
        task,
    }
}

/// How one session ended, seen from the supervisor.
enum SessionEnd {
    Shutdown,
    Dropped,
}

async fn supervise(
    spec: LinkSpec,
    dialer: Arc<dyn LinkDialer>,
    policy: BackoffPolicy,
    status_tx: watch::Sender<LinkStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(policy);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let _ = status_tx.send(LinkStatus::Connecting);

        match run_session(&spec, dialer.as_ref(), &status_tx, &mut shutdown_rx).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Dropped) => {
                warn!(link = %spec.name, "session dropped");
                let _ = status_tx.send(LinkStatus::Down);
                // the link was up, so the next attempt starts from the base delay
                backoff.reset();
            }
            Err(GateError::Auth(reason)) => {
                warn!(link = %spec.name, %reason, "authentication rejected, giving up");
                let _ = status_tx.send(LinkStatus::Failed);
                return;
            }
            Err(e) => {
                warn!(link = %spec.name, error = %e, "connect failed");
                let _ = status_tx.send(LinkStatus::Down);
            }
        }

        let delay = backoff.next_delay();
        debug!(link = %spec.name, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    let _ = status_tx.send(LinkStatus::Down);
    debug!(link = %spec.name, "link supervisor stopped");
}

/// Dial, authenticate, bind the local listener, and serve one session.
async fn run_session(
    spec: &LinkSpec,
    dialer: &dyn LinkDialer,
    status_tx: &watch::Sender<LinkStatus>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> GateResult<SessionEnd> {
    let stream = dialer
        .dial(&spec.remote_host, spec.remote_port, spec.connect_timeout)
        .await?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedReader::new(read_half);
    let mut writer = write_half;

    tokio::time::timeout(
        spec.connect_timeout,
        handshake(&mut reader, &mut writer, &spec.auth),
    )
    .await
    .map_err(|_| GateError::Network("handshake timed out".into()))??;

    let listener = TcpListener::bind(spec.local_addr()).await.map_err(|e| {
        GateError::Network(format!("cannot bind local port {}: {e}", spec.local_addr()))
    })?;

    info!(link = %spec.name, local = %spec.local_addr(), remote = %spec.remote_addr(), "link up");
    let _ = status_tx.send(LinkStatus::Up);

    serve(spec, reader, writer, listener, shutdown_rx).await
}

/// Client side of the auth handshake: Hello → Challenge → Auth → AuthOk.
async fn handshake<R, W>(
    reader: &mut FramedReader<R>,
    writer: &mut W,
    auth: &Credential,
) -> GateResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(
        writer,
        &Frame::Hello {
            version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await?;

    let nonce = match reader.next().await? {
        Frame::Challenge { nonce } => nonce,
        other => {
            return Err(GateError::Protocol(format!(
                "expected challenge, got {other:?}"
            )))
        }
    };

    let answer = auth.answer(&nonce)?;
    write_frame(writer, &answer).await?;

    match reader.next().await? {
        Frame::AuthOk {} => Ok(()),
        Frame::AuthFail { reason } => Err(GateError::Auth(reason)),
        other => Err(GateError::Protocol(format!(
            "expected auth result, got {other:?}"
        ))),
    }
}

/// Serve an established session: accept local connections, demultiplex
/// incoming frames, and keep the writer fed through a single queue.
async fn serve(
    spec: &LinkSpec,
    reader: FramedReader<ReadHalf<BoxedLinkStream>>,
    writer: WriteHalf<BoxedLinkStream>,
    listener: TcpListener,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> GateResult<SessionEnd> {
    let streams: SharedStreams = Arc::new(Mutex::new(HashMap::new()));
    let pending: SharedPending = Arc::new(Mutex::new(HashMap::new()));

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Frame>(64);
    let (writer_dead_tx, writer_dead_rx) = oneshot::channel::<()>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outgoing_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(error = %e, "session write failed");
                let _ = writer_dead_tx.send(());
                return;
            }
        }
    });

    let end = session_loop(
        spec,
        reader,
        listener,
        shutdown_rx,
        &streams,
        &pending,
        &outgoing_tx,
        writer_dead_rx,
    )
    .await;

    // Dropping every data sender ends the relay tasks, which close their
    // local sockets. Pending opens see their oneshot senders dropped.
    streams.lock().await.clear();
    pending.lock().await.clear();
    writer_task.abort();

    end
}

#[allow(clippy::too_many_arguments)]
async fn session_loop(
    spec: &LinkSpec,
    mut reader: FramedReader<ReadHalf<BoxedLinkStream>>,
    listener: TcpListener,
    shutdown_rx: &mut watch::Receiver<bool>,
    streams: &SharedStreams,
    pending: &SharedPending,
    outgoing_tx: &mpsc::Sender<Frame>,
    mut writer_dead_rx: oneshot::Receiver<()>,
) -> GateResult<SessionEnd> {
    let mut next_stream_id: u64 = 0;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(SessionEnd::Shutdown);
                }
            }
            _ = &mut writer_dead_rx => {
                return Ok(SessionEnd::Dropped);
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((sock, peer)) => {
                        next_stream_id += 1;
                        let stream_id = next_stream_id;
                        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);
                        let (open_tx, open_rx) = oneshot::channel();
                        streams.lock().await.insert(stream_id, data_tx);
                        pending.lock().await.insert(stream_id, open_tx);
                        debug!(link = %spec.name, stream_id, peer = %peer, "accepted local connection");
                        tokio::spawn(forward_conn(
                            spec.name.clone(),
                            stream_id,
                            sock,
                            outgoing_tx.clone(),
                            data_rx,
                            open_rx,
                            streams.clone(),
                            pending.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(link = %spec.name, error = %e, "local accept failed");
                    }
                }
            }
            frame = reader.next() => {
                match frame {
                    Ok(frame) => {
                        dispatch(spec, frame, streams, pending, outgoing_tx).await;
                    }
                    Err(e) => {
                        debug!(link = %spec.name, error = %e, "session read ended");
                        return Ok(SessionEnd::Dropped);
                    }
                }
            }
        }
    }
}

/// Route one incoming frame to the stream or pending-open it belongs to.
async fn dispatch(
    spec: &LinkSpec,
    frame: Frame,
    streams: &SharedStreams,
    pending: &SharedPending,
    outgoing_tx: &mpsc::Sender<Frame>,
) {
    match frame {
        Frame::OpenOk { stream_id } => {
            if let Some(tx) = pending.lock().await.remove(&stream_id) {
                let _ = tx.send(Ok(()));
            }
        }
        Frame::OpenFail { stream_id, reason } => {
            if let Some(tx) = pending.lock().await.remove(&stream_id) {
                let _ = tx.send(Err(reason));
            }
            streams.lock().await.remove(&stream_id);
        }
        Frame::Data { stream_id, data } => {
            // Clone the sender out of the lock; a slow stream must not stall
            // the session. A stream whose queue overflows is cut loose.
            let tx = streams.lock().await.get(&stream_id).cloned();
            match tx {
                Some(tx) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(data) {
                        warn!(link = %spec.name, stream_id, "stream queue overflow, closing stream");
                        streams.lock().await.remove(&stream_id);
                        let _ = outgoing_tx.send(Frame::Close { stream_id }).await;
                    }
                }
                None => {
                    debug!(link = %spec.name, stream_id, "data for unknown stream");
                }
            }
        }
        Frame::Close { stream_id } => {
            streams.lock().await.remove(&stream_id);
        }
        Frame::Ping {} => {
            let _ = outgoing_tx.send(Frame::Pong {}).await;
        }
        Frame::Pong {} => {}
        _ => {
            warn!(link = %spec.name, "unexpected frame on established session");
        }
    }
}

/// Relay one local connection as one multiplexed stream.
async fn forward_conn(
    link: String,
    stream_id: u64,
    sock: TcpStream,
    outgoing: mpsc::Sender<Frame>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    open_rx: oneshot::Receiver<Result<(), String>>,
    streams: SharedStreams,
    pending: SharedPending,
) {
    if open_stream(&link, stream_id, &outgoing, open_rx).await {
        relay_stream(&link, stream_id, sock, &outgoing, &mut data_rx).await;
    }
    streams.lock().await.remove(&stream_id);
    pending.lock().await.remove(&stream_id);
    debug!(link = %link, stream_id, "stream relay ended");
}

/// Negotiate the stream open. Returns false when the open was rejected or
/// the session went away.
async fn open_stream(
    link: &str,
    stream_id: u64,
    outgoing: &mpsc::Sender<Frame>,
    open_rx: oneshot::Receiver<Result<(), String>>,
) -> bool {
    if outgoing.send(Frame::Open { stream_id }).await.is_err() {
        return false;
    }
    match open_rx.await {
        Ok(Ok(())) => true,
        Ok(Err(reason)) => {
            warn!(link = %link, stream_id, %reason, "stream open rejected");
            false
        }
        Err(_) => false,
    }
}

/// Bidirectional relay between the local socket and the session frames.
async fn relay_stream(
    link: &str,
    stream_id: u64,
    sock: TcpStream,
    outgoing: &mpsc::Sender<Frame>,
    data_rx: &mut mpsc::Receiver<Vec<u8>>,
) {
    let (mut read_half, mut write_half) = sock.into_split();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = outgoing.send(Frame::Close { stream_id }).await;
                        break;
                    }
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        if outgoing.send(Frame::Data { stream_id, data }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(link = %link, stream_id, error = %e, "local read error");
                        let _ = outgoing.send(Frame::Close { stream_id }).await;
                        break;
                    }
                }
            }
            msg = data_rx.recv() => {
                match msg {
                    Some(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            debug!(link = %link, stream_id, error = %e, "local write error");
                            let _ = outgoing.send(Frame::Close { stream_id }).await;
                            break;
                        }
                    }
                    // remote side closed the stream, or the session ended
                    None => break,
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::*;
    use std::time::Duration;
    use tgate_core::Secret;

    fn spec(local_port: u16, remote_port: u16, auth: Credential) -> LinkSpec {
        LinkSpec {
            name: "test".into(),
            local_bind_addr: "127.0.0.1".into(),
            local_port,
            remote_host: "127.0.0.1".into(),
            remote_port,
            auth,
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn password() -> Credential {
        Credential::Password {
            secret: Secret::new(TEST_PASSWORD),
        }
    }

    #[tokio::test]
    async fn link_relays_bytes_both_ways() {
        let peer = FakePeer::spawn(PeerAuth::password(), PeerMode::Echo).await;
        let local_port = free_port().await;
        let handle = start(
            spec(local_port, peer.port(), password()),
            Arc::new(TcpDialer),
            fast_backoff(),
        );
        wait_link_status(&handle, LinkStatus::Up).await;

        let mut sock = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        sock.write_all(b"select 1;").await.unwrap();
        let mut buf = vec![0u8; 9];
        sock.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"select 1;");

        handle.stop().await;
    }

    #[tokio::test]
    async fn pubkey_auth_succeeds() {
        let (key_path, public) = write_test_key(&[42u8; 32]);

        let peer = FakePeer::spawn(PeerAuth::Key(public), PeerMode::Echo).await;
        let local_port = free_port().await;
        let handle = start(
            spec(
                local_port,
                peer.port(),
                Credential::KeyFile {
                    path: key_path.clone(),
                    passphrase: None,
                },
            ),
            Arc::new(TcpDialer),
            fast_backoff(),
        );
        wait_link_status(&handle, LinkStatus::Up).await;

        handle.stop().await;
        std::fs::remove_file(key_path).ok();
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let peer = FakePeer::spawn(PeerAuth::RejectAll, PeerMode::Echo).await;
        let local_port = free_port().await;
        let handle = start(
            spec(local_port, peer.port(), password()),
            Arc::new(TcpDialer),
            fast_backoff(),
        );
        wait_link_status(&handle, LinkStatus::Failed).await;

        // well past several backoff periods; a retrying link would reconnect
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(peer.sessions_accepted(), 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn link_reconnects_after_session_drop() {
        let peer = FakePeer::spawn(PeerAuth::password(), PeerMode::Echo).await;
        let local_port = free_port().await;
        let handle = start(
            spec(local_port, peer.port(), password()),
            Arc::new(TcpDialer),
            fast_backoff(),
        );
        wait_link_status(&handle, LinkStatus::Up).await;

        peer.kill_sessions();
        wait_link_left(&handle, LinkStatus::Up).await;
        wait_link_status(&handle, LinkStatus::Up).await;
        assert!(peer.sessions_accepted() >= 2);

        handle.stop().await;
    }

    #[tokio::test]
    async fn stream_error_does_not_affect_other_streams() {
        let peer = FakePeer::spawn(PeerAuth::password(), PeerMode::Echo).await;
        let local_port = free_port().await;
        let handle = start(
            spec(local_port, peer.port(), password()),
            Arc::new(TcpDialer),
            fast_backoff(),
        );
        wait_link_status(&handle, LinkStatus::Up).await;

        let mut keep = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let drop_me = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();

        keep.write_all(b"first").await.unwrap();
        let mut buf = vec![0u8; 5];
        keep.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        // abort the second connection mid-session
        drop(drop_me);
        tokio::time::sleep(Duration::from_millis(50)).await;

        keep.write_all(b"second").await.unwrap();
        let mut buf = vec![0u8; 6];
        keep.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");
        assert_eq!(handle.status(), LinkStatus::Up);

        handle.stop().await;
    }
}
