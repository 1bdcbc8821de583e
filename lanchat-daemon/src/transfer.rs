//! File transfer I/O: the sending worker (gate, connect, metadata, READY, chunks, COMPLETE) and
//! the receiving worker spawned per accepted data connection. Record state lives in the core's
//! transfer table; these workers only drive it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanchat_core::protocol::{COMPLETE, READY};
use lanchat_core::transfer::{check_size, numbered_filename, stored_filename};
use lanchat_core::{
    Event, FileMetadata, PeerId, TransferError, TransferId, TransferKey, TransferStatus,
    CHUNK_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::CONNECT_TIMEOUT;
use crate::error::NodeError;
use crate::framing;
use crate::node::Shared;

/// Budget for each step of the data-channel handshake, and for each chunk.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Numbered alternatives tried when a stored name is taken.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum TransferFailure {
    #[error("{step} timed out")]
    Timeout { step: &'static str },
    #[error("cancelled")]
    Cancelled,
    #[error("{step}: {source}")]
    Io {
        step: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("expected {expected}, got {got:?}")]
    BadAck { expected: &'static str, got: String },
    #[error("connection closed after {received} of {expected} bytes")]
    Short { received: u64, expected: u64 },
    #[error("declared size {declared} does not match the requested {requested}")]
    SizeMismatch { declared: u64, requested: u64 },
    #[error("source file ended after {read} of {expected} bytes")]
    SourceShrunk { read: u64, expected: u64 },
    #[error(transparent)]
    Policy(#[from] TransferError),
}

/// Run `fut` bounded by `limit` and by cancellation.
async fn step<T, F>(
    token: &CancellationToken,
    what: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, TransferFailure>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(TransferFailure::Cancelled),
        r = tokio::time::timeout(limit, fut) => match r {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(source)) => Err(TransferFailure::Io { step: what, source }),
            Err(_) => Err(TransferFailure::Timeout { step: what }),
        },
    }
}

/// Read exactly `expected.len()` bytes and compare them to the ack token.
async fn expect_ack<R: AsyncRead + Unpin>(
    stream: &mut R,
    expected: &'static [u8],
    token: &CancellationToken,
) -> Result<(), TransferFailure> {
    let name = if expected == READY { "READY" } else { "COMPLETE" };
    let mut buf = vec![0u8; expected.len()];
    step(token, name, TRANSFER_TIMEOUT, stream.read_exact(&mut buf)).await?;
    if buf != expected {
        return Err(TransferFailure::BadAck {
            expected: name,
            got: String::from_utf8_lossy(&buf).into_owned(),
        });
    }
    Ok(())
}

async fn write_ack<W: AsyncWrite + Unpin>(
    stream: &mut W,
    ack: &'static [u8],
    token: &CancellationToken,
) -> Result<(), TransferFailure> {
    step(token, "writing ack", TRANSFER_TIMEOUT, async {
        stream.write_all(ack).await?;
        stream.flush().await
    })
    .await
}

async fn report_progress(shared: &Shared, key: &TransferKey, transferred: u64) {
    let event = shared.core.lock().await.record_progress(key, transferred);
    if let Some(event) = event {
        shared.gateway.emit(event);
    }
}

/// Move the record to its terminal state and report it. No-op if it already got there.
async fn settle(shared: &Shared, key: &TransferKey, outcome: Result<(), String>) -> bool {
    let event = shared.core.lock().await.finish_transfer(key, outcome);
    match event {
        Some(event) => {
            shared.gateway.emit(event);
            true
        }
        None => false,
    }
}

/// Validate `path`, record the transfer, send `file_request` and spawn the worker that uploads
/// once the peer accepts.
pub(crate) async fn offer(
    shared: &Arc<Shared>,
    peer: &PeerId,
    path: &Path,
) -> Result<TransferId, NodeError> {
    let meta = tokio::fs::metadata(path).await?;
    if !meta.is_file() {
        return Err(NodeError::NotAFile(path.to_path_buf()));
    }
    check_size(meta.len())?;
    let conn = shared
        .registry
        .get(peer)
        .await
        .ok_or_else(|| NodeError::NotConnected(peer.clone()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| NodeError::NotAFile(path.to_path_buf()))?;

    let (key, request, file_port) = {
        let mut core = shared.core.lock().await;
        let file_port = core
            .directory()
            .lookup(peer)
            .map(|e| e.file_port)
            .ok_or_else(|| NodeError::UnknownPeer(peer.clone()))?;
        let (key, request) =
            core.request_file(peer, path.to_path_buf(), filename.clone(), meta.len(), Instant::now())?;
        (key, request, file_port)
    };

    let (gate_tx, gate_rx) = oneshot::channel();
    shared.upload_gates.lock().await.insert(key.clone(), gate_tx);
    if let Err(e) = conn.send(&request) {
        shared.upload_gates.lock().await.remove(&key);
        settle(shared, &key, Err(e.to_string())).await;
        return Err(e.into());
    }
    info!(peer = %peer, transfer_id = key.id, file = %filename, size = meta.len(), "file offered");

    let target = SocketAddr::new(conn.addr().ip(), file_port);
    let id = key.id;
    tokio::spawn(upload(shared.clone(), key, path.to_path_buf(), target, gate_rx));
    Ok(id)
}

async fn upload(
    shared: Arc<Shared>,
    key: TransferKey,
    path: PathBuf,
    target: SocketAddr,
    gate: oneshot::Receiver<bool>,
) {
    let token = shared.shutdown.child_token();
    let answer = tokio::select! {
        _ = token.cancelled() => Err("cancelled".to_string()),
        r = tokio::time::timeout(TRANSFER_TIMEOUT, gate) => match r {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(_)) => Err("request abandoned".to_string()),
            Err(_) => Err(format!("no answer within {}s", TRANSFER_TIMEOUT.as_secs())),
        },
    };
    match answer {
        Ok(true) => {}
        Ok(false) => {
            // Rejected or failed by the core; it already reported the outcome.
            debug!(peer = %key.peer, transfer_id = key.id, "upload gate closed");
            return;
        }
        Err(reason) => {
            shared.upload_gates.lock().await.remove(&key);
            settle(&shared, &key, Err(reason)).await;
            return;
        }
    }

    let outcome = send_file(&shared, &key, &path, target, &token).await;
    match &outcome {
        Ok(()) => info!(peer = %key.peer, transfer_id = key.id, "upload complete"),
        Err(e) => warn!(peer = %key.peer, transfer_id = key.id, "upload failed: {}", e),
    }
    settle(&shared, &key, outcome.map_err(|e| e.to_string())).await;
}

async fn send_file(
    shared: &Shared,
    key: &TransferKey,
    path: &Path,
    target: SocketAddr,
    token: &CancellationToken,
) -> Result<(), TransferFailure> {
    let mut file = step(token, "opening file", TRANSFER_TIMEOUT, tokio::fs::File::open(path)).await?;
    let mut stream = step(token, "connecting", CONNECT_TIMEOUT, TcpStream::connect(target)).await?;

    let metadata = {
        let mut core = shared.core.lock().await;
        core.transfers_mut().begin(key, None)?;
        let rec = core
            .transfers()
            .get(key)
            .ok_or(TransferError::Unknown(key.id))?;
        FileMetadata {
            filename: rec.filename.clone(),
            filesize: rec.size,
            transfer_id: key.id,
            sender_id: core.peer_id().clone(),
            sender_name: core.profile().name.clone(),
        }
    };
    let size = metadata.filesize;
    step(
        token,
        "writing metadata",
        TRANSFER_TIMEOUT,
        framing::write_json(&mut stream, &metadata),
    )
    .await?;
    expect_ack(&mut stream, READY, token).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < size {
        let want = (size - sent).min(CHUNK_SIZE as u64) as usize;
        let n = step(token, "reading file", TRANSFER_TIMEOUT, file.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(TransferFailure::SourceShrunk {
                read: sent,
                expected: size,
            });
        }
        step(token, "sending", TRANSFER_TIMEOUT, stream.write_all(&buf[..n])).await?;
        sent += n as u64;
        report_progress(shared, key, sent).await;
    }
    step(token, "sending", TRANSFER_TIMEOUT, stream.flush()).await?;
    expect_ack(&mut stream, COMPLETE, token).await
}

/// Serve one inbound data connection. Only transfers this side accepted are received; anything
/// else is dropped without a reply.
pub(crate) async fn receive(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let token = shared.shutdown.child_token();
    let Some(dir) = shared.download_dir.clone() else {
        return;
    };
    let metadata: FileMetadata = match step(
        &token,
        "reading metadata",
        TRANSFER_TIMEOUT,
        framing::read_json::<_, FileMetadata>(&mut stream),
    )
    .await
    {
        Ok(Some(Ok(m))) => m,
        Ok(Some(Err(e))) => {
            debug!(%addr, "bad file metadata: {}", e);
            return;
        }
        Ok(None) => return,
        Err(e) => {
            debug!(%addr, "no file metadata: {}", e);
            return;
        }
    };
    let key = TransferKey::receiving(metadata.transfer_id, metadata.sender_id.clone());

    let requested = {
        let core = shared.core.lock().await;
        match core.transfers().get(&key) {
            Some(rec) if rec.status == TransferStatus::Pending && rec.accepted => Some(rec.size),
            _ => None,
        }
    };
    let Some(requested) = requested else {
        warn!(%addr, peer = %key.peer, transfer_id = key.id, "data connection for a transfer not accepted here, dropping");
        return;
    };
    if metadata.filesize != requested {
        let reason = TransferFailure::SizeMismatch {
            declared: metadata.filesize,
            requested,
        };
        warn!(peer = %key.peer, transfer_id = key.id, "{}", reason);
        settle(&shared, &key, Err(reason.to_string())).await;
        return;
    }
    if let Err(e) = check_size(metadata.filesize) {
        settle(&shared, &key, Err(e.to_string())).await;
        return;
    }

    let wanted = stored_filename(chrono::Local::now().naive_local(), &metadata.filename);
    let (file, dest, stored) =
        match step(&token, "creating file", TRANSFER_TIMEOUT, create_unique(&dir, &wanted)).await {
            Ok(created) => created,
            Err(e) => {
                warn!(peer = %key.peer, transfer_id = key.id, "cannot store download: {}", e);
                settle(&shared, &key, Err(e.to_string())).await;
                return;
            }
        };
    if let Err(e) = shared
        .core
        .lock()
        .await
        .transfers_mut()
        .begin(&key, Some(dest.clone()))
    {
        debug!(transfer_id = key.id, "cannot start download: {}", e);
        discard(&dest).await;
        return;
    }
    info!(peer = %key.peer, transfer_id = key.id, file = %stored, size = metadata.filesize, "download started");

    match receive_file(&shared, &key, &mut stream, file, metadata.filesize, &token).await {
        Ok(()) => {
            if settle(&shared, &key, Ok(())).await {
                info!(peer = %key.peer, transfer_id = key.id, path = %dest.display(), "download complete");
                shared.gateway.emit(Event::FileReceived {
                    from: key.peer.clone(),
                    from_name: metadata.sender_name,
                    transfer_id: key.id,
                    filename: stored,
                    path: dest,
                });
            }
        }
        Err(e) => {
            warn!(peer = %key.peer, transfer_id = key.id, "download failed: {}", e);
            discard(&dest).await;
            settle(&shared, &key, Err(e.to_string())).await;
        }
    }
}

/// Create `name` in `dir`, or the first free numbered variant. Existing files are never opened.
async fn create_unique(dir: &Path, name: &str) -> io::Result<(tokio::fs::File, PathBuf, String)> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = match n {
            0 => name.to_string(),
            n => numbered_filename(name, n),
        };
        let path = dir.join(&candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", name),
    ))
}

/// Remove a file this worker created.
async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), "removing partial file: {}", e);
        }
    }
}

async fn receive_file(
    shared: &Shared,
    key: &TransferKey,
    stream: &mut TcpStream,
    mut file: tokio::fs::File,
    size: u64,
    token: &CancellationToken,
) -> Result<(), TransferFailure> {
    write_ack(stream, READY, token).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received = 0u64;
    while received < size {
        let want = (size - received).min(CHUNK_SIZE as u64) as usize;
        let n = step(token, "receiving", TRANSFER_TIMEOUT, stream.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(TransferFailure::Short {
                received,
                expected: size,
            });
        }
        step(token, "writing file", TRANSFER_TIMEOUT, file.write_all(&buf[..n])).await?;
        received += n as u64;
        report_progress(shared, key, received).await;
    }
    step(token, "writing file", TRANSFER_TIMEOUT, file.flush()).await?;
    write_ack(stream, COMPLETE, token).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_must_match_exactly() {
        let token = CancellationToken::new();
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"READY").await.unwrap();
        expect_ack(&mut b, READY, &token).await.unwrap();

        a.write_all(b"NOPE!").await.unwrap();
        match expect_ack(&mut b, READY, &token).await {
            Err(TransferFailure::BadAck { got, .. }) => assert_eq!(got, "NOPE!"),
            other => panic!("expected BadAck, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn short_ack_is_an_io_failure() {
        let token = CancellationToken::new();
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"COMP").await.unwrap();
        drop(a);
        assert!(matches!(
            expect_ack(&mut b, COMPLETE, &token).await,
            Err(TransferFailure::Io { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_step_stops_waiting() {
        let token = CancellationToken::new();
        let (_a, mut b) = tokio::io::duplex(64);
        token.cancel();
        assert!(matches!(
            expect_ack(&mut b, READY, &token).await,
            Err(TransferFailure::Cancelled)
        ));
    }

    #[tokio::test]
    async fn taken_names_are_never_reopened() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240501_130405_a.txt"), b"first").unwrap();
        std::fs::write(dir.path().join("20240501_130405_a_1.txt"), b"second").unwrap();

        let (_file, path, name) = create_unique(dir.path(), "20240501_130405_a.txt")
            .await
            .unwrap();
        assert_eq!(name, "20240501_130405_a_2.txt");
        assert_eq!(path, dir.path().join(&name));
        assert_eq!(
            std::fs::read(dir.path().join("20240501_130405_a.txt")).unwrap(),
            b"first"
        );
        assert_eq!(
            std::fs::read(dir.path().join("20240501_130405_a_1.txt")).unwrap(),
            b"second"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let token = CancellationToken::new();
        let (_a, mut b) = tokio::io::duplex(64);
        match expect_ack(&mut b, COMPLETE, &token).await {
            Err(TransferFailure::Timeout { step }) => assert_eq!(step, "COMPLETE"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
