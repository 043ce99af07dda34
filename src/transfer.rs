//! # Secure File Transfer
//!
//! Framed, encrypted, integrity-checked file streaming over TCP.
//!
//! - [`FileServer`]: accept loop spawning one receive pipeline per inbound
//!   connection (framed read → decrypt → persist → SHA-256 verify).
//! - [`FileClient`]: one send pipeline per outbound file (stream-hash →
//!   encrypted header → encrypted 64 KiB chunks).
//!
//! Wire protocol, per connection:
//!
//! 1. One framed, encrypted header: `filename|filesize|sha256hex[|message]`
//! 2. `ceil(filesize / chunk_size)` framed, encrypted chunks of file bytes
//!
//! Each side records transfers in its own bounded [`TransferLog`]; a record
//! is finalized to COMPLETE or FAILED exactly once and then kept read-only.
//! No failure in a single pipeline ever stops the accept loop.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crypto::TransferKey;
use crate::framing::{read_frame, write_frame};

/// Maximum finished records retained per transfer log.
pub const TRANSFER_HISTORY_SIZE: usize = 64;

/// Header field separator.
const HEADER_DELIMITER: char = '|';

/// Callback fired whenever any transfer record changes (registered, chunk
/// moved, finalized). Carries no payload; consumers re-query the log.
pub type TransferUpdateFn = Arc<dyn Fn() + Send + Sync>;

/// Callback fired exactly once per finished transfer with the final record.
/// May run on any task and must tolerate being invoked during shutdown.
pub type TransferFinishedFn = Arc<dyn Fn(TransferRecord) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Recv,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => write!(f, "send"),
            Self::Recv => write!(f, "recv"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State of one file transfer attempt, send or receive.
#[derive(Clone, Debug)]
pub struct TransferRecord {
    pub filename: String,
    pub filesize: u64,
    pub direction: TransferDirection,
    pub peer_ip: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub started_at: Instant,
    pub error: Option<String>,
}

impl TransferRecord {
    fn new(filename: String, filesize: u64, direction: TransferDirection, peer_ip: String) -> Self {
        Self {
            filename,
            filesize,
            direction,
            peer_ip,
            status: TransferStatus::Active,
            bytes_transferred: 0,
            started_at: Instant::now(),
            error: None,
        }
    }

    /// Completion percentage, 0.0 – 100.0. An empty file is always 100%.
    pub fn progress(&self) -> f64 {
        if self.filesize == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.filesize as f64 * 100.0).min(100.0)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Instantaneous throughput in MB/s.
    pub fn speed_mbps(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Handle to one live record inside a [`TransferLog`].
///
/// Only the pipeline that owns the transfer mutates it; everyone else sees
/// snapshots. The first terminal status wins; later transitions are ignored.
#[derive(Clone)]
pub struct TransferHandle {
    record: Arc<Mutex<TransferRecord>>,
}

impl TransferHandle {
    fn add_bytes(&self, n: u64) {
        self.record.lock().bytes_transferred += n;
    }

    fn complete(&self) {
        let mut record = self.record.lock();
        if !record.status.is_terminal() {
            record.status = TransferStatus::Complete;
        }
    }

    fn fail(&self, error: impl Into<String>) {
        let mut record = self.record.lock();
        if !record.status.is_terminal() {
            record.status = TransferStatus::Failed;
            record.error = Some(error.into());
        }
    }

    pub fn snapshot(&self) -> TransferRecord {
        self.record.lock().clone()
    }
}

/// Append-only, bounded list of transfer records.
pub struct TransferLog {
    records: Mutex<VecDeque<Arc<Mutex<TransferRecord>>>>,
    capacity: usize,
}

impl TransferLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn register(&self, record: TransferRecord) -> TransferHandle {
        let entry = Arc::new(Mutex::new(record));
        let mut records = self.records.lock();
        records.push_back(entry.clone());
        while records.len() > self.capacity {
            records.pop_front();
        }
        TransferHandle { record: entry }
    }

    /// Snapshot of every retained record, oldest first.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.records.lock().iter().map(|r| r.lock().clone()).collect()
    }
}

impl Default for TransferLog {
    fn default() -> Self {
        Self::new(TRANSFER_HISTORY_SIZE)
    }
}

/// Reduce a received filename to its final path component.
///
/// Path separators and parent references are never honored, so a hostile
/// header like `../../etc/passwd` lands as `passwd` inside the receive
/// directory. Empty or dot-only names become `unnamed`.
pub fn sanitize_filename(raw: &str) -> String {
    let name = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    match name {
        "" | "." | ".." => "unnamed".to_string(),
        _ => name.to_string(),
    }
}

/// Parsed transfer header.
struct TransferHeader {
    filename: String,
    filesize: u64,
    expected_digest: String,
    message: Option<String>,
}

fn parse_header(text: &str) -> Result<TransferHeader> {
    let parts: Vec<&str> = text.split(HEADER_DELIMITER).collect();
    if parts.len() < 3 {
        anyhow::bail!("invalid header format: expected filename|filesize|sha256, got {} field(s)", parts.len());
    }

    let filename = sanitize_filename(parts[0]);
    let filesize: u64 = parts[1]
        .trim()
        .parse()
        .with_context(|| format!("invalid file size in header: {:?}", parts[1]))?;
    let expected_digest = parts[2].trim().to_string();
    let message = if parts.len() > 3 {
        Some(parts[3..].join("|"))
    } else {
        None
    };

    Ok(TransferHeader {
        filename,
        filesize,
        expected_digest,
        message,
    })
}

fn digest_prefix(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn chunk_count(filesize: u64, chunk_size: usize) -> u64 {
    if filesize == 0 {
        0
    } else {
        filesize.div_ceil(chunk_size as u64)
    }
}

struct ServerShared {
    key: TransferKey,
    receive_dir: PathBuf,
    chunk_size: usize,
    max_frame_len: usize,
    log: TransferLog,
    on_update: Option<TransferUpdateFn>,
    on_received: Option<TransferFinishedFn>,
}

impl ServerShared {
    fn notify_update(&self) {
        if let Some(cb) = &self.on_update {
            cb();
        }
    }
}

/// TCP server receiving encrypted files from peers.
///
/// Each accepted connection runs in its own task; a failing transfer never
/// blocks or kills the others. Shutdown stops the accept loop but lets
/// in-flight pipelines run to their natural end.
pub struct FileServer {
    port: u16,
    backlog: u32,
    shared: Arc<ServerShared>,
    token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileServer {
    pub fn new(config: &Config, key: TransferKey) -> Self {
        Self {
            port: config.transfer_port,
            backlog: config.transfer_backlog,
            shared: Arc::new(ServerShared {
                key,
                receive_dir: config.receive_dir.clone(),
                chunk_size: config.chunk_size,
                max_frame_len: config.max_frame_len,
                log: TransferLog::default(),
                on_update: None,
                on_received: None,
            }),
            token: CancellationToken::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Attach observers. Must be called before [`FileServer::start`].
    pub fn with_observers(
        mut self,
        on_update: Option<TransferUpdateFn>,
        on_received: Option<TransferFinishedFn>,
    ) -> Self {
        let shared = Arc::get_mut(&mut self.shared).expect("observers attached before start");
        shared.on_update = on_update;
        shared.on_received = on_received;
        self
    }

    /// Bind the listening socket and spawn the accept loop.
    ///
    /// Returns the bound address (useful when configured with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port)
            .parse()
            .expect("valid bind address");

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("cannot bind TCP server on port {}", self.port))?;
        let listener = socket.listen(self.backlog)?;
        let local_addr = listener.local_addr()?;

        info!("FileServer listening on {}", local_addr);

        let shared = self.shared.clone();
        let token = self.token.clone();
        *self.accept_task.lock() = Some(tokio::spawn(Self::accept_loop(listener, shared, token)));

        Ok(local_addr)
    }

    /// Stop accepting connections. In-flight receives run to completion.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("FileServer stopped");
    }

    /// Snapshot of all inbound transfer records.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.shared.log.snapshot()
    }

    async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            receive_file(shared, stream, addr.ip().to_string()).await;
                        });
                    }
                    Err(e) => warn!("Server accept error: {}", e),
                },
            }
        }
    }
}

/// Receive, decrypt, and verify a single file; always closes the connection
/// and fires the finished observer exactly once.
async fn receive_file(shared: Arc<ServerShared>, mut stream: TcpStream, peer_ip: String) {
    let mut handle: Option<TransferHandle> = None;

    if let Err(e) = run_receive(&shared, &mut stream, &peer_ip, &mut handle).await {
        if let Some(h) = &handle {
            h.fail(e.to_string());
        }
        error!("Receive failed from {}: {:#}", peer_ip, e);
    }

    drop(stream);
    shared.notify_update();

    if let Some(h) = &handle {
        if let Some(cb) = &shared.on_received {
            cb(h.snapshot());
        }
    }
}

async fn run_receive(
    shared: &ServerShared,
    stream: &mut TcpStream,
    peer_ip: &str,
    handle_out: &mut Option<TransferHandle>,
) -> Result<()> {
    let token = read_frame(stream, shared.max_frame_len).await?;
    let header_raw = shared.key.open(&token)?;
    let header_text = std::str::from_utf8(&header_raw).context("header is not valid UTF-8")?;
    let header = parse_header(header_text)?;

    let handle = shared.log.register(TransferRecord::new(
        header.filename.clone(),
        header.filesize,
        TransferDirection::Recv,
        peer_ip.to_string(),
    ));
    *handle_out = Some(handle.clone());
    shared.notify_update();

    if let Some(message) = &header.message {
        info!("Message from {}: {}", peer_ip, message);
    }

    tokio::fs::create_dir_all(&shared.receive_dir).await?;
    let dest = shared.receive_dir.join(&header.filename);
    let mut file = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("cannot create {}", dest.display()))?;

    let mut hasher = Sha256::new();
    for _ in 0..chunk_count(header.filesize, shared.chunk_size) {
        let frame = read_frame(stream, shared.max_frame_len).await?;
        let plaintext = shared.key.open(&frame)?;

        file.write_all(&plaintext).await?;
        hasher.update(&plaintext);
        handle.add_bytes(plaintext.len() as u64);
        shared.notify_update();
    }
    file.flush().await?;

    let actual_digest = hex::encode(hasher.finalize());
    if actual_digest.eq_ignore_ascii_case(&header.expected_digest) {
        handle.complete();
        info!(
            "Received {} from {} ({:.2} MB/s, hash OK)",
            header.filename,
            peer_ip,
            handle.snapshot().speed_mbps()
        );
    } else {
        // File stays on disk for inspection; only the record is failed.
        handle.fail(format!(
            "Hash mismatch: expected {}..., got {}...",
            digest_prefix(&header.expected_digest),
            digest_prefix(&actual_digest)
        ));
        error!("Hash mismatch for {} from {}", header.filename, peer_ip);
    }

    Ok(())
}

struct ClientShared {
    key: TransferKey,
    port: u16,
    chunk_size: usize,
    max_frame_len: usize,
    connect_timeout: Duration,
    log: TransferLog,
    on_update: Option<TransferUpdateFn>,
    on_finished: Option<TransferFinishedFn>,
}

impl ClientShared {
    fn notify_update(&self) {
        if let Some(cb) = &self.on_update {
            cb();
        }
    }
}

/// Sends files to peers, one independent pipeline per file.
pub struct FileClient {
    shared: Arc<ClientShared>,
}

impl FileClient {
    pub fn new(config: &Config, key: TransferKey) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                key,
                port: config.transfer_port,
                chunk_size: config.chunk_size,
                max_frame_len: config.max_frame_len,
                connect_timeout: config.connect_timeout(),
                log: TransferLog::default(),
                on_update: None,
                on_finished: None,
            }),
        }
    }

    /// Attach observers. Must be called before the first send.
    pub fn with_observers(
        mut self,
        on_update: Option<TransferUpdateFn>,
        on_finished: Option<TransferFinishedFn>,
    ) -> Self {
        let shared = Arc::get_mut(&mut self.shared).expect("observers attached before first send");
        shared.on_update = on_update;
        shared.on_finished = on_finished;
        self
    }

    /// Spawn a pipeline sending one file to `peer_ip`.
    ///
    /// The returned handle resolves when the pipeline finishes; dropping it
    /// does not cancel the transfer.
    pub fn send(&self, peer_ip: &str, path: impl Into<PathBuf>, message: Option<String>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let peer_ip = peer_ip.to_string();
        let path = path.into();
        tokio::spawn(async move {
            send_worker(shared, peer_ip, path, message).await;
        })
    }

    /// Send several files to one peer, one independent pipeline per file.
    /// The optional message rides on the first file only.
    pub fn send_many(
        &self,
        peer_ip: &str,
        paths: &[PathBuf],
        message: Option<String>,
    ) -> Vec<JoinHandle<()>> {
        paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let msg = if i == 0 { message.clone() } else { None };
                self.send(peer_ip, path.clone(), msg)
            })
            .collect()
    }

    /// Snapshot of all outbound transfer records.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.shared.log.snapshot()
    }
}

/// One outbound pipeline: hash, connect, stream, finalize.
async fn send_worker(shared: Arc<ClientShared>, peer_ip: String, path: PathBuf, message: Option<String>) {
    let filesize = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            error!("File not found: {}", path.display());
            return;
        }
    };

    let digest = match hash_file(&path, shared.chunk_size).await {
        Ok(d) => d,
        Err(e) => {
            error!("Cannot hash {}: {}", path.display(), e);
            return;
        }
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());

    let handle = shared.log.register(TransferRecord::new(
        filename.clone(),
        filesize,
        TransferDirection::Send,
        peer_ip.clone(),
    ));
    shared.notify_update();

    match run_send(&shared, &peer_ip, &path, &filename, filesize, &digest, message, &handle).await {
        Ok(()) => {
            handle.complete();
            info!(
                "Sent {} to {} ({:.2} MB/s)",
                filename,
                peer_ip,
                handle.snapshot().speed_mbps()
            );
        }
        Err(e) => {
            handle.fail(e.to_string());
            error!("Send failed {} -> {}: {:#}", filename, peer_ip, e);
        }
    }

    shared.notify_update();
    if let Some(cb) = &shared.on_finished {
        cb(handle.snapshot());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_send(
    shared: &ClientShared,
    peer_ip: &str,
    path: &Path,
    filename: &str,
    filesize: u64,
    digest: &str,
    message: Option<String>,
    handle: &TransferHandle,
) -> Result<()> {
    let addr = format!("{}:{}", peer_ip, shared.port);
    let mut stream = tokio::time::timeout(shared.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| anyhow!("connect to {} timed out after {:?}", addr, shared.connect_timeout))?
        .with_context(|| format!("cannot connect to {}", addr))?;

    let mut header = format!("{}{}{}{}{}", filename, HEADER_DELIMITER, filesize, HEADER_DELIMITER, digest);
    if let Some(msg) = message {
        header.push(HEADER_DELIMITER);
        header.push_str(&msg);
    }

    let token = shared.key.seal(header.as_bytes())?;
    write_frame(&mut stream, &token).await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; shared.chunk_size];
    for _ in 0..chunk_count(filesize, shared.chunk_size) {
        let filled = read_chunk(&mut file, &mut buf).await?;
        if filled == 0 {
            anyhow::bail!("file truncated while sending: {}", path.display());
        }

        let encrypted = shared.key.seal(&buf[..filled])?;
        write_frame(&mut stream, &encrypted).await?;

        handle.add_bytes(filled as u64);
        shared.notify_update();
    }

    stream.shutdown().await.ok();
    Ok(())
}

/// Fill `buf` from the file, up to one chunk; short only at EOF.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream a file once, returning its SHA-256 hex digest.
pub async fn hash_file(path: &Path, chunk_size: usize) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
