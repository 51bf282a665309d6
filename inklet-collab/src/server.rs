//! TCP server: accept loop, worker pool, and reply routing.
//!
//! A supervisor task owns the listener. Each accepted socket is split;
//! the write half goes to a per-connection writer task fed through a
//! channel, and the read half is handed to the worker with the fewest
//! live connections. Workers own their connection sets outright and
//! multiplex reads with a [`FuturesUnordered`] of in-flight read futures,
//! so the steady-state read path takes no shared lock.
//!
//! Replies route through a registry of connection handles keyed by
//! connection id. Edits broadcast to every connection bound to one of the
//! affected session's participants; everything else goes back to the
//! origin alone.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};

use crate::balancer::LoadBalancer;
use crate::idgen::IdGen;
use crate::protocol::{MessageKind, ProtocolError, Request, Response};
use crate::repository::{Outbound, Reply, Repository, Routing};
use crate::store::StoreError;

/// A worker drops a connection whose receive buffer grows past this
/// without yielding a complete message.
const MAX_PENDING_BYTES: usize = 256 * 1024;

const READ_CHUNK: usize = 4096;

/// Server failures surfaced to the binary.
#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Store(StoreError),
    Config(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "server I/O error: {e}"),
            Self::Store(e) => write!(f, "storage error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Server settings, loadable from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub workers: usize,
    pub data_dir: PathBuf,
    /// Log destination for the binary; `None` leaves logs on stderr.
    pub log_file: Option<PathBuf>,
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 4242,
            workers: 4,
            data_dir: PathBuf::from("inklet-data"),
            log_file: None,
            write_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ServerError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Counters exposed for logging and tests.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub messages_processed: AtomicU64,
}

type ConnId = u64;

/// Routing handle for one live connection.
struct ConnHandle {
    tx: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    user_id: Option<String>,
    worker: usize,
}

/// Shared between the supervisor and the workers.
struct ServerCtx {
    repo: Repository,
    registry: Mutex<HashMap<ConnId, ConnHandle>>,
    balancer: LoadBalancer,
    stats: ServerStats,
    write_timeout: Duration,
}

impl ServerCtx {
    /// Deliver encoded bytes to one connection. A closed channel means
    /// the writer died; the read side will notice shortly.
    async fn send_to(&self, id: ConnId, bytes: &Arc<Vec<u8>>) {
        let registry = self.registry.lock().await;
        if let Some(handle) = registry.get(&id) {
            let _ = handle.tx.send(bytes.clone());
        }
    }

    async fn broadcast(&self, participants: &[String], bytes: &Arc<Vec<u8>>) {
        let registry = self.registry.lock().await;
        for handle in registry.values() {
            if let Some(user) = &handle.user_id {
                if participants.iter().any(|p| p == user) {
                    let _ = handle.tx.send(bytes.clone());
                }
            }
        }
    }

    /// Record which user a connection speaks for. Requests carry the id
    /// explicitly; a successful login reveals it for that connection.
    async fn bind_user(&self, id: ConnId, user_id: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(handle) = registry.get_mut(&id) {
            if handle.user_id.as_deref() != Some(user_id) {
                handle.user_id = Some(user_id.to_string());
            }
        }
    }

    /// Tear down one connection: registry entry, balancer count, and the
    /// user's session membership if no other connection carries it.
    async fn close_conn(&self, id: ConnId) {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.remove(&id)
        };
        let Some(handle) = removed else { return };
        self.balancer.release(handle.worker);
        if let Some(user_id) = handle.user_id {
            let still_connected = {
                let registry = self.registry.lock().await;
                registry
                    .values()
                    .any(|h| h.user_id.as_deref() == Some(user_id.as_str()))
            };
            if !still_connected {
                self.repo.disconnect(&user_id).await;
            }
        }
        log::debug!("Connection {id} closed");
    }
}

struct Assignment {
    id: ConnId,
    reader: OwnedReadHalf,
}

/// The collaboration server. Bind first, then run; binding separately
/// lets callers learn an OS-assigned port before accepting.
pub struct CollabServer {
    listener: TcpListener,
    ctx: Arc<ServerCtx>,
    workers: usize,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Signals a running server to stop accepting and wind down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

impl CollabServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.addr()).await?;
        let repo = Repository::new(&config.data_dir, IdGen::new())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = config.workers.max(1);
        log::info!(
            "Listening on {} with {} workers",
            listener.local_addr()?,
            workers
        );
        Ok(Self {
            listener,
            ctx: Arc::new(ServerCtx {
                repo,
                registry: Mutex::new(HashMap::new()),
                balancer: LoadBalancer::new(workers),
                stats: ServerStats::default(),
                write_timeout: Duration::from_millis(config.write_timeout_ms),
            }),
            workers,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn stats(&self) -> &ServerStats {
        &self.ctx.stats
    }

    /// Accept connections until shut down. Worker tasks exit when their
    /// assignment channels close at the end of this call.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut assign_txs = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let (tx, rx) = mpsc::unbounded_channel();
            assign_txs.push(tx);
            tokio::spawn(worker_loop(worker, rx, self.ctx.clone()));
        }

        let mut shutdown_rx = self.shutdown_rx;
        let mut next_id: ConnId = 1;
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.changed() => {
                    log::info!("Shutdown requested, closing listener");
                    return Ok(());
                }
            };
            let (socket, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            let _ = socket.set_nodelay(true);

            let id = next_id;
            next_id += 1;
            let worker = self.ctx.balancer.assign();
            let (reader, writer) = socket.into_split();

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(writer_loop(id, writer, rx, self.ctx.write_timeout));
            {
                let mut registry = self.ctx.registry.lock().await;
                registry.insert(
                    id,
                    ConnHandle {
                        tx,
                        user_id: None,
                        worker,
                    },
                );
            }
            self.ctx
                .stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            log::info!("Connection {id} from {peer} assigned to worker {worker}");

            if assign_txs[worker]
                .send(Assignment { id, reader })
                .is_err()
            {
                log::error!("Worker {worker} is gone, dropping connection {id}");
                self.ctx.close_conn(id).await;
            }
        }
    }
}

/// Drains a connection's outbound queue onto the socket. A slow or dead
/// peer trips the write timeout and the task exits, which closes the
/// write half.
async fn writer_loop(
    id: ConnId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    write_timeout: Duration,
) {
    while let Some(bytes) = rx.recv().await {
        match tokio::time::timeout(write_timeout, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Write to connection {id} failed: {e}");
                return;
            }
            Err(_) => {
                log::warn!("Write to connection {id} timed out");
                return;
            }
        }
    }
}

type ReadOutcome = (ConnId, OwnedReadHalf, std::io::Result<Vec<u8>>);
type ReadFut = Pin<Box<dyn Future<Output = ReadOutcome> + Send>>;

fn read_one(id: ConnId, mut reader: OwnedReadHalf) -> ReadFut {
    Box::pin(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let result = reader.read(&mut buf).await.map(|n| {
            buf.truncate(n);
            buf
        });
        (id, reader, result)
    })
}

/// One worker: receives assignments, multiplexes reads over its own
/// connections, decodes complete messages off each connection's pending
/// buffer, and dispatches them.
async fn worker_loop(
    worker: usize,
    mut assign_rx: mpsc::UnboundedReceiver<Assignment>,
    ctx: Arc<ServerCtx>,
) {
    let mut reads: FuturesUnordered<ReadFut> = FuturesUnordered::new();
    let mut pending: HashMap<ConnId, Vec<u8>> = HashMap::new();

    loop {
        tokio::select! {
            assignment = assign_rx.recv() => {
                match assignment {
                    Some(Assignment { id, reader }) => {
                        pending.insert(id, Vec::new());
                        reads.push(read_one(id, reader));
                    }
                    None => {
                        log::debug!("Worker {worker} shutting down");
                        return;
                    }
                }
            }
            Some((id, reader, result)) = reads.next(), if !reads.is_empty() => {
                let chunk = match result {
                    Ok(chunk) if chunk.is_empty() => {
                        pending.remove(&id);
                        ctx.close_conn(id).await;
                        continue;
                    }
                    Ok(chunk) => chunk,
                    Err(e) => {
                        log::warn!("Read from connection {id} failed: {e}");
                        pending.remove(&id);
                        ctx.close_conn(id).await;
                        continue;
                    }
                };
                let Some(buf) = pending.get_mut(&id) else { continue };
                buf.extend_from_slice(&chunk);
                if drain_messages(worker, id, buf, &ctx).await {
                    reads.push(read_one(id, reader));
                } else {
                    pending.remove(&id);
                    ctx.close_conn(id).await;
                }
            }
        }
    }
}

/// Peel complete messages off a connection's buffer and dispatch them.
/// Returns `false` when the connection should be dropped.
async fn drain_messages(worker: usize, id: ConnId, buf: &mut Vec<u8>, ctx: &ServerCtx) -> bool {
    loop {
        match Request::decode_prefix(buf) {
            Ok((request, used)) => {
                buf.drain(..used);
                handle_message(worker, id, request, ctx).await;
            }
            Err(ProtocolError::Truncated) => {
                if buf.len() > MAX_PENDING_BYTES {
                    log::warn!(
                        "Connection {id} exceeded {MAX_PENDING_BYTES} pending bytes, dropping"
                    );
                    return false;
                }
                return true;
            }
            Err(e) => {
                // Without a length prefix there is no way to resync past
                // a malformed message, so discard the buffer but keep the
                // connection.
                log::warn!("Malformed message on connection {id}: {e}");
                buf.clear();
                let error = Response::error("Malformed message");
                if let Ok(bytes) = error.encode() {
                    ctx.send_to(id, &Arc::new(bytes)).await;
                }
                return true;
            }
        }
    }
}

async fn handle_message(worker: usize, id: ConnId, request: Request, ctx: &ServerCtx) {
    log::debug!(
        "Worker {worker} handling {:?} on connection {id}",
        request.kind()
    );
    if let Some(user_id) = request.user_id() {
        ctx.bind_user(id, user_id).await;
    }

    let reply = ctx.repo.process(request).await;
    ctx.stats.messages_processed.fetch_add(1, Ordering::Relaxed);

    // A successful login tells us which user this connection speaks for.
    if let Outbound::Reply(response) = &reply.message {
        if response.kind == MessageKind::Login && !response.is_error() {
            if let Some(user_id) = response.fields.first() {
                ctx.bind_user(id, user_id).await;
            }
        }
    }

    route_reply(id, reply, ctx).await;
}

async fn route_reply(id: ConnId, reply: Reply, ctx: &ServerCtx) {
    let bytes = match reply.message.encode() {
        Ok(bytes) => Arc::new(bytes),
        Err(e) => {
            log::error!("Failed to encode reply for connection {id}: {e}");
            return;
        }
    };
    match reply.routing {
        Routing::Unicast => ctx.send_to(id, &bytes).await,
        Routing::Broadcast { participants } => ctx.broadcast(&participants, &bytes).await,
    }
}
