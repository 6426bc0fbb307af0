//! Accept loop and per-connection plumbing.
//!
//! Each accepted socket gets two tasks: a reader that feeds the frame
//! decoder and dispatches complete requests, and a write pump that drains
//! the connection's outbox channel onto the socket. Replies therefore leave
//! in exactly the order they were queued, whether they came from the
//! dispatcher or from a worker thread.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cumulus_auth::{TokenService, UserStore};
use cumulus_catalog::Catalog;
use cumulus_protocol::{encode, FrameDecoder, Message};
use cumulus_storage::StorageEngine;

use crate::config::DriveConfig;
use crate::dispatch::{dispatch, Outbox};
use crate::session::Session;
use crate::tasks::TaskPool;
use crate::ServerError;

/// Room beyond `max_chunk_bytes` for frames whose body is not a file chunk
/// (directory listings and the like).
const FRAME_SLACK: usize = 64 * 1024;

/// Socket read buffer size.
const READ_BUFFER: usize = 64 * 1024;

/// Shared state every connection and worker sees.
pub(crate) struct ServerInner {
    pub config: DriveConfig,
    pub storage: StorageEngine,
    pub catalog: Catalog,
    pub users: UserStore,
    pub tokens: TokenService,
    pub pool: TaskPool,
}

/// The drive server: owns the shared state and the accept loop.
pub struct DriveServer {
    inner: Arc<ServerInner>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl DriveServer {
    /// Opens storage, catalog and accounts and starts the worker pool.
    pub fn new(config: DriveConfig) -> Result<Self, ServerError> {
        let storage = StorageEngine::new(config.storage_root.clone())?;
        let catalog = Catalog::open(&config.database_file)?;
        let users = UserStore::open(&config.database_file)?;
        let tokens = TokenService::new(
            config.jwt_issuer.clone(),
            config.jwt_secret.as_bytes().to_vec(),
            config.token_ttl_seconds,
        );
        let pool = TaskPool::new(config.long_task_threads);

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                storage,
                catalog,
                users,
                tokens,
                pool,
            }),
            cancel: CancellationToken::new(),
            active: Arc::new(AtomicUsize::new(0)),
            local_addr: parking_lot::Mutex::new(None),
        })
    }

    /// The bound address; available once [`run`](Self::run) has bound the
    /// listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Signals every task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the listener and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind((
            self.inner.config.listen_address.as_str(),
            self.inner.config.listen_port,
        ))
        .await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(
            %local,
            workers = self.inner.config.long_task_threads,
            "drive server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(err) => warn!("accept failed: {err}"),
                    }
                }
            }
        }

        self.inner.pool.shutdown();
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if self.active.load(Ordering::Acquire) >= self.inner.config.max_clients {
            warn!(%peer, "connection limit reached, dropping connection");
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            info!(%peer, "accepted connection");
            handle_connection(inner, cancel, stream, peer).await;
            debug!(%peer, "connection closed");
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    cancel: CancellationToken,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, "set_nodelay failed: {err}");
    }

    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let outbox = Outbox::new(tx);
    let pump = tokio::spawn(write_pump(writer, rx, cancel.clone()));

    let mut session = Session::new(peer.to_string());
    let mut decoder = FrameDecoder::new(inner.config.max_chunk_bytes + FRAME_SLACK);
    let mut buf = vec![0u8; READ_BUFFER];

    'conn: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'conn,
            result = reader.read(&mut buf) => {
                let n = match result {
                    Ok(0) => break 'conn,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(peer = %session.peer, "socket read failed: {err}");
                        break 'conn;
                    }
                };
                decoder.extend_from_slice(&buf[..n]);
                loop {
                    match decoder.try_next() {
                        Ok(Some(request)) => dispatch(&inner, &mut session, request, &outbox),
                        Ok(None) => break,
                        Err(err) => {
                            warn!(
                                peer = %session.peer,
                                "protocol violation, closing connection: {err}"
                            );
                            break 'conn;
                        }
                    }
                }
            }
        }
    }

    // Closing the outbox lets the pump drain queued replies and exit;
    // worker replies arriving later fail to send and are dropped.
    drop(outbox);
    let _ = pump.await;
}

async fn write_pump(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => {
                let Some(response) = next else { break };
                let frame = match encode(&response) {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!("failed to encode response: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.write_all(&frame).await {
                    debug!("socket write failed: {err}");
                    break;
                }
            }
        }
    }
}
