//! Connection server: accept loop, per-connection tasks, cooperative shutdown
//!
//! Each accepted connection gets its own task that walks
//!
//! ```text
//! Accepted → Handshaking → AwaitingRequest → Dispatching → Responding → Closed
//! ```
//!
//! with `Errored` reachable from every non-terminal state. Once the session
//! key exists, a failure is answered with an encrypted `101 SERVER ERROR`
//! frame; a failed handshake closes the socket without a reply.

use crate::config::ServerConfig;
use crate::crypto::KemAlgorithm;
use crate::protocol::{Response, StatusCode};
use crate::session::SecureSession;
use crate::QstpError;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receives the decrypted payload of a connection and produces the reply
/// payload. Returning `Err` makes the server answer `101 SERVER ERROR`.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>, peer: SocketAddr) -> anyhow::Result<Vec<u8>>;
}

/// Lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    AwaitingRequest,
    Dispatching,
    Responding,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }

    fn advance(&mut self, id: u64, next: ConnectionState) {
        log::trace!("[conn {}] {} -> {}", id, self, next);
        *self = next;
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Accepted => "ACCEPTED",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::AwaitingRequest => "AWAITING_REQUEST",
            ConnectionState::Dispatching => "DISPATCHING",
            ConnectionState::Responding => "RESPONDING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

/// Live connection tasks. A task removes its own entry when it ends, so
/// the registry stays populated until the connection is really gone.
#[derive(Default)]
struct Registry {
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    emptied: Notify,
}

impl Registry {
    async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    async fn remove(&self, id: u64) {
        let mut tasks = self.tasks.lock().await;
        tasks.remove(&id);
        if tasks.is_empty() {
            self.emptied.notify_waiters();
        }
    }

    async fn wait_empty(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.tasks.lock().await.is_empty() {
                return;
            }
            emptied.await;
        }
    }
}

/// Handle for stopping a running [`SecureServer`] from another task.
#[derive(Clone)]
pub struct ServerCloser {
    shutdown: Arc<watch::Sender<bool>>,
    connections: Arc<Registry>,
}

impl ServerCloser {
    /// Stop accepting connections. `serve` then waits for in-flight
    /// connections (bounded by the join timeout) and returns.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of connection tasks still running, including those `serve`
    /// is waiting on during shutdown
    pub async fn live_connections(&self) -> usize {
        self.connections.len().await
    }
}

struct ConnectionContext {
    kem: KemAlgorithm,
    handshake_timeout: Duration,
    handler: Arc<dyn FrameHandler>,
}

/// Listening socket plus the live-connection registry.
pub struct SecureServer {
    listener: TcpListener,
    config: ServerConfig,
    kem: KemAlgorithm,
    shutdown: Arc<watch::Sender<bool>>,
    connections: Arc<Registry>,
}

impl SecureServer {
    /// Bind the listening socket with the configured backlog.
    pub async fn bind(config: ServerConfig, kem: KemAlgorithm) -> Result<Self, QstpError> {
        let addr = tokio::net::lookup_host((config.listen.host.as_str(), config.listen.port))
            .await?
            .next()
            .ok_or_else(|| QstpError::InvalidAddress(config.listen.to_string()))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.backlog)?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            listener,
            config,
            kem,
            shutdown: Arc::new(shutdown),
            connections: Arc::new(Registry::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, QstpError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn kem(&self) -> KemAlgorithm {
        self.kem
    }

    pub fn closer(&self) -> ServerCloser {
        ServerCloser {
            shutdown: Arc::clone(&self.shutdown),
            connections: Arc::clone(&self.connections),
        }
    }

    /// Accept connections until [`ServerCloser::close`] is called, then
    /// join the in-flight connections and release the listener.
    pub async fn serve(self, handler: Arc<dyn FrameHandler>) -> Result<(), QstpError> {
        let local_addr = self.local_addr()?;
        info!(
            "QSTP server listening on {} ({}, backlog {})",
            local_addr, self.kem, self.config.backlog
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut next_id: u64 = 0;

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                biased;

                _ = shutdown.changed() => continue,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed on {}: {}", local_addr, e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };

                    next_id += 1;
                    self.spawn_connection(next_id, stream, peer, &handler).await;
                }
            }
        }

        info!("QSTP server on {} shutting down", local_addr);
        self.join_connections().await;
        drop(self.listener);
        Ok(())
    }

    /// Serve until `signal` resolves.
    pub async fn serve_until<F>(self, handler: Arc<dyn FrameHandler>, signal: F) -> Result<(), QstpError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let closer = self.closer();
        tokio::spawn(async move {
            signal.await;
            closer.close();
        });
        self.serve(handler).await
    }

    async fn spawn_connection(
        &self,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        handler: &Arc<dyn FrameHandler>,
    ) {
        debug!("[conn {}] Accepted connection from {}", id, peer);

        let ctx = ConnectionContext {
            kem: self.kem,
            handshake_timeout: self.config.handshake_timeout,
            handler: Arc::clone(handler),
        };
        let registry = Arc::clone(&self.connections);

        // Held across spawn + insert so the task cannot deregister first.
        let mut tasks = self.connections.tasks.lock().await;
        let task = tokio::spawn(async move {
            handle_connection(id, stream, peer, ctx).await;
            registry.remove(id).await;
        });
        tasks.insert(id, task);
    }

    async fn join_connections(&self) {
        let in_flight = self.connections.len().await;
        if in_flight == 0 {
            return;
        }

        info!("Waiting for {} in-flight connections", in_flight);
        let deadline = self.config.join_timeout;
        if tokio::time::timeout(deadline, self.connections.wait_empty())
            .await
            .is_err()
        {
            warn!(
                "{} connections still running after {}; detaching them",
                self.connections.len().await,
                humantime::format_duration(deadline)
            );
        }
    }
}

async fn handle_connection(id: u64, mut stream: TcpStream, peer: SocketAddr, ctx: ConnectionContext) {
    let mut state = ConnectionState::Accepted;

    match run_connection(id, &mut stream, peer, &ctx, &mut state).await {
        Ok(()) => state.advance(id, ConnectionState::Closed),
        Err(e) => {
            match state {
                ConnectionState::Handshaking => {
                    debug!("[conn {}] Handshake with {} failed: {}", id, peer, e)
                }
                _ if e.is_transport() => {
                    debug!("[conn {}] Transport error in {}: {}", id, state, e)
                }
                _ => warn!("[conn {}] Error in {}: {}", id, state, e),
            }
            state.advance(id, ConnectionState::Errored);
        }
    }

    let _ = stream.shutdown().await;
    debug!("[conn {}] Connection from {} {}", id, peer, state);
}

async fn run_connection(
    id: u64,
    stream: &mut TcpStream,
    peer: SocketAddr,
    ctx: &ConnectionContext,
    state: &mut ConnectionState,
) -> Result<(), QstpError> {
    state.advance(id, ConnectionState::Handshaking);
    let session = tokio::time::timeout(ctx.handshake_timeout, SecureSession::respond(stream, &ctx.kem))
        .await
        .map_err(|_| QstpError::Timeout("handshake"))??;

    if let Err(e) = exchange(id, stream, peer, &session, ctx, state).await {
        let reply = Response::new(StatusCode::ServerError).to_frame();
        if let Err(send_err) = session.send(stream, &reply).await {
            debug!("[conn {}] Could not deliver SERVER ERROR: {}", id, send_err);
        }
        return Err(e);
    }
    Ok(())
}

async fn exchange(
    id: u64,
    stream: &mut TcpStream,
    peer: SocketAddr,
    session: &SecureSession,
    ctx: &ConnectionContext,
    state: &mut ConnectionState,
) -> Result<(), QstpError> {
    state.advance(id, ConnectionState::AwaitingRequest);
    let payload = tokio::time::timeout(ctx.handshake_timeout, session.receive(stream))
        .await
        .map_err(|_| QstpError::Timeout("request"))??;

    state.advance(id, ConnectionState::Dispatching);
    let reply = match AssertUnwindSafe(ctx.handler.handle(payload, peer))
        .catch_unwind()
        .await
    {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            error!("[conn {}] Handler failed for {}: {:#}", id, peer, e);
            Response::new(StatusCode::ServerError).to_frame()
        }
        Err(_) => {
            error!("[conn {}] Handler panicked for {}", id, peer);
            Response::new(StatusCode::ServerError).to_frame()
        }
    };

    state.advance(id, ConnectionState::Responding);
    session.send(stream, &reply).await
}
