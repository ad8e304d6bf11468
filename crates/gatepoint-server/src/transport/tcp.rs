//! Event-driven TCP server shared by the TCP gateway points.
//!
//! A [`TcpHub`] owns one listening socket. Each accepted connection gets its
//! own task that reports `connected`, every read, and `disconnected` to a
//! [`ConnectionHandler`] in arrival order. Writes and forced disconnects go
//! through a cloneable [`HubHandle`] and are queued to the connection task,
//! so they never block the caller.

use gatepoint_core::{GatewayError, GatewayResult, PointFuture};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default read buffer per connection. One read is delivered as one message.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Identifier of an accepted connection, unique within a hub.
pub type ConnId = u64;

/// Receives connection events from a hub.
///
/// Calls for one connection are sequential; calls for different
/// connections run concurrently.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()>;

    fn on_data<'a>(&'a self, conn: &'a Connection, data: &'a [u8]) -> PointFuture<'a, ()>;

    /// Not called for connections closed by [`TcpHub::shutdown`].
    fn on_disconnected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()>;
}

/// Listener settings.
#[derive(Debug, Clone, Default)]
pub struct HubOptions {
    /// Connections beyond this count are closed right after accept.
    pub max_connections: Option<usize>,
    /// Bytes read per `on_data` call; [`READ_BUFFER_SIZE`] when unset.
    pub read_buffer: Option<usize>,
}

impl HubOptions {
    fn read_buffer_size(&self) -> usize {
        self.read_buffer.unwrap_or(READ_BUFFER_SIZE).max(1)
    }
}

/// Why a connection task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Close {
    /// Forced by [`HubHandle::disconnect`].
    Kicked,
    /// The hub is shutting down.
    Shutdown,
    /// EOF or I/O error.
    Remote,
}

/// A live connection as seen by a handler.
#[derive(Clone)]
pub struct Connection {
    pub id: ConnId,
    pub peer: SocketAddr,
    hub: HubHandle,
}

impl Connection {
    /// Queue `data` for this connection. Returns `false` if it is gone.
    pub fn send(&self, data: Vec<u8>) -> bool {
        self.hub.send(self.id, data)
    }

    /// Ask this connection to close. Safe to call more than once.
    pub fn disconnect(&self) {
        self.hub.disconnect(self.id);
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

struct ConnEntry {
    peer: SocketAddr,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: mpsc::Sender<Close>,
    task: Option<JoinHandle<()>>,
}

struct HubShared {
    local_addr: SocketAddr,
    next_id: AtomicU64,
    conns: Mutex<HashMap<ConnId, ConnEntry>>,
}

/// Cheap, cloneable access to a hub's live connections.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
}

impl HubHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Queue `data` for connection `id`. Returns `false` if it is gone.
    pub fn send(&self, id: ConnId, data: Vec<u8>) -> bool {
        let conns = self.lock();
        match conns.get(&id) {
            Some(entry) => entry.write_tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Queue `data` for every live connection. Returns how many took it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let conns = self.lock();
        conns
            .values()
            .filter(|entry| entry.write_tx.send(data.to_vec()).is_ok())
            .count()
    }

    /// Ask connection `id` to close. Never blocks.
    pub fn disconnect(&self, id: ConnId) {
        if let Some(entry) = self.lock().get(&id) {
            let _ = entry.close_tx.try_send(Close::Kicked);
        }
    }

    pub fn is_connected(&self, id: ConnId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Live connections and their remote addresses.
    pub fn clients(&self) -> Vec<(ConnId, SocketAddr)> {
        let mut clients: Vec<_> = self.lock().iter().map(|(id, e)| (*id, e.peer)).collect();
        clients.sort_by_key(|(id, _)| *id);
        clients
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, ConnEntry>> {
        self.shared.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, id: ConnId) {
        self.lock().remove(&id);
    }
}

/// An owned listening socket and its accept loop.
///
/// Dropping the hub stops accepting and closes every connection without
/// reporting disconnects, like [`TcpHub::shutdown`] but without waiting.
pub struct TcpHub {
    handle: HubHandle,
    cancel_tx: mpsc::Sender<()>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpHub {
    /// Bind `addr` and start accepting connections for `handler`.
    pub async fn bind(
        addr: SocketAddr,
        options: HubOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> GatewayResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let handle = HubHandle {
            shared: Arc::new(HubShared {
                local_addr,
                next_id: AtomicU64::new(1),
                conns: Mutex::new(HashMap::new()),
            }),
        };

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let loop_handle = handle.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, cancel_rx, loop_handle, options, handler).await;
            debug!(addr = %local_addr, "accept loop ended");
        });

        info!(addr = %local_addr, "TCP listener started");

        Ok(Self {
            handle,
            cancel_tx,
            accept_task: Some(accept_task),
        })
    }

    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Stop accepting, close every connection and wait for their tasks.
    ///
    /// Handlers are not told about connections closed this way.
    pub async fn shutdown(mut self) {
        let _ = self.cancel_tx.send(()).await;
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let entries: Vec<ConnEntry> = self.handle.lock().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            let _ = entry.close_tx.try_send(Close::Shutdown);
        }
        for mut entry in entries {
            if let Some(task) = entry.task.take() {
                let _ = task.await;
            }
        }

        info!(addr = %self.handle.local_addr(), "TCP listener stopped");
    }
}

impl Drop for TcpHub {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            for entry in self.handle.lock().values() {
                let _ = entry.close_tx.try_send(Close::Shutdown);
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    handle: HubHandle,
    options: HubOptions,
    handler: Arc<dyn ConnectionHandler>,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(addr = %handle.local_addr(), "accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        if let Some(max) = options.max_connections {
                            if handle.connection_count() >= max {
                                warn!(addr = %handle.local_addr(), peer = %peer, max, "connection limit reached, closing");
                                drop(stream);
                                continue;
                            }
                        }
                        spawn_connection(stream, peer, &handle, options.read_buffer_size(), handler.clone());
                    }
                    Err(e) => {
                        warn!(addr = %handle.local_addr(), error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: &HubHandle,
    read_buffer: usize,
    handler: Arc<dyn ConnectionHandler>,
) {
    let id = handle.shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (close_tx, close_rx) = mpsc::channel::<Close>(1);

    let conn = Connection {
        id,
        peer,
        hub: handle.clone(),
    };

    // Hold the lock across spawn so the entry exists before the task can
    // observe or remove it.
    let mut conns = handle.lock();
    let task = tokio::spawn(connection_loop(stream, conn, handler, read_buffer, write_rx, close_rx));
    conns.insert(
        id,
        ConnEntry {
            peer,
            write_tx,
            close_tx,
            task: Some(task),
        },
    );
}

async fn connection_loop(
    stream: TcpStream,
    conn: Connection,
    handler: Arc<dyn ConnectionHandler>,
    read_buffer: usize,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut close_rx: mpsc::Receiver<Close>,
) {
    debug!(conn_id = conn.id, peer = %conn.peer, "connection accepted");
    handler.on_connected(&conn).await;

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; read_buffer];

    let reason = loop {
        tokio::select! {
            biased;
            close = close_rx.recv() => {
                break close.unwrap_or(Close::Shutdown);
            }
            Some(data) = write_rx.recv() => {
                if let Err(e) = write_half.write_all(&data).await {
                    debug!(conn_id = conn.id, peer = %conn.peer, error = %e, "write failed");
                    break Close::Remote;
                }
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break Close::Remote,
                    Ok(n) => handler.on_data(&conn, &buf[..n]).await,
                    Err(e) => {
                        debug!(conn_id = conn.id, peer = %conn.peer, error = %e, "read failed");
                        break Close::Remote;
                    }
                }
            }
        }
    };

    // Flush replies queued before a forced close.
    if reason == Close::Kicked {
        while let Ok(data) = write_rx.try_recv() {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
    }
    let _ = write_half.shutdown().await;

    conn.hub.remove(conn.id);
    debug!(conn_id = conn.id, peer = %conn.peer, ?reason, "connection closed");

    if reason != Close::Shutdown {
        handler.on_disconnected(&conn).await;
    }
}
