//! The gateway point contract.
//!
//! Every transport-facing endpoint implements [`GatewayPoint`]. Points are
//! shared as `Arc<dyn GatewayPoint>`, so the async methods return boxed
//! futures instead of using `async fn` in the trait.

use crate::binding::Binding;
use crate::error::GatewayResult;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Boxed future returned by the object-safe async methods of a point.
pub type PointFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Capacity of each point's notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A transport endpoint that can be started, stopped and chained to a peer.
pub trait GatewayPoint: Send + Sync {
    /// Short label used in logs, e.g. `framed(0.0.0.0:5000)`.
    fn name(&self) -> &str;

    /// Stop any previous run, then begin accepting connections.
    ///
    /// Only genuine configuration errors are returned. A listener that
    /// cannot be bound is reported according to the point's own policy.
    fn start(&self) -> PointFuture<'_, GatewayResult<()>>;

    /// Disconnect every client, release listeners, clear routing state.
    /// Idempotent.
    fn stop(&self) -> PointFuture<'_, ()>;

    fn is_started(&self) -> bool;

    /// Deliver `data` to the named client using this point's own protocol.
    ///
    /// An unknown client, or a point that is not started, is a silent
    /// no-op returning `Ok(())`. Errors are reserved for failures while
    /// delivering to a known client.
    fn send_message_to_client<'a>(
        &'a self,
        client: &'a str,
        data: &'a [u8],
    ) -> PointFuture<'a, GatewayResult<()>>;

    /// Identities of the clients currently connected and identified.
    fn connected_clients(&self) -> Vec<String>;

    /// Allow-list applied to client identities.
    fn client_filter(&self) -> &ClientFilter;

    /// The routing edge to this point's bound peer.
    fn binding(&self) -> &Binding;

    /// Connect/disconnect notifications.
    fn events(&self) -> &PointEvents;

    /// Attach an observer. Dropping the receiver detaches it.
    fn subscribe(&self) -> broadcast::Receiver<PointEvent> {
        self.events().subscribe()
    }
}

/// What happened to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connected,
    Disconnected,
}

/// A connect or disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointEvent {
    pub kind: EventKind,
    pub client: String,
    pub at: SystemTime,
}

/// Fan-out of [`PointEvent`]s to any number of observers.
///
/// Backed by a broadcast channel: observers can attach and detach at any
/// time, and a slow observer only loses its own backlog.
#[derive(Debug)]
pub struct PointEvents {
    tx: broadcast::Sender<PointEvent>,
}

impl PointEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PointEvent> {
        self.tx.subscribe()
    }

    pub fn connected(&self, client: &str) {
        self.emit(EventKind::Connected, client);
    }

    pub fn disconnected(&self, client: &str) {
        self.emit(EventKind::Disconnected, client);
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn emit(&self, kind: EventKind, client: &str) {
        // No observers is not an error.
        let _ = self.tx.send(PointEvent {
            kind,
            client: client.to_string(),
            at: SystemTime::now(),
        });
    }
}

impl Default for PointEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Allow-list of client identities.
///
/// When disabled every client is permitted; when enabled only the listed
/// names are.
#[derive(Debug, Default)]
pub struct ClientFilter {
    inner: RwLock<FilterState>,
}

#[derive(Debug, Default)]
struct FilterState {
    enabled: bool,
    names: HashSet<String>,
}

impl ClientFilter {
    pub fn new(enabled: bool, names: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: RwLock::new(FilterState {
                enabled,
                names: names.into_iter().collect(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.read(|s| s.enabled)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.write(|s| s.enabled = enabled);
    }

    /// Listed names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read(|s| s.names.iter().cloned().collect());
        names.sort();
        names
    }

    pub fn set_names(&self, names: impl IntoIterator<Item = String>) {
        let names: HashSet<String> = names.into_iter().collect();
        self.write(|s| s.names = names);
    }

    /// Whether `client` may connect under the current settings.
    pub fn permits(&self, client: &str) -> bool {
        self.read(|s| !s.enabled || s.names.contains(client))
    }

    fn read<T>(&self, f: impl FnOnce(&FilterState) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn write(&self, f: impl FnOnce(&mut FilterState)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
