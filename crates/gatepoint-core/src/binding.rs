//! Routing edges between gateway points.
//!
//! A point holds at most one bound peer. The edge is non-owning (a `Weak`
//! reference): binding never keeps the peer alive and never drives its
//! lifecycle. Chains and small fan-in graphs are built by binding several
//! points to the same peer.
//!
//! Forwarding carries a hop budget in a task-local counter, so a cycle of
//! points that re-forward what they receive terminates instead of recursing
//! forever.

use crate::point::GatewayPoint;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, warn};

/// Maximum nested forwards within one inbound message.
pub const MAX_FORWARD_HOPS: usize = 8;

tokio::task_local! {
    static HOPS: usize;
}

/// What happened to a forwarded payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    /// No peer is bound, or the bound peer has been dropped.
    Unbound,
    /// The peer's send returned an error, which was logged.
    Failed,
    /// The hop budget was exhausted; the payload was dropped.
    HopLimit,
}

/// The bound-peer slot of a gateway point.
#[derive(Default)]
pub struct Binding {
    peer: RwLock<Option<Weak<dyn GatewayPoint>>>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer`, replacing any previous peer.
    pub fn bind(&self, peer: Arc<dyn GatewayPoint>) {
        let weak = Arc::downgrade(&peer);
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = Some(weak);
    }

    pub fn unbind(&self) {
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The bound peer, if any and still alive.
    pub fn peer(&self) -> Option<Arc<dyn GatewayPoint>> {
        self.peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_bound(&self) -> bool {
        self.peer().is_some()
    }

    /// Forward `data` to the bound peer under `client`.
    ///
    /// Never fails: a missing peer, a peer error and an exhausted hop budget
    /// are reported through the returned [`Forwarded`] and the log.
    pub async fn forward(&self, client: &str, data: &[u8]) -> Forwarded {
        let Some(peer) = self.peer() else {
            return Forwarded::Unbound;
        };

        let hops = HOPS.try_with(|h| *h).unwrap_or(0);
        if hops >= MAX_FORWARD_HOPS {
            warn!(
                client = %client,
                peer = %peer.name(),
                hops,
                "forward hop limit reached, dropping payload (binding cycle?)"
            );
            return Forwarded::HopLimit;
        }

        let result = HOPS
            .scope(hops + 1, async {
                peer.send_message_to_client(client, data).await
            })
            .await;

        match result {
            Ok(()) => {
                debug!(client = %client, peer = %peer.name(), len = data.len(), "forwarded to bound point");
                Forwarded::Delivered
            }
            Err(e) => {
                warn!(client = %client, peer = %peer.name(), error = %e, "bound point send failed");
                Forwarded::Failed
            }
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peer = self.peer().map(|p| p.name().to_string());
        f.debug_struct("Binding").field("peer", &peer).finish()
    }
}

/// Bind two points to each other so traffic flows both ways.
pub fn bind_pair(a: &Arc<dyn GatewayPoint>, b: &Arc<dyn GatewayPoint>) {
    a.binding().bind(b.clone());
    b.binding().bind(a.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPoint;

    #[tokio::test]
    async fn forward_without_peer_is_unbound() {
        let binding = Binding::new();
        assert_eq!(binding.forward("dev", b"x").await, Forwarded::Unbound);
    }

    #[tokio::test]
    async fn forward_reaches_peer() {
        let sink = Arc::new(RecordingPoint::new("sink"));
        let binding = Binding::new();
        binding.bind(sink.clone());

        assert_eq!(binding.forward("dev", b"abc").await, Forwarded::Delivered);
        assert_eq!(sink.received(), vec![("dev".to_string(), b"abc".to_vec())]);
    }

    #[tokio::test]
    async fn binding_does_not_keep_peer_alive() {
        let binding = Binding::new();
        {
            let sink = Arc::new(RecordingPoint::new("sink"));
            binding.bind(sink.clone());
            assert!(binding.is_bound());
        }
        assert!(!binding.is_bound());
        assert_eq!(binding.forward("dev", b"x").await, Forwarded::Unbound);
    }

    #[tokio::test]
    async fn failing_peer_is_reported() {
        let sink = Arc::new(RecordingPoint::failing("sink"));
        let binding = Binding::new();
        binding.bind(sink.clone());

        assert_eq!(binding.forward("dev", b"x").await, Forwarded::Failed);
        assert_eq!(binding.forward("dev", b"y").await, Forwarded::Failed);
        assert_eq!(sink.received().len(), 2);
        assert!(binding.is_bound());
    }

    #[tokio::test]
    async fn cycle_stops_at_hop_limit() {
        let a = Arc::new(RecordingPoint::pass_through("a"));
        let b = Arc::new(RecordingPoint::pass_through("b"));
        let (da, db): (Arc<dyn GatewayPoint>, Arc<dyn GatewayPoint>) = (a.clone(), b.clone());
        bind_pair(&da, &db);

        // Terminates: the innermost forward is refused once the budget runs out.
        assert_eq!(a.binding().forward("dev", b"loop").await, Forwarded::Delivered);
        assert_eq!(a.received().len() + b.received().len(), MAX_FORWARD_HOPS);
        assert_eq!(b.received().len(), MAX_FORWARD_HOPS / 2);
    }

    #[tokio::test]
    async fn rebinding_replaces_peer() {
        let first = Arc::new(RecordingPoint::new("first"));
        let second = Arc::new(RecordingPoint::new("second"));
        let binding = Binding::new();

        binding.bind(first.clone());
        binding.bind(second.clone());
        binding.forward("dev", b"1").await;

        assert!(first.received().is_empty());
        assert_eq!(second.received().len(), 1);

        binding.unbind();
        assert!(!binding.is_bound());
    }
}
