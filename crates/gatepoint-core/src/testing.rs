//! Test doubles for gateway points.

use crate::binding::Binding;
use crate::error::{GatewayError, GatewayResult};
use crate::point::{ClientFilter, GatewayPoint, PointEvents, PointFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A point that records everything sent to it.
///
/// In pass-through mode it also forwards each message to its own bound
/// peer, which is how binding cycles are exercised. In failing mode every
/// send is recorded and then reported as an error.
pub struct RecordingPoint {
    name: String,
    pass_through: bool,
    failing: bool,
    started: AtomicBool,
    received: Mutex<Vec<(String, Vec<u8>)>>,
    arrived: Notify,
    filter: ClientFilter,
    binding: Binding,
    events: PointEvents,
}

impl RecordingPoint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pass_through: false,
            failing: false,
            started: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            arrived: Notify::new(),
            filter: ClientFilter::default(),
            binding: Binding::new(),
            events: PointEvents::new(),
        }
    }

    pub fn pass_through(name: &str) -> Self {
        Self {
            pass_through: true,
            ..Self::new(name)
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            failing: true,
            ..Self::new(name)
        }
    }

    /// Everything received so far, in arrival order.
    pub fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.received.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait until at least `count` messages have arrived, or `timeout`
    /// elapses. Returns what was received either way.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<(String, Vec<u8>)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.arrived.notified();
            let current = self.received();
            if current.len() >= count {
                return current;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received();
            }
        }
    }
}

impl GatewayPoint for RecordingPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PointFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> PointFuture<'_, ()> {
        Box::pin(async move {
            self.started.store(false, Ordering::SeqCst);
        })
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn send_message_to_client<'a>(
        &'a self,
        client: &'a str,
        data: &'a [u8],
    ) -> PointFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            self.received
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((client.to_string(), data.to_vec()));
            self.arrived.notify_waiters();
            if self.pass_through {
                self.binding.forward(client, data).await;
            }
            if self.failing {
                return Err(GatewayError::Io(std::io::Error::other(format!(
                    "{} refused message for {client}",
                    self.name
                ))));
            }
            Ok(())
        })
    }

    fn connected_clients(&self) -> Vec<String> {
        Vec::new()
    }

    fn client_filter(&self) -> &ClientFilter {
        &self.filter
    }

    fn binding(&self) -> &Binding {
        &self.binding
    }

    fn events(&self) -> &PointEvents {
        &self.events
    }
}
