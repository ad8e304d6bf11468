//! Publish/subscribe endpoint.
//!
//! Bridges a broker client into the point topology. Messages published to
//! `{client}/down` are forwarded to the bound peer under `client`; messages
//! sent to a client are published to `{client}/up`. The broker client itself
//! is pluggable through [`PubSubClient`].

use gatepoint_core::{Binding, ClientFilter, GatewayPoint, GatewayResult, PointEvents, PointFuture};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Topic suffix for traffic towards a device.
pub const DOWN_SUFFIX: &str = "down";

/// Topic suffix for traffic from a device.
pub const UP_SUFFIX: &str = "up";

/// Wildcard subscription covering every client's down topic.
pub const ALL_DOWN: &str = "+/down";

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Minimal broker client contract.
pub trait PubSubClient: Send + Sync + 'static {
    fn start(&self) -> PointFuture<'_, GatewayResult<()>>;

    fn stop(&self) -> PointFuture<'_, ()>;

    fn is_connected(&self) -> bool;

    fn publish<'a>(&'a self, topic: &'a str, payload: &'a [u8]) -> PointFuture<'a, GatewayResult<()>>;

    fn subscribe<'a>(&'a self, pattern: &'a str) -> PointFuture<'a, GatewayResult<()>>;

    fn unsubscribe<'a>(&'a self, pattern: &'a str) -> PointFuture<'a, GatewayResult<()>>;

    /// Inbound messages for every active subscription.
    fn messages(&self) -> broadcast::Receiver<PubSubMessage>;

    /// Signals each time the client re-establishes its broker session.
    ///
    /// A broker may forget subscriptions across a reconnect. The point
    /// subscribes again on every signal. `None` means the client never
    /// reconnects on its own.
    fn reconnects(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

pub fn down_topic(client: &str) -> String {
    format!("{client}/{DOWN_SUFFIX}")
}

pub fn up_topic(client: &str) -> String {
    format!("{client}/{UP_SUFFIX}")
}

/// The client name of a `{client}/down` topic.
fn client_of(topic: &str) -> Option<&str> {
    let (client, suffix) = topic.split_once('/')?;
    (suffix == DOWN_SUFFIX && !client.is_empty()).then_some(client)
}

/// Wait for the next reconnect signal. Pends forever once the signal
/// source is gone.
async fn next_reconnect(reconnects: &mut Option<broadcast::Receiver<()>>) -> Option<()> {
    let Some(rx) = reconnects else {
        return std::future::pending().await;
    };
    match rx.recv().await {
        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(()),
        Err(broadcast::error::RecvError::Closed) => {
            *reconnects = None;
            None
        }
    }
}

pub struct PubSubPoint<C: PubSubClient> {
    me: Weak<Self>,
    name: String,
    client: C,
    filter: ClientFilter,
    binding: Binding,
    events: PointEvents,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<C: PubSubClient> PubSubPoint<C> {
    pub fn new(name: impl Into<String>, client: C) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: format!("pubsub({name})"),
            client,
            filter: ClientFilter::default(),
            binding: Binding::new(),
            events: PointEvents::new(),
            pump: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Drop the subscriptions of one client.
    pub async fn unsubscribe_client(&self, name: &str) -> GatewayResult<()> {
        self.client.unsubscribe(name).await?;
        self.client.unsubscribe(&down_topic(name)).await
    }

    async fn subscribe_all(&self) -> GatewayResult<()> {
        if self.filter.is_enabled() {
            self.client.unsubscribe(ALL_DOWN).await?;
            for name in self.filter.names() {
                self.client.subscribe(&down_topic(&name)).await?;
            }
        } else {
            self.client.subscribe(ALL_DOWN).await?;
        }
        Ok(())
    }

    fn lock_pump(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_pump(&self) -> JoinHandle<()> {
        let point = self.me.clone();
        let mut rx = self.client.messages();
        let mut reconnects = self.client.reconnects();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        let message = match received {
                            Ok(message) => message,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "pub/sub receiver lagged, messages lost");
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        let Some(point) = point.upgrade() else {
                            break;
                        };
                        point.on_message(message).await;
                    }
                    Some(()) = next_reconnect(&mut reconnects) => {
                        let Some(point) = point.upgrade() else {
                            break;
                        };
                        match point.subscribe_all().await {
                            Ok(()) => info!(point = %point.name, "broker reconnected, subscriptions restored"),
                            Err(e) => warn!(point = %point.name, error = %e, "resubscribe after reconnect failed"),
                        }
                    }
                }
            }
        })
    }

    async fn on_message(&self, message: PubSubMessage) {
        let Some(client) = client_of(&message.topic) else {
            debug!(topic = %message.topic, "ignoring message on unexpected topic");
            return;
        };
        if !self.filter.permits(client) {
            debug!(topic = %message.topic, "client not in allow-list, ignored");
            return;
        }
        debug!(client = %client, data = %hex::encode(&message.payload), ">");
        self.binding.forward(client, &message.payload).await;
    }
}

impl<C: PubSubClient> GatewayPoint for PubSubPoint<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PointFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.stop().await;
            // Attach before subscribing so nothing published in between is missed.
            let pump = self.spawn_pump();
            *self.lock_pump() = Some(pump);

            self.client.start().await?;
            self.subscribe_all().await?;
            info!(point = %self.name, "pub/sub point started");
            Ok(())
        })
    }

    fn stop(&self) -> PointFuture<'_, ()> {
        Box::pin(async move {
            let pump = self.lock_pump().take();
            if let Some(pump) = pump {
                pump.abort();
                self.client.stop().await;
                info!(point = %self.name, "pub/sub point stopped");
            }
        })
    }

    fn is_started(&self) -> bool {
        self.client.is_connected()
    }

    fn send_message_to_client<'a>(
        &'a self,
        client: &'a str,
        data: &'a [u8],
    ) -> PointFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            if !self.client.is_connected() {
                debug!(client = %client, "broker not connected, message dropped");
                return Ok(());
            }
            debug!(client = %client, data = %hex::encode(data), "<");
            self.client.publish(&up_topic(client), data).await
        })
    }

    /// Broker clients are not tracked individually.
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

impl<C: PubSubClient> Drop for PubSubPoint<C> {
    fn drop(&mut self) {
        if let Some(pump) = self.lock_pump().take() {
            pump.abort();
        }
    }
}
