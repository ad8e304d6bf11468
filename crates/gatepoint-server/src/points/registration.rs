//! Name-registration endpoint.
//!
//! The first message on a connection is the client's name as raw text.
//! Everything after that is opaque and forwarded to the bound peer under
//! that name.

use crate::transport::tcp::{ConnId, Connection, ConnectionHandler, HubOptions, TcpHub};
use gatepoint_core::{
    Binding, ClientFilter, GatewayError, GatewayPoint, GatewayResult, PointEvents, PointFuture,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

#[derive(Default)]
struct ClientTable {
    /// Live connections and the name each registered, if any.
    by_conn: HashMap<ConnId, (Connection, Option<String>)>,
    /// Registered names; each resolves to at most one live connection.
    by_name: HashMap<String, ConnId>,
}

enum Inbound {
    Unknown,
    Register,
    Forward(String),
}

pub struct NameRegistrationPoint {
    me: Weak<Self>,
    name: String,
    bind: String,
    filter: ClientFilter,
    binding: Binding,
    events: PointEvents,
    listening: AtomicBool,
    clients: Mutex<ClientTable>,
    hub: tokio::sync::Mutex<Option<TcpHub>>,
}

impl NameRegistrationPoint {
    /// The allow-list starts disabled.
    pub fn new(bind: impl Into<String>) -> Arc<Self> {
        let bind = bind.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: format!("registration({bind})"),
            bind,
            filter: ClientFilter::default(),
            binding: Binding::new(),
            events: PointEvents::new(),
            listening: AtomicBool::new(false),
            clients: Mutex::new(ClientTable::default()),
            hub: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.hub.lock().await.as_ref().map(TcpHub::local_addr)
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, ClientTable> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_connected(&self, conn: &Connection) {
        let previous = self
            .lock_clients()
            .by_conn
            .insert(conn.id, (conn.clone(), None));
        if previous.is_some() {
            warn!(conn_id = conn.id, peer = %conn.peer, "connection already known, replaced");
        }
        info!(conn_id = conn.id, peer = %conn.peer, "client connected");
    }

    async fn on_data(&self, conn: &Connection, data: &[u8]) {
        let inbound = match self.lock_clients().by_conn.get(&conn.id) {
            None => Inbound::Unknown,
            Some((_, None)) => Inbound::Register,
            Some((_, Some(name))) => Inbound::Forward(name.clone()),
        };

        match inbound {
            Inbound::Unknown => {
                warn!(conn_id = conn.id, peer = %conn.peer, "data from unregistered connection, disconnecting");
                conn.disconnect();
            }
            Inbound::Register => self.register(conn, data),
            Inbound::Forward(name) => {
                debug!(client = %name, data = %hex::encode(data), ">");
                self.binding.forward(&name, data).await;
            }
        }
    }

    fn register(&self, conn: &Connection, data: &[u8]) {
        let name = String::from_utf8_lossy(data).into_owned();
        if !self.filter.permits(&name) {
            warn!(conn_id = conn.id, client = %name, "name not in allow-list, disconnecting");
            conn.disconnect();
            return;
        }

        {
            let mut table = self.lock_clients();
            let Some(entry) = table.by_conn.get_mut(&conn.id) else {
                return;
            };
            entry.1 = Some(name.clone());

            if let Some(previous) = table.by_name.insert(name.clone(), conn.id) {
                if previous != conn.id {
                    if let Some((_, old_name)) = table.by_conn.get_mut(&previous) {
                        *old_name = None;
                    }
                    warn!(client = %name, old_conn = previous, new_conn = conn.id, "name re-registered, moving to new connection");
                }
            }
        }

        info!(conn_id = conn.id, peer = %conn.peer, client = %name, "client registered");
        self.events.connected(&name);
    }

    fn on_disconnected(&self, conn: &Connection) {
        let name = {
            let mut table = self.lock_clients();
            let name = table.by_conn.remove(&conn.id).and_then(|(_, name)| name);
            if let Some(name) = &name {
                if table.by_name.get(name) == Some(&conn.id) {
                    table.by_name.remove(name);
                }
            }
            name
        };

        match name {
            Some(name) => {
                info!(conn_id = conn.id, client = %name, "client disconnected");
                self.events.disconnected(&name);
            }
            None => info!(conn_id = conn.id, peer = %conn.peer, "unregistered client disconnected"),
        }
    }
}

impl GatewayPoint for NameRegistrationPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PointFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.stop().await;
            let addr: SocketAddr = self
                .bind
                .parse()
                .map_err(|_| GatewayError::InvalidAddress(self.bind.clone()))?;

            let handler = Arc::new(RegistrationHandler {
                point: self.me.clone(),
            });
            let mut slot = self.hub.lock().await;
            let hub = TcpHub::bind(addr, HubOptions::default(), handler)
                .await
                .inspect_err(|e| warn!(point = %self.name, error = %e, "listener failed to start"))?;

            info!(point = %self.name, addr = %hub.local_addr(), "registration point listening");
            *slot = Some(hub);
            self.listening.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> PointFuture<'_, ()> {
        Box::pin(async move {
            let mut slot = self.hub.lock().await;
            self.listening.store(false, Ordering::SeqCst);
            if let Some(hub) = slot.take() {
                hub.shutdown().await;
                info!(point = %self.name, "registration point stopped");
            }

            let mut table = self.lock_clients();
            table.by_conn.clear();
            table.by_name.clear();
        })
    }

    fn is_started(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn send_message_to_client<'a>(
        &'a self,
        client: &'a str,
        data: &'a [u8],
    ) -> PointFuture<'a, GatewayResult<()>> {
        Box::pin(async move {
            let conn = {
                let table = self.lock_clients();
                table
                    .by_name
                    .get(client)
                    .and_then(|id| table.by_conn.get(id))
                    .map(|(conn, _)| conn.clone())
            };

            match conn {
                Some(conn) => {
                    debug!(client = %client, data = %hex::encode(data), "<");
                    if !conn.send(data.to_vec()) {
                        debug!(client = %client, "connection closed before send");
                    }
                }
                None => debug!(client = %client, "no live connection for client"),
            }
            Ok(())
        })
    }

    fn connected_clients(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_clients().by_name.keys().cloned().collect();
        names.sort();
        names
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

struct RegistrationHandler {
    point: Weak<NameRegistrationPoint>,
}

impl ConnectionHandler for RegistrationHandler {
    fn on_connected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_connected(conn);
            }
        })
    }

    fn on_data<'a>(&'a self, conn: &'a Connection, data: &'a [u8]) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_data(conn, data).await;
            }
        })
    }

    fn on_disconnected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_disconnected(conn);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatepoint_core::testing::RecordingPoint;
    use gatepoint_core::{EventKind, PointEvent};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(5);

    async fn started() -> (Arc<NameRegistrationPoint>, SocketAddr) {
        let point = NameRegistrationPoint::new("127.0.0.1:0");
        point.start().await.unwrap();
        let addr = point.local_addr().await.unwrap();
        (point, addr)
    }

    async fn next_event(rx: &mut broadcast::Receiver<PointEvent>) -> PointEvent {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn register(addr: SocketAddr, name: &str, events: &mut broadcast::Receiver<PointEvent>) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(name.as_bytes()).await.unwrap();
        let event = next_event(events).await;
        assert_eq!(event.kind, EventKind::Connected);
        assert_eq!(event.client, name);
        stream
    }

    #[tokio::test]
    async fn registered_client_payload_is_forwarded() {
        let (point, addr) = started().await;
        let sink = Arc::new(RecordingPoint::new("sink"));
        point.binding().bind(sink.clone());
        let mut events = point.subscribe();

        let mut sensor = register(addr, "sensor-7", &mut events).await;
        sensor.write_all(&[0x01, 0x02]).await.unwrap();

        let received = sink.wait_for(1, WAIT).await;
        assert_eq!(received, vec![("sensor-7".to_string(), vec![0x01, 0x02])]);
        assert_eq!(point.connected_clients(), vec!["sensor-7"]);
    }

    #[tokio::test]
    async fn send_reaches_named_client_verbatim() {
        let (point, addr) = started().await;
        let mut events = point.subscribe();
        let mut sensor = register(addr, "sensor-7", &mut events).await;

        point.send_message_to_client("sensor-7", b"reply").await.unwrap();
        point.send_message_to_client("missing", b"x").await.unwrap();

        let mut buf = [0u8; 5];
        tokio::time::timeout(WAIT, sensor.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn allow_list_rejects_unknown_name() {
        let (point, addr) = started().await;
        point.client_filter().set_names(vec!["sensor-7".to_string()]);
        point.client_filter().set_enabled(true);

        let mut intruder = TcpStream::connect(addr).await.unwrap();
        intruder.write_all(b"intruder").await.unwrap();

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(WAIT, intruder.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(point.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn re_registration_moves_name_to_newest_connection() {
        let (point, addr) = started().await;
        let mut events = point.subscribe();

        let first = register(addr, "dup", &mut events).await;
        let mut second = register(addr, "dup", &mut events).await;

        point.send_message_to_client("dup", b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        tokio::time::timeout(WAIT, second.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hi");

        // The old connection is unidentified again and its close raises nothing.
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(point.connected_clients(), vec!["dup"]);
        assert!(events.try_recv().is_err());

        drop(second);
        let gone = next_event(&mut events).await;
        assert_eq!(gone.kind, EventKind::Disconnected);
        assert_eq!(gone.client, "dup");
    }

    #[tokio::test]
    async fn disconnect_clears_name() {
        let (point, addr) = started().await;
        let mut events = point.subscribe();
        let sensor = register(addr, "sensor-7", &mut events).await;

        drop(sensor);
        assert_eq!(next_event(&mut events).await.kind, EventKind::Disconnected);
        assert!(point.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn stop_twice_is_same_as_once() {
        let (point, addr) = started().await;
        let mut events = point.subscribe();
        let _sensor = register(addr, "sensor-7", &mut events).await;

        point.stop().await;
        point.stop().await;

        assert!(!point.is_started());
        assert!(point.connected_clients().is_empty());
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let point = NameRegistrationPoint::new(blocker.local_addr().unwrap().to_string());

        assert!(matches!(point.start().await, Err(GatewayError::Bind { .. })));
        assert!(!point.is_started());
    }
}
