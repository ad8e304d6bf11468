//! Port-relay endpoint.
//!
//! Each registered port is dedicated to one client name: bytes arriving on
//! port P are forwarded to the bound peer under P's name, and messages for
//! that name are written to every connection on P. There is no framing.

use crate::transport::tcp::{Connection, ConnectionHandler, HubHandle, HubOptions, TcpHub};
use gatepoint_core::{Binding, ClientFilter, GatewayPoint, GatewayResult, PointEvents, PointFuture};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Concurrent connections accepted per port.
pub const MAX_CONNECTIONS_PER_PORT: usize = 2;

pub struct PortRelayPoint {
    me: Weak<Self>,
    name: String,
    host: IpAddr,
    filter: ClientFilter,
    binding: Binding,
    events: PointEvents,
    started: AtomicBool,
    /// Port → client name. Independent of which listeners are running.
    routes: RwLock<BTreeMap<u16, String>>,
    servers: Mutex<HashMap<u16, TcpHub>>,
}

impl PortRelayPoint {
    /// Listen on every interface.
    pub fn new() -> Arc<Self> {
        Self::with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_host(host: IpAddr) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: format!("relay({host})"),
            host,
            filter: ClientFilter::default(),
            binding: Binding::new(),
            events: PointEvents::new(),
            started: AtomicBool::new(false),
            routes: RwLock::new(BTreeMap::new()),
            servers: Mutex::new(HashMap::new()),
        })
    }

    // -- port table --

    /// Register `port` for `client`, replacing any previous name.
    pub fn add_port(&self, port: u16, client: impl Into<String>) {
        let client = client.into();
        debug!(port, client = %client, "port registered");
        self.write_routes().insert(port, client);
    }

    pub fn add_ports(&self, ports: impl IntoIterator<Item = (u16, String)>) {
        for (port, client) in ports {
            self.add_port(port, client);
        }
    }

    /// Unregister `port`, stopping its listener if running.
    pub async fn remove_port(&self, port: u16) {
        self.stop_server(port).await;
        self.write_routes().remove(&port);
    }

    pub async fn remove_ports(&self, ports: impl IntoIterator<Item = u16>) {
        for port in ports {
            self.remove_port(port).await;
        }
    }

    /// Unregister every port, stopping all listeners.
    pub async fn clear_ports(&self) {
        self.stop_servers().await;
        self.write_routes().clear();
    }

    pub fn registered_ports(&self) -> BTreeMap<u16, String> {
        self.read_routes().clone()
    }

    // -- listeners --

    /// Start a listener for every registered port. With `restart`, running
    /// listeners are stopped first; otherwise they are left alone.
    pub async fn start_servers(&self, restart: bool) {
        if restart {
            self.stop_servers().await;
        }
        let ports: Vec<u16> = self.read_routes().keys().copied().collect();
        for port in ports {
            self.start_server(port).await;
        }
    }

    /// Start the listener for one registered port. Failures are logged.
    pub async fn start_server(&self, port: u16) -> bool {
        let Some(client) = self.read_routes().get(&port).cloned() else {
            warn!(port, "no client registered for port");
            return false;
        };
        if self.lock_servers().contains_key(&port) {
            debug!(port, "listener already running");
            return true;
        }

        let handler = Arc::new(RelayHandler {
            point: self.me.clone(),
            port,
        });
        let options = HubOptions {
            max_connections: Some(MAX_CONNECTIONS_PER_PORT),
            ..Default::default()
        };
        let addr = SocketAddr::new(self.host, port);

        match TcpHub::bind(addr, options, handler).await {
            Ok(hub) => {
                info!(port, client = %client, addr = %hub.local_addr(), "relay listener started");
                let mut servers = self.lock_servers();
                if servers.contains_key(&port) {
                    // Lost a race with a concurrent start; the new hub drops.
                    return true;
                }
                servers.insert(port, hub);
                true
            }
            Err(e) => {
                warn!(port, client = %client, error = %e, "relay listener failed to start");
                false
            }
        }
    }

    /// Stop the listener for one port, closing its connections.
    pub async fn stop_server(&self, port: u16) {
        let hub = self.lock_servers().remove(&port);
        if let Some(hub) = hub {
            hub.shutdown().await;
            info!(port, "relay listener stopped");
        }
    }

    pub async fn stop_servers(&self) {
        let hubs: Vec<(u16, TcpHub)> = self.lock_servers().drain().collect();
        for (port, hub) in hubs {
            hub.shutdown().await;
            info!(port, "relay listener stopped");
        }
    }

    /// Ports with a running listener, ascending.
    pub fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.lock_servers().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Address bound for `port`, if its listener is running.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.lock_servers().get(&port).map(TcpHub::local_addr)
    }

    fn hub_for(&self, port: u16) -> Option<HubHandle> {
        self.lock_servers().get(&port).map(TcpHub::handle)
    }

    fn port_for(&self, client: &str) -> Option<u16> {
        self.read_routes()
            .iter()
            .find(|(_, name)| name.as_str() == client)
            .map(|(port, _)| *port)
    }

    fn read_routes(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u16, String>> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<u16, String>> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_servers(&self) -> std::sync::MutexGuard<'_, HashMap<u16, TcpHub>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn on_data(&self, port: u16, conn: &Connection, data: &[u8]) {
        let client = self.read_routes().get(&port).cloned();
        match client {
            Some(client) => {
                debug!(port, client = %client, data = %hex::encode(data), ">");
                self.binding.forward(&client, data).await;
            }
            None => warn!(port, peer = %conn.peer, "data on unregistered port, dropped"),
        }
    }
}

impl GatewayPoint for PortRelayPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PointFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.stop().await;
            self.start_servers(false).await;
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    /// Stops every listener. The port table is kept for the next start.
    fn stop(&self) -> PointFuture<'_, ()> {
        Box::pin(async move {
            self.stop_servers().await;
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
            let Some(port) = self.port_for(client) else {
                warn!(client = %client, "no port registered for client");
                return Ok(());
            };
            let Some(hub) = self.hub_for(port) else {
                warn!(port, client = %client, "no listener running for port");
                return Ok(());
            };

            let delivered = hub.broadcast(data);
            debug!(port, client = %client, delivered, data = %hex::encode(data), "<");
            Ok(())
        })
    }

    /// Names whose port currently has at least one connection.
    fn connected_clients(&self) -> Vec<String> {
        let live: Vec<u16> = self
            .lock_servers()
            .iter()
            .filter(|(_, hub)| hub.handle().connection_count() > 0)
            .map(|(port, _)| *port)
            .collect();
        let routes = self.read_routes();
        let mut names: Vec<String> = live
            .iter()
            .filter_map(|port| routes.get(port).cloned())
            .collect();
        names.sort();
        names.dedup();
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

struct RelayHandler {
    point: Weak<PortRelayPoint>,
    port: u16,
}

impl ConnectionHandler for RelayHandler {
    fn on_connected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()> {
        Box::pin(async move {
            info!(port = self.port, peer = %conn.peer, "relay client connected");
        })
    }

    fn on_data<'a>(&'a self, conn: &'a Connection, data: &'a [u8]) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_data(self.port, conn, data).await;
            }
        })
    }

    fn on_disconnected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()> {
        Box::pin(async move {
            info!(port = self.port, peer = %conn.peer, "relay client disconnected");
        })
    }
}
