//! Gateway host: builds the configured points, wires their links, and
//! drives their lifecycle.

use crate::config::{PointKind, ServerConfig};
use crate::points::{FramedIdentityPoint, FramedOptions, NameRegistrationPoint, PortRelayPoint};
use gatepoint_core::{EventKind, GatewayError, GatewayPoint, GatewayResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The running set of gateway points.
pub struct GatewayServer {
    points: BTreeMap<PointKind, Arc<dyn GatewayPoint>>,
    framed: Option<Arc<FramedIdentityPoint>>,
    registration: Option<Arc<NameRegistrationPoint>>,
    relay: Option<Arc<PortRelayPoint>>,
    observers: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    /// Create every enabled point and bind the configured links.
    pub fn new(config: &ServerConfig) -> GatewayResult<Self> {
        let mut points: BTreeMap<PointKind, Arc<dyn GatewayPoint>> = BTreeMap::new();

        let framed = config.framed.as_ref().map(|settings| {
            let mut options = FramedOptions::new(settings.bind.clone());
            options.idle_timeout = settings.idle_timeout;
            options.check_interval = settings.check_interval;
            let point = FramedIdentityPoint::new(options);
            point.client_filter().set_enabled(settings.use_client_names);
            point.client_filter().set_names(settings.client_names.clone());
            points.insert(PointKind::Framed, point.clone());
            point
        });

        let registration = config.registration.as_ref().map(|settings| {
            let point = NameRegistrationPoint::new(settings.bind.clone());
            point.client_filter().set_enabled(settings.use_client_names);
            point.client_filter().set_names(settings.client_names.clone());
            points.insert(PointKind::Registration, point.clone());
            point
        });

        let relay = config.relay.as_ref().map(|settings| {
            let point = PortRelayPoint::with_host(settings.host);
            point.add_ports(settings.ports.clone());
            points.insert(PointKind::Relay, point.clone());
            point
        });

        for link in &config.links {
            let (Some(from), Some(to)) = (points.get(&link.from), points.get(&link.to)) else {
                return Err(GatewayError::Config(format!(
                    "link {} -> {} names a point that is not configured",
                    link.from, link.to
                )));
            };
            from.binding().bind(to.clone());
            info!(from = %link.from, to = %link.to, "points linked");
        }

        Ok(Self {
            points,
            framed,
            registration,
            relay,
            observers: Vec::new(),
        })
    }

    pub fn point(&self, kind: PointKind) -> Option<&Arc<dyn GatewayPoint>> {
        self.points.get(&kind)
    }

    pub fn framed(&self) -> Option<&Arc<FramedIdentityPoint>> {
        self.framed.as_ref()
    }

    pub fn registration(&self) -> Option<&Arc<NameRegistrationPoint>> {
        self.registration.as_ref()
    }

    pub fn relay(&self) -> Option<&Arc<PortRelayPoint>> {
        self.relay.as_ref()
    }

    pub fn kinds(&self) -> Vec<PointKind> {
        self.points.keys().copied().collect()
    }

    /// Start every point, logging their connect/disconnect notifications.
    pub async fn start_all(&mut self) -> GatewayResult<()> {
        self.stop_observers();
        for (kind, point) in &self.points {
            self.observers.push(spawn_event_log(*kind, point.as_ref()));
            point.start().await?;
            info!(point = %point.name(), started = point.is_started(), "point started");
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for point in self.points.values() {
            point.stop().await;
        }
        self.stop_observers();
        info!("all points stopped");
    }

    fn stop_observers(&mut self) {
        for observer in self.observers.drain(..) {
            observer.abort();
        }
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.stop_observers();
    }
}

fn spawn_event_log(kind: PointKind, point: &dyn GatewayPoint) -> JoinHandle<()> {
    let mut events = point.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    EventKind::Connected => info!(point = %kind, client = %event.client, "client online"),
                    EventKind::Disconnected => info!(point = %kind, client = %event.client, "client offline"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(point = %kind, skipped, "event observer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_file;
    use gatepoint_core::codec::{encode_frame, function};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(toml: &str) -> ServerConfig {
        ServerConfig::from_file(parse_config_file(toml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn builds_enabled_points_only() {
        let server = GatewayServer::new(&config(
            "[framed]\nbind = \"127.0.0.1:0\"\n[registration]\nenabled = true\nbind = \"127.0.0.1:0\"\n",
        ))
        .unwrap();

        assert_eq!(server.kinds(), vec![PointKind::Framed, PointKind::Registration]);
        assert!(server.point(PointKind::Relay).is_none());
        let framed = server.point(PointKind::Framed).unwrap();
        assert!(framed.client_filter().is_enabled());
    }

    #[tokio::test]
    async fn links_bind_points() {
        let server = GatewayServer::new(&config(
            r#"
            [framed]
            bind = "127.0.0.1:0"
            [registration]
            enabled = true
            bind = "127.0.0.1:0"
            [[links]]
            from = "registration"
            to = "framed"
            "#,
        ))
        .unwrap();

        let registration = server.point(PointKind::Registration).unwrap();
        let framed = server.point(PointKind::Framed).unwrap();
        assert_eq!(registration.binding().peer().unwrap().name(), framed.name());
        assert!(!framed.binding().is_bound());
    }

    /// A relay device's bytes travel to a framed device as a forward frame.
    #[tokio::test]
    async fn relay_to_framed_pipeline() {
        let port = {
            let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
            reserved.local_addr().unwrap().port()
        };
        let imei = "123456789012345";
        let mut server = GatewayServer::new(&config(&format!(
            r#"
            [framed]
            bind = "127.0.0.1:0"
            client_names = ["{imei}"]
            [relay]
            enabled = true
            host = "127.0.0.1"
            [relay.ports]
            {port} = "{imei}"
            [[links]]
            from = "relay"
            to = "framed"
            "#
        )))
        .unwrap();
        server.start_all().await.unwrap();

        let framed = server.framed().unwrap().clone();
        let mut events = framed.subscribe();
        assert_eq!(server.relay().unwrap().listening_ports(), vec![port]);

        let framed_addr = framed.local_addr().await.unwrap();
        let mut device = TcpStream::connect(framed_addr).await.unwrap();
        device
            .write_all(&encode_frame(imei, function::REGISTER, b"").unwrap())
            .await
            .unwrap();
        let mut reply = [0u8; 22];
        tokio::time::timeout(WAIT, device.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();

        let mut meter = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        meter.write_all(b"kwh").await.unwrap();

        let expected = encode_frame(imei, function::FORWARD, b"kwh").unwrap();
        let mut forwarded = vec![0u8; expected.len()];
        tokio::time::timeout(WAIT, device.read_exact(&mut forwarded))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, expected);

        server.stop_all().await;
        server.stop_all().await;
        assert!(!framed.is_started());
    }
}
