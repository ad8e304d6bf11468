//! Framed collector endpoint.
//!
//! Devices speak the star-delimited frame protocol and identify themselves
//! with a 15-digit identity in every frame. Registration and heartbeat
//! requests are answered in kind, telemetry is forwarded to the bound peer,
//! and connections that stay silent past the idle threshold are dropped.

use crate::liveness::{LivenessGuard, LivenessMonitor, DEFAULT_CHECK_INTERVAL, DEFAULT_IDLE_THRESHOLD};
use crate::transport::tcp::{ConnId, Connection, ConnectionHandler, HubOptions, TcpHub};
use gatepoint_core::codec::{decode_frame, encode_frame, function, DecodeOutcome, Frame, HEADER_LEN};
use gatepoint_core::{
    hex_preview, Binding, ClientFilter, GatewayError, GatewayPoint, GatewayResult, PointEvents,
    PointFuture,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Hex bytes shown for frames that fail to decode.
const INVALID_DUMP_LIMIT: usize = 50;

/// Hex bytes shown for ordinary traffic.
const TRAFFIC_DUMP_LIMIT: usize = 256;

/// Largest frame the 16-bit length field can describe.
const MAX_FRAME_LEN: usize = HEADER_LEN + u16::MAX as usize;

/// Settings for [`FramedIdentityPoint`].
#[derive(Debug, Clone)]
pub struct FramedOptions {
    pub bind: String,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    /// Delay before the first bind retry after a failed start.
    pub first_retry: Duration,
    /// Delay between later bind retries.
    pub retry_interval: Duration,
}

impl FramedOptions {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            idle_timeout: DEFAULT_IDLE_THRESHOLD,
            check_interval: DEFAULT_CHECK_INTERVAL,
            first_retry: Duration::from_secs(1),
            retry_interval: Duration::from_secs(3),
        }
    }
}

struct ConnectionRecord {
    conn: Connection,
    identity: Option<String>,
    liveness: LivenessGuard,
    /// Head of a frame whose payload has not fully arrived.
    pending: Vec<u8>,
}

impl ConnectionRecord {
    fn label(&self) -> String {
        match &self.identity {
            Some(identity) => identity.clone(),
            None => self.conn.peer.to_string(),
        }
    }
}

/// State of one run, between `start` and `stop`.
#[derive(Default)]
struct Lifecycle {
    hub: Option<TcpHub>,
    monitor: Option<Arc<LivenessMonitor>>,
    retry: Option<JoinHandle<()>>,
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }
}

pub struct FramedIdentityPoint {
    me: Weak<Self>,
    name: String,
    options: FramedOptions,
    filter: ClientFilter,
    binding: Binding,
    events: PointEvents,
    listening: AtomicBool,
    records: Mutex<HashMap<ConnId, ConnectionRecord>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl FramedIdentityPoint {
    /// The allow-list starts enabled with no names; configure it through
    /// [`GatewayPoint::client_filter`].
    pub fn new(options: FramedOptions) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: format!("framed({})", options.bind),
            options,
            filter: ClientFilter::new(true, Vec::new()),
            binding: Binding::new(),
            events: PointEvents::new(),
            listening: AtomicBool::new(false),
            records: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
        })
    }

    /// Address actually bound, once listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.lock().await.hub.as_ref().map(TcpHub::local_addr)
    }

    /// Number of live connections, identified or not.
    pub fn connection_count(&self) -> usize {
        self.lock_records().len()
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bind_addr(&self) -> GatewayResult<SocketAddr> {
        self.options
            .bind
            .parse()
            .map_err(|_| GatewayError::InvalidAddress(self.options.bind.clone()))
    }

    /// Bind the listener and install it. Called with the lifecycle locked.
    async fn listen(&self, lifecycle: &mut Lifecycle, addr: SocketAddr) -> GatewayResult<()> {
        let monitor = Arc::new(LivenessMonitor::start(
            self.options.idle_timeout,
            self.options.check_interval,
        ));
        let handler = Arc::new(FramedHandler {
            point: self.me.clone(),
            monitor: monitor.clone(),
        });

        let options = HubOptions {
            read_buffer: Some(MAX_FRAME_LEN),
            ..Default::default()
        };
        let hub = TcpHub::bind(addr, options, handler).await?;
        info!(point = %self.name, addr = %hub.local_addr(), "framed point listening");

        lifecycle.hub = Some(hub);
        lifecycle.monitor = Some(monitor);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_retry(&self, addr: SocketAddr) -> JoinHandle<()> {
        let point = self.me.clone();
        let first = self.options.first_retry;
        let interval = self.options.retry_interval;

        tokio::spawn(async move {
            let mut delay = first;
            loop {
                tokio::time::sleep(delay).await;
                delay = interval;

                let Some(point) = point.upgrade() else {
                    break;
                };
                let mut lifecycle = point.lifecycle.lock().await;
                if lifecycle.hub.is_some() {
                    break;
                }
                match point.listen(&mut lifecycle, addr).await {
                    Ok(()) => {
                        // Finished; dropping our own handle only detaches it.
                        lifecycle.retry.take();
                        break;
                    }
                    Err(e) => {
                        debug!(point = %point.name, error = %e, "framed listener still unavailable");
                    }
                }
            }
        })
    }

    fn on_connected(&self, conn: &Connection, monitor: &LivenessMonitor) {
        let record = self.new_record(conn, monitor);
        if self.lock_records().insert(conn.id, record).is_some() {
            warn!(conn_id = conn.id, peer = %conn.peer, "connection record replaced");
        }
        info!(conn_id = conn.id, peer = %conn.peer, "framed client connected");
    }

    fn new_record(&self, conn: &Connection, monitor: &LivenessMonitor) -> ConnectionRecord {
        let hub = conn.hub().clone();
        let id = conn.id;
        let peer = conn.peer;
        let liveness = monitor.watch(move || {
            info!(conn_id = id, peer = %peer, "idle timeout, disconnecting");
            hub.disconnect(id);
        });
        ConnectionRecord {
            conn: conn.clone(),
            identity: None,
            liveness,
            pending: Vec::new(),
        }
    }

    async fn on_data(&self, conn: &Connection, data: &[u8], monitor: &LivenessMonitor) {
        let pending = self.take_pending(conn.id);
        let joined;
        let data = if pending.is_empty() {
            data
        } else {
            joined = [pending.as_slice(), data].concat();
            joined.as_slice()
        };

        let frame = match decode_frame(data) {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Malformed(reason) => {
                debug!(
                    conn_id = conn.id,
                    peer = %conn.peer,
                    reason = %reason,
                    data = %hex_preview(data, INVALID_DUMP_LIMIT),
                    "dropping invalid frame"
                );
                return;
            }
            DecodeOutcome::Incomplete { declared, available } => {
                if data.len() <= MAX_FRAME_LEN && self.keep_pending(conn.id, data) {
                    trace!(conn_id = conn.id, declared, available, "waiting for rest of frame");
                } else {
                    debug!(
                        conn_id = conn.id,
                        peer = %conn.peer,
                        declared,
                        available,
                        data = %hex_preview(data, INVALID_DUMP_LIMIT),
                        "dropping incomplete frame"
                    );
                }
                return;
            }
        };

        debug!(
            client = %frame.identity,
            code = frame.code,
            data = %hex_preview(data, TRAFFIC_DUMP_LIMIT),
            ">"
        );

        if !self.filter.permits(&frame.identity) {
            warn!(conn_id = conn.id, client = %frame.identity, "identity not in allow-list, disconnecting");
            conn.disconnect();
            return;
        }

        self.identify(conn, &frame.identity, monitor);
        self.dispatch(conn, frame).await;
    }

    fn take_pending(&self, id: ConnId) -> Vec<u8> {
        self.lock_records()
            .get_mut(&id)
            .map(|r| std::mem::take(&mut r.pending))
            .unwrap_or_default()
    }

    /// Hold a partial frame until the next read. False if the connection
    /// has no record.
    fn keep_pending(&self, id: ConnId, data: &[u8]) -> bool {
        match self.lock_records().get_mut(&id) {
            Some(record) => {
                record.pending = data.to_vec();
                true
            }
            None => false,
        }
    }

    /// Attach `identity` to the connection and restart its idle clock.
    fn identify(&self, conn: &Connection, identity: &str, monitor: &LivenessMonitor) {
        let mut records = self.lock_records();
        let record = records
            .entry(conn.id)
            .or_insert_with(|| self.new_record(conn, monitor));

        if record.identity.as_deref() != Some(identity) {
            info!(conn_id = conn.id, peer = %conn.peer, client = %identity, "framed client identified");
            record.identity = Some(identity.to_string());
        }
        record.liveness.restart();
    }

    async fn dispatch(&self, conn: &Connection, frame: Frame) {
        match frame.code {
            function::FORWARD => {
                let outcome = self.binding.forward(&frame.identity, &frame.payload).await;
                trace!(client = %frame.identity, ?outcome, "telemetry forwarded");
            }
            function::REGISTER | function::HEARTBEAT => {
                self.events.connected(&frame.identity);
                self.reply(conn, &frame, frame.code + 1);
            }
            code => {
                error!(client = %frame.identity, code, "unknown function code");
            }
        }
    }

    fn reply(&self, conn: &Connection, request: &Frame, code: u8) {
        match encode_frame(&request.identity, code, &request.payload) {
            Ok(bytes) => {
                debug!(client = %request.identity, code, data = %hex_preview(&bytes, TRAFFIC_DUMP_LIMIT), "<");
                if !conn.send(bytes) {
                    debug!(client = %request.identity, "reply dropped, connection closed");
                }
            }
            Err(e) => warn!(client = %request.identity, error = %e, "cannot encode reply"),
        }
    }

    fn on_disconnected(&self, conn: &Connection) {
        let record = self.lock_records().remove(&conn.id);
        match record {
            Some(record) => {
                info!(conn_id = conn.id, client = %record.label(), "framed client disconnected");
                if let Some(identity) = &record.identity {
                    self.events.disconnected(identity);
                }
            }
            None => debug!(conn_id = conn.id, peer = %conn.peer, "unknown connection closed"),
        }
    }
}

impl GatewayPoint for FramedIdentityPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> PointFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.stop().await;
            let addr = self.bind_addr()?;

            let mut lifecycle = self.lifecycle.lock().await;
            if let Err(e) = self.listen(&mut lifecycle, addr).await {
                warn!(
                    point = %self.name,
                    error = %e,
                    retry_in = ?self.options.first_retry,
                    "framed listener failed to start, retrying"
                );
                lifecycle.retry = Some(self.spawn_retry(addr));
            }
            Ok(())
        })
    }

    fn stop(&self) -> PointFuture<'_, ()> {
        Box::pin(async move {
            let mut lifecycle = self.lifecycle.lock().await;
            if let Some(retry) = lifecycle.retry.take() {
                retry.abort();
            }
            self.listening.store(false, Ordering::SeqCst);

            let hub = lifecycle.hub.take();
            let monitor = lifecycle.monitor.take();
            if let Some(hub) = hub {
                hub.shutdown().await;
                info!(point = %self.name, "framed point stopped");
            }

            let records: Vec<ConnectionRecord> =
                self.lock_records().drain().map(|(_, r)| r).collect();
            drop(records);
            drop(monitor);
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
            let conn = self
                .lock_records()
                .values()
                .find(|r| r.identity.as_deref() == Some(client))
                .map(|r| r.conn.clone());

            let Some(conn) = conn else {
                debug!(client = %client, "no live connection for client");
                return Ok(());
            };

            let bytes = encode_frame(client, function::FORWARD, data)?;
            debug!(client = %client, data = %hex_preview(&bytes, TRAFFIC_DUMP_LIMIT), "<");
            if !conn.send(bytes) {
                debug!(client = %client, "connection closed before send");
            }
            Ok(())
        })
    }

    fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self
            .lock_records()
            .values()
            .filter_map(|r| r.identity.clone())
            .collect();
        clients.sort();
        clients.dedup();
        clients
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

/// Connection callbacks for one run of a [`FramedIdentityPoint`].
struct FramedHandler {
    point: Weak<FramedIdentityPoint>,
    monitor: Arc<LivenessMonitor>,
}

impl ConnectionHandler for FramedHandler {
    fn on_connected<'a>(&'a self, conn: &'a Connection) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_connected(conn, &self.monitor);
            }
        })
    }

    fn on_data<'a>(&'a self, conn: &'a Connection, data: &'a [u8]) -> PointFuture<'a, ()> {
        Box::pin(async move {
            if let Some(point) = self.point.upgrade() {
                point.on_data(conn, data, &self.monitor).await;
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
    use gatepoint_core::EventKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast;

    const IMEI: &str = "123456789012345";
    const WAIT: Duration = Duration::from_secs(5);

    async fn started(names: &[&str]) -> (Arc<FramedIdentityPoint>, SocketAddr) {
        started_with(FramedOptions::new("127.0.0.1:0"), names).await
    }

    async fn started_with(
        options: FramedOptions,
        names: &[&str],
    ) -> (Arc<FramedIdentityPoint>, SocketAddr) {
        let point = FramedIdentityPoint::new(options);
        point
            .client_filter()
            .set_names(names.iter().map(|n| n.to_string()));
        point.start().await.unwrap();
        let addr = point.local_addr().await.unwrap();
        (point, addr)
    }

    async fn next_event(rx: &mut broadcast::Receiver<gatepoint_core::PointEvent>) -> gatepoint_core::PointEvent {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    async fn closed(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            tokio::time::timeout(WAIT, stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    #[tokio::test]
    async fn registration_request_gets_reply_and_connect_event() {
        let (point, addr) = started(&[IMEI]).await;
        let mut events = point.subscribe();
        let mut device = TcpStream::connect(addr).await.unwrap();

        device.write_all(b"*123456789012345*\x02*\x00\x00*").await.unwrap();

        let reply = read_n(&mut device, 22).await;
        assert_eq!(reply, b"*123456789012345*\x03*\x00\x00*");

        let event = next_event(&mut events).await;
        assert_eq!(event.kind, EventKind::Connected);
        assert_eq!(event.client, IMEI);
        assert_eq!(point.connected_clients(), vec![IMEI]);
    }

    #[tokio::test]
    async fn heartbeat_echoes_payload() {
        let (point, addr) = started(&[IMEI]).await;
        let mut device = TcpStream::connect(addr).await.unwrap();

        let request = encode_frame(IMEI, function::HEARTBEAT, b"hb").unwrap();
        device.write_all(&request).await.unwrap();

        let reply = read_n(&mut device, 24).await;
        assert_eq!(reply, encode_frame(IMEI, function::HEARTBEAT_REPLY, b"hb").unwrap());
        point.stop().await;
    }

    #[tokio::test]
    async fn telemetry_reaches_bound_peer() {
        let (point, addr) = started(&[IMEI]).await;
        let sink = Arc::new(RecordingPoint::new("sink"));
        point.binding().bind(sink.clone());

        let mut device = TcpStream::connect(addr).await.unwrap();
        let frame = encode_frame(IMEI, function::FORWARD, &[0x10, 0x20]).unwrap();
        device.write_all(&frame).await.unwrap();

        let received = sink.wait_for(1, WAIT).await;
        assert_eq!(received, vec![(IMEI.to_string(), vec![0x10, 0x20])]);
    }

    #[tokio::test]
    async fn large_telemetry_frame_is_forwarded_whole() {
        let (point, addr) = started(&[IMEI]).await;
        let sink = Arc::new(RecordingPoint::new("sink"));
        point.binding().bind(sink.clone());

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(&encode_frame(IMEI, function::FORWARD, &payload).unwrap())
            .await
            .unwrap();

        let received = sink.wait_for(1, WAIT).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, IMEI);
        assert_eq!(received[0].1, payload);
    }

    #[tokio::test]
    async fn frame_split_across_reads_is_reassembled() {
        let (point, addr) = started(&[IMEI]).await;
        let sink = Arc::new(RecordingPoint::new("sink"));
        point.binding().bind(sink.clone());

        let frame = encode_frame(IMEI, function::FORWARD, b"0123456789").unwrap();
        let mut device = TcpStream::connect(addr).await.unwrap();
        device.write_all(&frame[..HEADER_LEN + 4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.received().is_empty());
        device.write_all(&frame[HEADER_LEN + 4..]).await.unwrap();

        let received = sink.wait_for(1, WAIT).await;
        assert_eq!(received, vec![(IMEI.to_string(), b"0123456789".to_vec())]);

        // The buffer is cleared once the frame completes.
        device
            .write_all(&encode_frame(IMEI, function::FORWARD, b"next").unwrap())
            .await
            .unwrap();
        let received = sink.wait_for(2, WAIT).await;
        assert_eq!(received[1], (IMEI.to_string(), b"next".to_vec()));
    }

    #[tokio::test]
    async fn failing_peer_keeps_connection_open() {
        let (point, addr) = started(&[IMEI]).await;
        let sink = Arc::new(RecordingPoint::failing("sink"));
        point.binding().bind(sink.clone());

        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(&encode_frame(IMEI, function::FORWARD, b"a").unwrap())
            .await
            .unwrap();
        sink.wait_for(1, WAIT).await;
        device
            .write_all(&encode_frame(IMEI, function::FORWARD, b"b").unwrap())
            .await
            .unwrap();
        assert_eq!(sink.wait_for(2, WAIT).await.len(), 2);

        device
            .write_all(&encode_frame(IMEI, function::HEARTBEAT, b"").unwrap())
            .await
            .unwrap();
        let reply = read_n(&mut device, 22).await;
        assert_eq!(reply[17], function::HEARTBEAT_REPLY);
        assert_eq!(point.connected_clients(), vec![IMEI]);
    }

    #[tokio::test]
    async fn unknown_identity_is_disconnected_without_reply() {
        let (point, addr) = started(&[IMEI]).await;
        let mut device = TcpStream::connect(addr).await.unwrap();

        let frame = encode_frame("999999999999999", function::REGISTER, b"").unwrap();
        device.write_all(&frame).await.unwrap();

        assert!(closed(&mut device).await);
        assert!(point.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn disabled_allow_list_accepts_any_identity() {
        let (point, addr) = started(&[]).await;
        point.client_filter().set_enabled(false);
        let mut device = TcpStream::connect(addr).await.unwrap();

        let frame = encode_frame("999999999999999", function::REGISTER, b"").unwrap();
        device.write_all(&frame).await.unwrap();

        let reply = read_n(&mut device, 22).await;
        assert_eq!(reply[17], function::REGISTER_REPLY);
    }

    #[tokio::test]
    async fn malformed_and_unknown_code_keep_connection_open() {
        let (point, addr) = started(&[IMEI]).await;
        let mut device = TcpStream::connect(addr).await.unwrap();

        device.write_all(b"garbage without delimiter").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        device
            .write_all(&encode_frame(IMEI, 0x09, b"").unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        device
            .write_all(&encode_frame(IMEI, function::HEARTBEAT, b"").unwrap())
            .await
            .unwrap();
        let reply = read_n(&mut device, 22).await;
        assert_eq!(reply[17], function::HEARTBEAT_REPLY);
        assert_eq!(point.connection_count(), 1);
    }

    #[tokio::test]
    async fn send_to_identified_client_writes_forward_frame() {
        let (point, addr) = started(&[IMEI]).await;
        let mut events = point.subscribe();
        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(&encode_frame(IMEI, function::REGISTER, b"").unwrap())
            .await
            .unwrap();
        read_n(&mut device, 22).await;
        next_event(&mut events).await;

        point.send_message_to_client(IMEI, b"cmd").await.unwrap();
        let frame = read_n(&mut device, 25).await;
        assert_eq!(frame, encode_frame(IMEI, function::FORWARD, b"cmd").unwrap());

        point
            .send_message_to_client("111111111111111", b"nobody")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_event_only_after_identification() {
        let (point, addr) = started(&[IMEI]).await;
        let mut events = point.subscribe();

        let anonymous = TcpStream::connect(addr).await.unwrap();
        drop(anonymous);

        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(&encode_frame(IMEI, function::REGISTER, b"").unwrap())
            .await
            .unwrap();
        read_n(&mut device, 22).await;
        drop(device);

        assert_eq!(next_event(&mut events).await.kind, EventKind::Connected);
        let gone = next_event(&mut events).await;
        assert_eq!(gone.kind, EventKind::Disconnected);
        assert_eq!(gone.client, IMEI);
    }

    #[tokio::test]
    async fn idle_connection_is_reaped() {
        let mut options = FramedOptions::new("127.0.0.1:0");
        options.idle_timeout = Duration::from_millis(300);
        options.check_interval = Duration::from_millis(50);
        let (point, addr) = started_with(options, &[IMEI]).await;
        let mut events = point.subscribe();

        let mut device = TcpStream::connect(addr).await.unwrap();
        device
            .write_all(&encode_frame(IMEI, function::REGISTER, b"").unwrap())
            .await
            .unwrap();
        read_n(&mut device, 22).await;

        assert!(closed(&mut device).await);
        assert_eq!(next_event(&mut events).await.kind, EventKind::Connected);
        assert_eq!(next_event(&mut events).await.kind, EventKind::Disconnected);
        assert!(point.connected_clients().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_listener() {
        let (point, addr) = started(&[IMEI]).await;
        let mut device = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        point.stop().await;
        point.stop().await;

        assert!(!point.is_started());
        assert!(closed(&mut device).await);
        assert_eq!(point.connection_count(), 0);
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_bind_address_is_an_error() {
        let point = FramedIdentityPoint::new(FramedOptions::new("not an address"));
        assert!(matches!(
            point.start().await,
            Err(GatewayError::InvalidAddress(_))
        ));
        assert!(!point.is_started());
    }

    #[tokio::test]
    async fn busy_port_is_retried_until_free() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = blocker.local_addr().unwrap();

        let mut options = FramedOptions::new(addr.to_string());
        options.first_retry = Duration::from_millis(50);
        options.retry_interval = Duration::from_millis(50);
        let point = FramedIdentityPoint::new(options);

        point.start().await.unwrap();
        assert!(!point.is_started());

        drop(blocker);
        let deadline = tokio::time::Instant::now() + WAIT;
        while !point.is_started() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(point.is_started());
        point.stop().await;
    }
}
