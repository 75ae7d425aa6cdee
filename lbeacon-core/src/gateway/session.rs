//! The gateway session: one task running the UDP join/poll/upload/health
//! state machine (spec §4.8).
//!
//! Unlike the HCI-facing scanners, this talks over a plain UDP socket, so
//! it runs as native async I/O on the Tokio runtime rather than inside
//! `spawn_blocking` — the one deliberate departure from spec §5's "no
//! user-space futures" framing of the legacy threaded model, since a
//! `tokio::net::UdpSocket` gives the same blocking-recv-with-timeout shape
//! the original achieves via `SO_RCVTIMEO` without needing a dedicated OS
//! thread per socket.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::UdpSocket, sync::Mutex as AsyncMutex, time::{timeout, Instant}};

use crate::{
    error::{Error, ErrorKind, Result},
    gateway::protocol::{self, HealthCategory, InboundPacket, OutboundPacket},
    shutdown::ShutdownWatcher,
    store::SightingStore,
};

const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const JOIN_BACKOFF: Duration = Duration::from_secs(30);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(1);
const MAX_NO_OBJECTS: usize = 4096;

/// Current state of the session (spec §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Joining,
    Ready,
    ShuttingDown,
}

/// Configuration the gateway session is reloaded from, and can itself
/// mutate in response to `Reconfig` packets.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub uuid: String,
    pub version: String,
    pub gateway_addr: SocketAddr,
    pub local_client_port: u16,
}

/// In-memory tunables a `Reconfig` packet can update live (spec §4.8).
#[derive(Clone, Debug)]
pub struct ReconfigurableParams {
    pub scan_rssi_coverage: i8,
    pub mac_prefix_list: Vec<String>,
    pub advertise_interval_units_0625ms: u16,
}

/// Address assigned by the gateway on a successful join.
#[derive(Clone, Debug, Default)]
pub struct AssignedAddress {
    pub local_addr: String,
}

/// Supplies the last line of the health-report log on `PollHealthReport`
/// (spec §4.8). A trait so the session doesn't need to know whether the
/// log lives on disk or in memory during tests.
pub trait HealthReportSource: Send + Sync {
    fn last_line(&self) -> Option<String>;
}

const HEALTH_REPORT_ERROR_MARKER: &str = "ERROR";

/// Runs the gateway session until `shutdown` fires.
pub struct GatewaySession {
    config: GatewayConfig,
    store: Arc<std::sync::Mutex<SightingStore>>,
    params: Arc<AsyncMutex<ReconfigurableParams>>,
    health: Arc<dyn HealthReportSource>,
    state: SessionState,
    assigned: AssignedAddress,
    last_packet_at: Instant,
}

impl GatewaySession {
    pub fn new(
        config: GatewayConfig, store: Arc<std::sync::Mutex<SightingStore>>, params: Arc<AsyncMutex<ReconfigurableParams>>,
        health: Arc<dyn HealthReportSource>,
    ) -> Self {
        Self {
            config,
            store,
            params,
            health,
            state: SessionState::Initial,
            assigned: AssignedAddress::default(),
            last_packet_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn assigned(&self) -> &AssignedAddress {
        &self.assigned
    }

    /// Runs the full protocol loop until shutdown is requested.
    pub async fn run(&mut self, mut shutdown: ShutdownWatcher) -> Result<()> {
        let socket = bind_socket(self.config.local_client_port).await?;

        loop {
            if shutdown.is_requested() {
                self.state = SessionState::ShuttingDown;
                self.drain_on_shutdown(&socket).await;
                return Ok(());
            }

            match self.state {
                SessionState::Initial => {
                    self.send_join_request(&socket).await?;
                    self.state = SessionState::Joining;
                }
                SessionState::Joining => {
                    self.run_joining(&socket, &mut shutdown).await?;
                }
                SessionState::Ready => {
                    self.run_ready(&socket, &mut shutdown).await?;
                }
                SessionState::ShuttingDown => {
                    self.drain_on_shutdown(&socket).await;
                    return Ok(());
                }
            }
        }
    }

    async fn send_join_request(&self, socket: &UdpSocket) -> Result<()> {
        let packet = protocol::join_request(&self.config.uuid, &self.config.version);
        send_packet(socket, self.config.gateway_addr, &packet).await
    }

    async fn run_joining(&mut self, socket: &UdpSocket, shutdown: &mut ShutdownWatcher) -> Result<()> {
        let mut buf = [0u8; protocol::MAX_PACKET_LEN];
        let recv = tokio::select! {
            result = timeout(JOIN_TIMEOUT, socket.recv_from(&mut buf)) => result,
            _ = shutdown.wait() => return Ok(()),
        };

        let datagram = match recv {
            Ok(Ok((n, _))) => &buf[..n],
            Ok(Err(e)) => {
                log::warn!("gateway recv failed while joining: {e}");
                return Ok(());
            }
            Err(_) => {
                log::warn!("gateway join timed out, retrying in {:?}", JOIN_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(JOIN_BACKOFF) => {}
                    _ = shutdown.wait() => return Ok(()),
                }
                self.send_join_request(socket).await?;
                return Ok(());
            }
        };

        match protocol::parse_inbound(datagram) {
            Ok(InboundPacket::JoinAck { ok: true, assigned_addr }) => {
                self.assigned = AssignedAddress { local_addr: assigned_addr };
                self.state = SessionState::Ready;
                self.last_packet_at = Instant::now();
            }
            Ok(InboundPacket::JoinAck { ok: false, .. }) => {
                log::warn!("gateway denied join, backing off {:?}", JOIN_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(JOIN_BACKOFF) => {}
                    _ = shutdown.wait() => return Ok(()),
                }
                self.send_join_request(socket).await?;
            }
            Ok(_) => log::warn!("unexpected packet while joining, ignoring"),
            Err(e) => log::warn!("malformed packet while joining: {e}"),
        }
        Ok(())
    }

    async fn run_ready(&mut self, socket: &UdpSocket, shutdown: &mut ShutdownWatcher) -> Result<()> {
        if self.last_packet_at.elapsed() >= IDLE_TIMEOUT {
            log::info!("no packet from gateway for {:?}, rejoining", IDLE_TIMEOUT);
            self.state = SessionState::Joining;
            self.last_packet_at = Instant::now();
            self.send_join_request(socket).await?;
            return Ok(());
        }

        let mut buf = [0u8; protocol::MAX_PACKET_LEN];
        let recv = tokio::select! {
            result = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf)) => result,
            _ = shutdown.wait() => return Ok(()),
        };

        let datagram = match recv {
            Ok(Ok((n, _))) => {
                self.last_packet_at = Instant::now();
                buf[..n].to_vec()
            }
            Ok(Err(e)) => {
                log::warn!("gateway recv failed: {e}, rejoining");
                self.state = SessionState::Joining;
                return Ok(());
            }
            Err(_) => return Ok(()), // recv timeout: loop back around to re-check the idle budget
        };

        match protocol::parse_inbound(&datagram) {
            Ok(InboundPacket::PollTrackedObjects) => self.handle_poll_tracked_objects(socket).await?,
            Ok(InboundPacket::PollHealthReport) => self.handle_poll_health_report(socket).await?,
            Ok(InboundPacket::Reconfig { key, value }) => self.handle_reconfig(key, value).await,
            Ok(InboundPacket::JoinAck { .. }) => log::debug!("stray JoinAck while ready, ignoring"),
            Err(e) => log::warn!("malformed gateway packet dropped: {e}"),
        }
        Ok(())
    }

    async fn handle_poll_tracked_objects(&mut self, socket: &UdpSocket) -> Result<()> {
        let records = {
            let mut store = self.store.lock().expect("sighting store mutex poisoned");
            store.drain_for_upload(MAX_NO_OBJECTS)
        };
        let packets = protocol::chunk_tracked_objects(&self.config.uuid, &self.assigned.local_addr, records);
        for packet in packets {
            if let Err(e) = send_packet(socket, self.config.gateway_addr, &packet).await {
                log::warn!("failed to send tracked-objects response: {e}, rejoining");
                self.state = SessionState::Joining;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn handle_poll_health_report(&mut self, socket: &UdpSocket) -> Result<()> {
        let line = self.health.last_line().unwrap_or_default();
        let category = if line.contains(HEALTH_REPORT_ERROR_MARKER) { HealthCategory::Error } else { HealthCategory::Info };
        let packet = OutboundPacket::HealthReportResp { uuid: self.config.uuid.clone(), category, message: line };
        if let Err(e) = send_packet(socket, self.config.gateway_addr, &packet).await {
            log::warn!("failed to send health report response: {e}, rejoining");
            self.state = SessionState::Joining;
        }
        Ok(())
    }

    async fn handle_reconfig(&self, key: String, value: String) {
        let mut params = self.params.lock().await;
        match key.as_str() {
            "scan_rssi_coverage" => match value.parse() {
                Ok(v) => params.scan_rssi_coverage = v,
                Err(_) => log::warn!("Reconfig: invalid scan_rssi_coverage {value:?}"),
            },
            "mac_prefix_list" => params.mac_prefix_list = value.split(',').map(str::to_string).collect(),
            "advertise_interval_in_units_0625_ms" => match value.parse() {
                Ok(v) => params.advertise_interval_units_0625ms = v,
                Err(_) => log::warn!("Reconfig: invalid advertise interval {value:?}"),
            },
            other => log::warn!("Reconfig: unknown key {other:?}"),
        }
    }

    async fn drain_on_shutdown(&mut self, socket: &UdpSocket) {
        let records = {
            let mut store = self.store.lock().expect("sighting store mutex poisoned");
            store.drain_for_upload(MAX_NO_OBJECTS)
        };
        if records.is_empty() {
            return;
        }
        let packets = protocol::chunk_tracked_objects(&self.config.uuid, &self.assigned.local_addr, records);
        let _ = timeout(SHUTDOWN_DRAIN_BUDGET, async {
            for packet in packets {
                let _ = send_packet(socket, self.config.gateway_addr, &packet).await;
            }
        })
        .await;
    }
}

async fn bind_socket(local_port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = ([0, 0, 0, 0], local_port).into();
    UdpSocket::bind(addr).await.map_err(Error::from)
}

async fn send_packet(socket: &UdpSocket, to: SocketAddr, packet: &OutboundPacket) -> Result<()> {
    let bytes = packet.encode();
    timeout(Duration::from_secs(2), socket.send_to(&bytes, to))
        .await
        .map_err(|_| Error::new(ErrorKind::TransportError))?
        .map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;

    struct FixedHealth(Option<String>);
    impl HealthReportSource for FixedHealth {
        fn last_line(&self) -> Option<String> {
            self.0.clone()
        }
    }

    fn store() -> Arc<std::sync::Mutex<SightingStore>> {
        Arc::new(std::sync::Mutex::new(SightingStore::new(StoreConfig {
            slab_capacity: 16,
            tracked_queue_capacity: 16,
            silence_timeout_ms: 5_000,
            mempool_usage_threshold: 0.70,
        })))
    }

    /// S5 — gateway join round-trip.
    #[tokio::test]
    async fn join_round_trip_moves_to_ready_with_assigned_address() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();

        let config = GatewayConfig { uuid: "abc".into(), version: "2.0.0".into(), gateway_addr, local_client_port: 0 };
        let params = Arc::new(AsyncMutex::new(ReconfigurableParams {
            scan_rssi_coverage: -70,
            mac_prefix_list: vec![],
            advertise_interval_units_0625ms: 100,
        }));
        let mut session = GatewaySession::new(config, store(), params, Arc::new(FixedHealth(None)));

        let socket = bind_socket(0).await.unwrap();
        session.send_join_request(&socket).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = gateway.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x30;abc;2.0.0");

        let reply = b"\x31;OK;10.0.0.5";
        gateway.send_to(reply, socket.local_addr().unwrap()).await.unwrap();
        let _ = from;

        let mut recv_buf = [0u8; 64];
        let (n, _) = socket.recv_from(&mut recv_buf).await.unwrap();
        let parsed = protocol::parse_inbound(&recv_buf[..n]).unwrap();
        assert_eq!(parsed, InboundPacket::JoinAck { ok: true, assigned_addr: "10.0.0.5".into() });
    }

    /// S6 — idle reconnect: no gateway packets for 31s from `Ready` emits
    /// exactly one new `JoinRequest` and returns to `Joining`.
    #[tokio::test(start_paused = true)]
    async fn idle_timeout_from_ready_rejoins_exactly_once() {
        let gateway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap();
        let config = GatewayConfig { uuid: "abc".into(), version: "2.0.0".into(), gateway_addr, local_client_port: 0 };
        let params = Arc::new(AsyncMutex::new(ReconfigurableParams {
            scan_rssi_coverage: -70,
            mac_prefix_list: vec![],
            advertise_interval_units_0625ms: 100,
        }));
        let mut session = GatewaySession::new(config, store(), params, Arc::new(FixedHealth(None)));
        session.state = SessionState::Ready;
        session.last_packet_at = Instant::now();

        let socket = bind_socket(0).await.unwrap();
        let mut shutdown = crate::shutdown::ShutdownSignal::new().watcher();

        tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
        session.run_ready(&socket, &mut shutdown).await.unwrap();

        assert_eq!(session.state(), SessionState::Joining);

        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(1), gateway.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"\x30;abc;2.0.0");
    }

    /// A transport failure while uploading must return the session to
    /// `Joining` and keep the task alive, not tear it down (spec §4.8/§7:
    /// "transport reset moves to Joining", not "task exits").
    #[tokio::test]
    async fn transport_error_during_poll_transitions_to_joining_without_exiting() {
        // An IPv6 address is unreachable from the IPv4 socket this session
        // binds, so the send fails synchronously rather than timing out.
        let unreachable_addr: SocketAddr = "[::1]:9".parse().unwrap();
        let config = GatewayConfig { uuid: "abc".into(), version: "2.0.0".into(), gateway_addr: unreachable_addr, local_client_port: 0 };
        let params = Arc::new(AsyncMutex::new(ReconfigurableParams {
            scan_rssi_coverage: -70,
            mac_prefix_list: vec![],
            advertise_interval_units_0625ms: 100,
        }));
        let store_handle = store();
        store_handle.lock().unwrap().observe_br("AA:BB:CC:DD:EE:01".parse().unwrap(), -60, 1000);

        let mut session = GatewaySession::new(config, store_handle, params, Arc::new(FixedHealth(None)));
        session.state = SessionState::Ready;

        let socket = bind_socket(0).await.unwrap();
        let result = session.handle_poll_tracked_objects(&socket).await;

        assert!(result.is_ok(), "a transport failure must not terminate the session task");
        assert_eq!(session.state(), SessionState::Joining);
    }

    #[test]
    fn health_report_with_error_marker_is_categorized_as_error() {
        let line = "2026-01-01T00:00:00Z ERROR dongle lost".to_string();
        let category = if line.contains(HEALTH_REPORT_ERROR_MARKER) { HealthCategory::Error } else { HealthCategory::Info };
        assert_eq!(category, HealthCategory::Error);
    }

    #[test]
    fn health_report_without_marker_is_categorized_as_info() {
        let line = "2026-01-01T00:00:00Z heartbeat ok".to_string();
        let category = if line.contains(HEALTH_REPORT_ERROR_MARKER) { HealthCategory::Error } else { HealthCategory::Info };
        assert_eq!(category, HealthCategory::Info);
    }
}
