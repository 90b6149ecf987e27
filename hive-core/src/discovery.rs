//! LAN discovery: UDP broadcast announcements, a listener feeding the presence registry,
//! an auto-stop watchdog and an always-on staleness sweep.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::error::NetError;
use crate::identity::LocalIdentity;
use crate::messaging::MessagingEngine;
use crate::protocol::{now_ms, PeerRecord};
use crate::registry::PresenceRegistry;
use crate::signal::{lock, Signal, Trigger};
use crate::status::{self, StatusBoard};
use crate::wire::{decode_announcement, encode_announcement};

/// Receive buffer; anything longer than `wire::MAX_DATAGRAM_LEN` is rejected on decode.
const RECV_BUF_LEN: usize = 65536;

/// A running discovery session: its generation number and the trigger that ends it.
struct Session {
    generation: u64,
    stop: Trigger,
}

pub struct DiscoveryEngine {
    config: NetConfig,
    identity: LocalIdentity,
    registry: Arc<PresenceRegistry>,
    status: Arc<StatusBoard>,
    messaging: Arc<MessagingEngine>,
    session: Mutex<Option<Session>>,
    generation: Mutex<u64>,
    /// Ends the staleness sweep.
    shutdown: Trigger,
}

impl DiscoveryEngine {
    pub fn new(
        config: NetConfig,
        identity: LocalIdentity,
        registry: Arc<PresenceRegistry>,
        status: Arc<StatusBoard>,
        messaging: Arc<MessagingEngine>,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            status,
            messaging,
            session: Mutex::new(None),
            generation: Mutex::new(0),
            shutdown: Trigger::new(),
        }
    }

    /// Start a discovery session: clear the peer list, then run the broadcast loop, the
    /// listener and the watchdog until `stop`. No-op if already discovering; `NotReady`
    /// while the messaging engine has no port to advertise.
    pub fn start(self: &Arc<Self>) -> Result<(), NetError> {
        let Some(port) = self.messaging.active_port() else {
            warn!("cannot start discovery: message server not running");
            self.status.set(status::CANNOT_DISCOVER);
            return Err(NetError::NotReady);
        };
        let mut session = lock(&self.session);
        if session.is_some() {
            debug!("discovery already in progress");
            return Ok(());
        }
        let generation = {
            let mut g = lock(&self.generation);
            *g += 1;
            *g
        };
        let stop = Trigger::new();

        self.registry.clear();
        self.status.set_discovering(true);
        self.status.set(status::DISCOVERING);

        let engine = self.clone();
        let signal = stop.signal();
        tokio::spawn(async move { engine.broadcast_loop(port, signal).await });
        let engine = self.clone();
        let signal = stop.signal();
        tokio::spawn(async move { engine.listen_loop(signal).await });
        let engine = self.clone();
        let mut signal = stop.signal();
        let duration = self.config.discovery_duration;
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.fired() => {}
                _ = tokio::time::sleep(duration) => {
                    debug!("discovery session timed out");
                    engine.stop_session(generation);
                }
            }
        });

        *session = Some(Session { generation, stop });
        info!(port, "discovery started");
        Ok(())
    }

    /// End the current session, if any, and publish a summary.
    pub fn stop(&self) {
        let ended = lock(&self.session).take();
        self.finish(ended);
    }

    fn stop_session(&self, generation: u64) {
        let ended = {
            let mut session = lock(&self.session);
            match session.as_ref() {
                Some(s) if s.generation == generation => session.take(),
                _ => None,
            }
        };
        self.finish(ended);
    }

    fn finish(&self, ended: Option<Session>) {
        let Some(session) = ended else {
            return;
        };
        session.stop.fire();
        self.status.set_discovering(false);
        let found = self.registry.len();
        self.status.set(status::discovery_summary(found));
        info!(found, "discovery stopped");
    }

    pub fn is_discovering(&self) -> bool {
        lock(&self.session).is_some()
    }

    async fn broadcast_loop(self: Arc<Self>, listen_port: u16, mut stop: Signal) {
        let payload = match encode_announcement(&self.identity.id, &self.identity.display_name, listen_port) {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot encode announcement: {e}");
                return;
            }
        };
        let dest = SocketAddr::new(self.config.broadcast_addr.into(), self.config.discovery_port);
        let mut socket: Option<UdpSocket> = None;
        loop {
            if socket.is_none() {
                socket = match bind_broadcast_socket(&self.config).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("broadcast socket error: {e}");
                        None
                    }
                };
            }
            if let Some(sock) = &socket {
                for i in 0..self.config.broadcast_burst {
                    if i > 0 {
                        tokio::time::sleep(self.config.burst_gap).await;
                    }
                    match sock.send_to(&payload, dest).await {
                        Ok(_) => debug!(%dest, listen_port, "announcement sent"),
                        Err(e) => warn!(%dest, "broadcast error: {e}"),
                    }
                }
            }
            tokio::select! {
                _ = stop.fired() => break,
                _ = tokio::time::sleep(self.config.broadcast_interval) => {}
            }
        }
        debug!("broadcast loop stopped");
    }

    async fn listen_loop(self: Arc<Self>, mut stop: Signal) {
        let bind = SocketAddr::new(self.config.bind_addr, self.config.discovery_port);
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut socket: Option<UdpSocket> = None;
        loop {
            if socket.is_none() {
                match bind_listener(bind).await {
                    Ok(s) => socket = Some(s),
                    Err(e) => warn!(%bind, "discovery socket error: {e}"),
                }
            }
            let Some(sock) = socket.as_ref() else {
                tokio::select! {
                    _ = stop.fired() => break,
                    _ = tokio::time::sleep(self.config.listen_timeout) => continue,
                }
            };
            let received = tokio::select! {
                _ = stop.fired() => break,
                res = tokio::time::timeout(self.config.listen_timeout, sock.recv_from(&mut buf)) => res,
            };
            match received {
                // Timeout only lets the loop look at `stop` again.
                Err(_) => {}
                Ok(Ok((n, from))) => {
                    self.ingest(&buf[..n], from);
                }
                Ok(Err(e)) => warn!("listener error: {e}"),
            }
        }
        debug!("listen loop stopped");
    }

    /// Handle one received datagram. Malformed packets and our own announcements are
    /// dropped. Returns the upserted record.
    pub fn ingest(&self, datagram: &[u8], from: SocketAddr) -> Option<PeerRecord> {
        let ann = match decode_announcement(datagram) {
            Ok(a) => a,
            Err(e) => {
                debug!(%from, "dropping bad announcement: {e}");
                return None;
            }
        };
        if ann.peer_id == self.identity.id {
            return None;
        }
        let record = PeerRecord::from_announcement(&ann, from.ip(), now_ms());
        if self.registry.upsert(record.clone()) {
            info!(peer = %record.id, name = %record.name, addr = %from.ip(), port = record.port, "peer found");
        }
        Some(record)
    }

    /// Evict stale peers every `sweep_interval` until `shutdown`, whether or not a
    /// discovery session is running.
    pub fn spawn_stale_sweep(self: &Arc<Self>) {
        let engine = self.clone();
        let mut stop = self.shutdown.signal();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.fired() => break,
                    _ = interval.tick() => {
                        let removed = engine.registry.evict_stale(now_ms(), engine.config.stale_threshold);
                        if removed > 0 {
                            debug!(removed, active = engine.registry.len(), "removed stale peers");
                        }
                    }
                }
            }
        });
    }

    /// Stop any session and the staleness sweep.
    pub fn shutdown(&self) {
        self.stop();
        self.shutdown.fire();
    }
}

async fn bind_listener(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

async fn bind_broadcast_socket(config: &NetConfig) -> std::io::Result<UdpSocket> {
    bind_listener(SocketAddr::new(config.bind_addr, 0)).await
}
