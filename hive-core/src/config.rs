//! Network tuning constants, collected in one place.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default discovery UDP port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 9999;
/// Candidate message ports, tried in order. Low ports first: 443 and 80 are the
/// ones least likely to be firewalled on managed networks.
pub const DEFAULT_MESSAGE_PORTS: [u16; 8] = [443, 80, 8080, 53, 8888, 9090, 5353, 49152];
/// Default direct-link TCP port.
pub const DEFAULT_LINK_PORT: u16 = 8888;

/// Every tunable of the network core. Passed at construction; not reconfigurable at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    pub discovery_port: u16,
    pub message_ports: Vec<u16>,
    /// Local address for listening sockets.
    pub bind_addr: IpAddr,
    /// Destination of announcements.
    pub broadcast_addr: Ipv4Addr,
    /// Pause between announcement bursts.
    pub broadcast_interval: Duration,
    /// Datagrams sent back-to-back per burst.
    pub broadcast_burst: u32,
    pub burst_gap: Duration,
    /// Discovery stops on its own after this long.
    pub discovery_duration: Duration,
    /// Listener receive timeout; only bounds how long a stop takes to be noticed.
    pub listen_timeout: Duration,
    /// Peers unseen for this long are evicted. Must exceed one discovery cycle.
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub link_port: u16,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            message_ports: DEFAULT_MESSAGE_PORTS.to_vec(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addr: Ipv4Addr::BROADCAST,
            broadcast_interval: Duration::from_secs(1),
            broadcast_burst: 3,
            burst_gap: Duration::from_millis(50),
            discovery_duration: Duration::from_secs(30),
            listen_timeout: Duration::from_secs(2),
            stale_threshold: Duration::from_secs(35),
            sweep_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            link_port: DEFAULT_LINK_PORT,
        }
    }
}

impl NetConfig {
    /// Ports to try when connecting to a peer: its advertised port first, then the
    /// candidate list without repeating it.
    pub fn connect_order(&self, preferred: u16) -> Vec<u16> {
        std::iter::once(preferred)
            .chain(self.message_ports.iter().copied().filter(|&p| p != preferred))
            .collect()
    }
}
