//! Human-readable status surface shared by a transport's engines.

use tokio::sync::watch;
use tracing::debug;

/// Token present in the status text whenever no listening port could be bound.
/// Hosts match on it to offer the direct-link fallback.
pub const RESTRICTED_NETWORK_TOKEN: &str = "All ports blocked";

pub const INITIALIZING: &str = "Initializing...";
pub const DISCOVERING: &str = "Discovering peers...";
pub const NO_PEERS_FOUND: &str = "No peers found";
pub const CANNOT_DISCOVER: &str = "Cannot discover: server not running";
pub const DISCONNECTED: &str = "Disconnected";
pub const SWITCHED_TO_LINK: &str = "Switched to direct link mode";
pub const SWITCHED_TO_BROADCAST: &str = "Switched to broadcast mode";

pub const LINK_ENABLED: &str = "Direct link enabled";
pub const LINK_DISABLED: &str = "Direct link disabled";
pub const LINK_GROUP_OWNER: &str = "Connected as group owner";
pub const LINK_CLIENT: &str = "Connected as client";

pub fn trying_port(port: u16) -> String {
    format!("Trying port {port}...")
}

pub fn server_running(port: u16) -> String {
    format!("Server running on port {port}")
}

pub fn restricted_network() -> String {
    format!("Network restricted - {RESTRICTED_NETWORK_TOKEN}")
}

/// Summary shown when a discovery session ends.
pub fn discovery_summary(peer_count: usize) -> String {
    if peer_count > 0 {
        format!("Found {peer_count} peer(s)")
    } else {
        NO_PEERS_FOUND.to_string()
    }
}

pub fn unreachable_peer(name: &str) -> String {
    format!("Could not reach {name}")
}

pub fn link_discovery_failed(reason: impl std::fmt::Display) -> String {
    format!("Discovery failed: {reason}")
}

pub fn link_connecting(name: &str) -> String {
    format!("Connecting to {name}...")
}

pub fn link_error(reason: impl std::fmt::Display) -> String {
    format!("Connection error: {reason}")
}

pub fn is_restricted(status: &str) -> bool {
    status.contains(RESTRICTED_NETWORK_TOKEN)
}

/// Status text plus the discovering flag.
pub struct StatusBoard {
    text: watch::Sender<String>,
    discovering: watch::Sender<bool>,
}

impl StatusBoard {
    pub fn new(initial: &str) -> Self {
        let (text, _) = watch::channel(initial.to_string());
        let (discovering, _) = watch::channel(false);
        Self { text, discovering }
    }

    pub fn set(&self, status: impl Into<String>) {
        let status = status.into();
        debug!(%status, "status");
        self.text.send_replace(status);
    }

    pub fn get(&self) -> String {
        self.text.borrow().clone()
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.borrow()
    }

    /// Set the flag; returns the previous value.
    pub fn set_discovering(&self, on: bool) -> bool {
        self.discovering.send_replace(on)
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.text.subscribe()
    }

    pub fn subscribe_discovering(&self) -> watch::Receiver<bool> {
        self.discovering.subscribe()
    }
}
