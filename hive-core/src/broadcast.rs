//! Primary transport: LAN broadcast discovery plus direct TCP messaging.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::NetConfig;
use crate::conversation::ConversationStore;
use crate::discovery::DiscoveryEngine;
use crate::error::NetError;
use crate::identity::{LocalIdentity, PeerId};
use crate::messaging::MessagingEngine;
use crate::protocol::ChatMessage;
use crate::registry::PresenceRegistry;
use crate::status::{self, StatusBoard};

pub struct BroadcastTransport {
    identity: LocalIdentity,
    registry: Arc<PresenceRegistry>,
    store: Arc<ConversationStore>,
    status: Arc<StatusBoard>,
    messaging: Arc<MessagingEngine>,
    discovery: Arc<DiscoveryEngine>,
}

impl BroadcastTransport {
    /// Build the engines, run the port search and start the staleness sweep. Ending up
    /// unbound is not an error: the transport still exists and reports a restricted
    /// network until `rebind` succeeds.
    pub async fn start(config: NetConfig, identity: LocalIdentity) -> Arc<Self> {
        let registry = Arc::new(PresenceRegistry::new());
        let store = Arc::new(ConversationStore::new());
        let status = Arc::new(StatusBoard::new(status::INITIALIZING));
        let messaging = Arc::new(MessagingEngine::new(
            config.clone(),
            identity.clone(),
            registry.clone(),
            store.clone(),
            status.clone(),
        ));
        let discovery = Arc::new(DiscoveryEngine::new(
            config,
            identity.clone(),
            registry.clone(),
            status.clone(),
            messaging.clone(),
        ));
        let transport = Arc::new(Self {
            identity,
            registry,
            store,
            status,
            messaging,
            discovery,
        });
        transport.rebind().await;
        transport.discovery.spawn_stale_sweep();
        info!(peer = %transport.identity.id, name = %transport.identity.display_name, "broadcast transport started");
        transport
    }

    /// Run the port search again if no port is bound. Returns the active port.
    pub async fn rebind(&self) -> Option<u16> {
        match self.messaging.start().await {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("message server unavailable: {e}");
                None
            }
        }
    }

    pub fn start_discovery(&self) -> Result<(), NetError> {
        self.discovery.start()
    }

    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }

    pub async fn send_message(&self, peer: &PeerId, text: &str) -> Result<ChatMessage, NetError> {
        self.messaging.send(peer, text).await
    }

    pub fn clear_unread(&self, peer: &PeerId) {
        self.store.clear_unread(peer);
    }

    /// Forget every known peer. Conversations are kept.
    pub fn clear_peers(&self) {
        self.registry.clear();
    }

    pub fn is_unbound(&self) -> bool {
        self.messaging.is_unbound()
    }

    pub fn active_port(&self) -> Option<u16> {
        self.messaging.active_port()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn shutdown(&self) {
        self.discovery.shutdown();
        self.messaging.shutdown();
        info!("broadcast transport shut down");
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub(crate) fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub(crate) fn status_board(&self) -> &Arc<StatusBoard> {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_config() -> NetConfig {
        NetConfig {
            message_ports: vec![0],
            ..NetConfig::default()
        }
    }

    #[tokio::test]
    async fn start_binds_and_reports_server_running() {
        let t = BroadcastTransport::start(loopback_config(), LocalIdentity::new(PeerId::generate(), "A")).await;
        let port = t.active_port().unwrap();
        assert_eq!(t.status.get(), status::server_running(port));
        assert!(!t.is_unbound());
        t.shutdown();
    }

    #[tokio::test]
    async fn unbound_transport_still_starts() {
        let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let config = NetConfig {
            message_ports: vec![port],
            ..NetConfig::default()
        };
        let t = BroadcastTransport::start(config, LocalIdentity::new(PeerId::generate(), "A")).await;
        assert!(t.is_unbound());
        assert!(status::is_restricted(&t.status.get()));
        assert!(matches!(t.start_discovery(), Err(NetError::NotReady)));

        drop(held);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(t.rebind().await, Some(port));
        assert!(!t.is_unbound());
        t.shutdown();
    }

    #[tokio::test]
    async fn clear_peers_keeps_conversations() {
        let t = BroadcastTransport::start(loopback_config(), LocalIdentity::new(PeerId::generate(), "A")).await;
        let bob = PeerId::new("bob");
        t.store.deliver(&bob, ChatMessage::local("hi", "Bob", bob.clone()));
        t.registry.upsert(crate::protocol::PeerRecord {
            id: bob.clone(),
            name: "Bob".into(),
            address: "127.0.0.1".into(),
            port: 1,
            last_seen_at: crate::protocol::now_ms(),
        });
        t.clear_peers();
        assert!(t.registry.is_empty());
        assert_eq!(t.store.messages_for(&bob).len(), 1);
        t.clear_unread(&bob);
        assert_eq!(t.store.unread_for(&bob), 0);
        t.shutdown();
    }
}
