//! Transport selector: one facade over the primary broadcast transport and the optional
//! direct-link transport, with a single set of observable state channels that always
//! mirror whichever transport is active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastTransport;
use crate::config::NetConfig;
use crate::conversation::{ConversationStore, MessageLog, MessagesSnapshot, UnreadSnapshot};
use crate::error::NetError;
use crate::identity::{LocalIdentity, PeerId};
use crate::link::{DirectLinkTransport, LinkLayer};
use crate::protocol::ChatMessage;
use crate::registry::{PeerSnapshot, PresenceRegistry};
use crate::signal::lock;
use crate::status::{self, StatusBoard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// LAN broadcast discovery with direct TCP messaging.
    #[default]
    Primary,
    /// Platform direct-link group.
    Secondary,
}

/// Read side of the selector's observable state. Each receiver yields snapshots.
#[derive(Clone)]
pub struct TransportState {
    pub peers: watch::Receiver<PeerSnapshot>,
    pub is_discovering: watch::Receiver<bool>,
    pub connection_status: watch::Receiver<String>,
    pub messages: watch::Receiver<MessagesSnapshot>,
    pub unread: watch::Receiver<UnreadSnapshot>,
    pub mode: watch::Receiver<NetworkMode>,
}

/// The selector's own state channels. Only the forwarder of the current generation
/// writes to them.
struct StateHub {
    peers: watch::Sender<PeerSnapshot>,
    discovering: watch::Sender<bool>,
    status: watch::Sender<String>,
    messages: watch::Sender<MessagesSnapshot>,
    unread: watch::Sender<UnreadSnapshot>,
    mode: watch::Sender<NetworkMode>,
    generation: Mutex<u64>,
}

impl StateHub {
    fn new() -> Self {
        Self {
            peers: watch::channel(PeerSnapshot::default()).0,
            discovering: watch::channel(false).0,
            status: watch::channel(status::INITIALIZING.to_string()).0,
            messages: watch::channel(MessagesSnapshot::default()).0,
            unread: watch::channel(UnreadSnapshot::default()).0,
            mode: watch::channel(NetworkMode::Primary).0,
            generation: Mutex::new(0),
        }
    }

    fn subscribe(&self) -> TransportState {
        TransportState {
            peers: self.peers.subscribe(),
            is_discovering: self.discovering.subscribe(),
            connection_status: self.status.subscribe(),
            messages: self.messages.subscribe(),
            unread: self.unread.subscribe(),
            mode: self.mode.subscribe(),
        }
    }
}

/// Receivers on the active transport's state.
struct Sources {
    peers: watch::Receiver<PeerSnapshot>,
    discovering: watch::Receiver<bool>,
    status: watch::Receiver<String>,
    messages: watch::Receiver<MessagesSnapshot>,
    unread: watch::Receiver<UnreadSnapshot>,
}

impl Sources {
    fn of(registry: &PresenceRegistry, store: &ConversationStore, status: &StatusBoard) -> Self {
        Self {
            peers: registry.subscribe(),
            discovering: status.subscribe_discovering(),
            status: status.subscribe(),
            messages: store.subscribe_messages(),
            unread: store.subscribe_unread(),
        }
    }

    fn copy_all(&mut self, hub: &StateHub) {
        hub.peers.send_replace(self.peers.borrow_and_update().clone());
        hub.discovering.send_replace(*self.discovering.borrow_and_update());
        hub.status.send_replace(self.status.borrow_and_update().clone());
        hub.messages.send_replace(self.messages.borrow_and_update().clone());
        hub.unread.send_replace(self.unread.borrow_and_update().clone());
    }
}

enum Changed {
    Peers,
    Discovering,
    Status,
    Messages,
    Unread,
}

async fn forward(hub: Arc<StateHub>, generation: u64, mut src: Sources) {
    loop {
        let changed = tokio::select! {
            Ok(()) = src.peers.changed() => Changed::Peers,
            Ok(()) = src.discovering.changed() => Changed::Discovering,
            Ok(()) = src.status.changed() => Changed::Status,
            Ok(()) = src.messages.changed() => Changed::Messages,
            Ok(()) = src.unread.changed() => Changed::Unread,
            else => break,
        };
        let current = lock(&hub.generation);
        if *current != generation {
            break;
        }
        match changed {
            Changed::Peers => {
                hub.peers.send_replace(src.peers.borrow_and_update().clone());
            }
            Changed::Discovering => {
                hub.discovering.send_replace(*src.discovering.borrow_and_update());
            }
            Changed::Status => {
                hub.status.send_replace(src.status.borrow_and_update().clone());
            }
            Changed::Messages => {
                hub.messages.send_replace(src.messages.borrow_and_update().clone());
            }
            Changed::Unread => {
                hub.unread.send_replace(src.unread.borrow_and_update().clone());
            }
        }
    }
    debug!(generation, "state forwarder stopped");
}

pub struct TransportSelector {
    config: NetConfig,
    link_layer: Option<Arc<dyn LinkLayer>>,
    primary: OnceCell<Arc<BroadcastTransport>>,
    secondary: Mutex<Option<Arc<DirectLinkTransport>>>,
    hub: Arc<StateHub>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    /// Serialises mode switches.
    switching: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl TransportSelector {
    /// `link_layer` is the platform's direct-link capability, if it has one.
    pub fn new(config: NetConfig, link_layer: Option<Arc<dyn LinkLayer>>) -> Self {
        Self {
            config,
            link_layer,
            primary: OnceCell::new(),
            secondary: Mutex::new(None),
            hub: Arc::new(StateHub::new()),
            forwarder: Mutex::new(None),
            switching: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the primary transport under the given identity. Later calls are no-ops.
    pub async fn initialize(&self, display_name: &str, peer_id: PeerId) {
        if self.is_closed() {
            warn!("initialize after shutdown ignored");
            return;
        }
        if self.primary.initialized() {
            info!("network core already initialized");
            return;
        }
        let identity = LocalIdentity::new(peer_id, display_name);
        let config = self.config.clone();
        let mut created = false;
        let primary = self
            .primary
            .get_or_init(|| {
                created = true;
                BroadcastTransport::start(config, identity)
            })
            .await;
        if !created {
            return;
        }
        self.point_at(Sources::of(primary.registry(), primary.store(), primary.status_board()));
        info!(peer = %primary.identity().id, "network core initialized");
    }

    /// The primary transport while the selector is usable.
    fn primary(&self) -> Result<&Arc<BroadcastTransport>, NetError> {
        if self.is_closed() {
            return Err(NetError::Shutdown);
        }
        self.primary.get().ok_or(NetError::NotInitialized)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn secondary(&self) -> Option<Arc<DirectLinkTransport>> {
        if self.is_closed() {
            return None;
        }
        lock(&self.secondary).clone()
    }

    /// Route the hub to a new transport. Values from the previous transport can no
    /// longer be published once this returns.
    fn point_at(&self, mut sources: Sources) {
        let mut forwarder = lock(&self.forwarder);
        if let Some(old) = forwarder.take() {
            old.abort();
        }
        let generation = {
            let mut current = lock(&self.hub.generation);
            *current += 1;
            sources.copy_all(&self.hub);
            *current
        };
        *forwarder = Some(tokio::spawn(forward(self.hub.clone(), generation, sources)));
        debug!(generation, "state forwarding re-pointed");
    }

    pub fn start_discovery(&self) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Shutdown);
        }
        match self.mode() {
            NetworkMode::Primary => self.primary()?.start_discovery(),
            NetworkMode::Secondary => match self.secondary() {
                Some(link) => link.start_discovery(),
                None => Err(NetError::LinkUnavailable),
            },
        }
    }

    pub fn stop_discovery(&self) {
        match self.mode() {
            NetworkMode::Primary => {
                if let Ok(primary) = self.primary() {
                    primary.stop_discovery();
                }
            }
            NetworkMode::Secondary => {
                if let Some(link) = self.secondary() {
                    link.stop_discovery();
                }
            }
        }
    }

    /// Send over the active transport. The message is in the log once this returns Ok.
    pub async fn send_message(&self, peer: &PeerId, text: &str) -> Result<ChatMessage, NetError> {
        if self.is_closed() {
            return Err(NetError::Shutdown);
        }
        match self.mode() {
            NetworkMode::Primary => self.primary()?.send_message(peer, text).await,
            NetworkMode::Secondary => match self.secondary() {
                Some(link) => link.send(peer, text).await,
                None => Err(NetError::NotConnected),
            },
        }
    }

    pub fn clear_unread(&self, peer: &PeerId) {
        match self.mode() {
            NetworkMode::Primary => {
                if let Ok(primary) = self.primary() {
                    primary.clear_unread(peer);
                }
            }
            NetworkMode::Secondary => {
                if let Some(link) = self.secondary() {
                    link.store().clear_unread(peer);
                }
            }
        }
    }

    /// Make `mode` the active transport. Switching to the current mode does nothing.
    pub async fn switch_transport(&self, mode: NetworkMode) -> Result<(), NetError> {
        let _guard = self.switching.lock().await;
        let primary = self.primary()?;
        if self.mode() == mode {
            debug!(?mode, "already in requested mode");
            return Ok(());
        }
        match mode {
            NetworkMode::Secondary => {
                let Some(layer) = self.link_layer.clone() else {
                    warn!("direct link requested but no link layer available");
                    return Err(NetError::LinkUnavailable);
                };
                primary.stop_discovery();
                let link = match self.secondary() {
                    Some(link) => link,
                    None => {
                        let link = DirectLinkTransport::start(self.config.clone(), primary.identity().clone(), layer)?;
                        *lock(&self.secondary) = Some(link.clone());
                        link
                    }
                };
                link.status_board().set(status::SWITCHED_TO_LINK);
                self.point_at(Sources::of(link.registry(), link.store(), link.status_board()));
            }
            NetworkMode::Primary => {
                let link = lock(&self.secondary).take();
                if let Some(link) = link {
                    link.teardown().await;
                }
                primary.clear_peers();
                if primary.is_unbound() {
                    primary.rebind().await;
                } else {
                    primary.status_board().set(status::SWITCHED_TO_BROADCAST);
                }
                self.point_at(Sources::of(primary.registry(), primary.store(), primary.status_board()));
            }
        }
        self.hub.mode.send_replace(mode);
        info!(?mode, "transport switched");
        Ok(())
    }

    /// Ask the direct-link transport to form a group with `device_address`.
    pub fn connect_direct_peer(&self, device_address: &str) -> Result<(), NetError> {
        if self.is_closed() {
            return Err(NetError::Shutdown);
        }
        match self.secondary() {
            Some(link) if self.mode() == NetworkMode::Secondary => link.connect_to_peer(device_address),
            _ => Err(NetError::LinkUnavailable),
        }
    }

    pub async fn disconnect_direct(&self) {
        if let Some(link) = self.secondary() {
            link.disconnect().await;
        }
    }

    /// Tear down every transport and stop forwarding. Idempotent; every command fails
    /// with `Shutdown` or does nothing afterwards.
    pub async fn shutdown(&self) {
        let _guard = self.switching.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = lock(&self.secondary).take();
        if let Some(link) = link {
            link.teardown().await;
        }
        if let Some(primary) = self.primary.get() {
            primary.shutdown();
        }
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
        info!("network core shut down");
    }

    pub fn subscribe(&self) -> TransportState {
        self.hub.subscribe()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<NetworkMode> {
        self.hub.mode.subscribe()
    }

    pub fn peers(&self) -> PeerSnapshot {
        self.hub.peers.borrow().clone()
    }

    pub fn messages_for(&self, peer: &PeerId) -> MessageLog {
        self.hub.messages.borrow().get(peer).cloned().unwrap_or_default()
    }

    pub fn unread_for(&self, peer: &PeerId) -> u32 {
        self.hub.unread.borrow().get(peer).copied().unwrap_or(0)
    }

    pub fn status(&self) -> String {
        self.hub.status.borrow().clone()
    }

    pub fn is_discovering(&self) -> bool {
        *self.hub.discovering.borrow()
    }

    pub fn mode(&self) -> NetworkMode {
        *self.hub.mode.borrow()
    }

    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.primary.get().map(|p| p.identity().id.clone())
    }

    /// True while in primary mode without a listening port; the cue to offer the
    /// direct-link fallback.
    pub fn is_network_restricted(&self) -> bool {
        self.mode() == NetworkMode::Primary && self.primary.get().is_some_and(|p| p.is_unbound())
    }

    /// The primary transport, once initialized.
    pub fn broadcast(&self) -> Option<&Arc<BroadcastTransport>> {
        self.primary.get()
    }
}
