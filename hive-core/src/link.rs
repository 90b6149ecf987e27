//! Secondary transport over a platform direct-link group (peer-to-peer Wi-Fi style).
//!
//! Group formation belongs to the platform and is reached through [`LinkLayer`]. Once a
//! group exists, messages travel over a single TCP socket between the group owner and
//! the client, framed exactly like the primary transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::conversation::ConversationStore;
use crate::error::NetError;
use crate::identity::{LocalIdentity, PeerId};
use crate::messaging::{encode_line, read_messages};
use crate::protocol::{now_ms, ChatMessage, PeerRecord};
use crate::registry::PresenceRegistry;
use crate::signal::{lock, Signal, Trigger};
use crate::status::{self, StatusBoard};

/// Failure reported synchronously by the platform link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("direct link not supported")]
    Unsupported,
    #[error("link layer busy")]
    Busy,
    #[error("internal link layer error")]
    Internal,
    #[error("permission denied")]
    PermissionDenied,
    #[error("link layer error code {0}")]
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPeer {
    pub device_address: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupInfo {
    pub is_group_owner: bool,
    pub group_owner_addr: Option<IpAddr>,
}

/// Asynchronous outcomes of link-layer requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged { enabled: bool },
    PeersChanged(Vec<LinkPeer>),
    Connected(GroupInfo),
    Disconnected,
}

/// Platform group-formation capability. Calls only start operations; results arrive as
/// [`LinkEvent`]s on the sender given to `register`.
pub trait LinkLayer: Send + Sync {
    fn register(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), LinkError>;
    fn unregister(&self) -> Result<(), LinkError>;
    fn start_peer_discovery(&self) -> Result<(), LinkError>;
    fn stop_peer_discovery(&self) -> Result<(), LinkError>;
    fn connect(&self, device_address: &str) -> Result<(), LinkError>;
    fn remove_group(&self) -> Result<(), LinkError>;
}

pub struct DirectLinkTransport {
    config: NetConfig,
    identity: LocalIdentity,
    layer: Arc<dyn LinkLayer>,
    registry: Arc<PresenceRegistry>,
    store: Arc<ConversationStore>,
    status: Arc<StatusBoard>,
    /// Write side of the active link socket. Newest connection wins.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Cancels the accept loop and readers of the current group.
    session: Mutex<Option<Trigger>>,
    shutdown: Trigger,
}

impl DirectLinkTransport {
    /// Register with the link layer and start handling its events.
    pub fn start(
        config: NetConfig,
        identity: LocalIdentity,
        layer: Arc<dyn LinkLayer>,
    ) -> Result<Arc<Self>, NetError> {
        let (tx, rx) = mpsc::unbounded_channel();
        layer.register(tx)?;
        let transport = Arc::new(Self {
            config,
            identity,
            layer,
            registry: Arc::new(PresenceRegistry::new()),
            store: Arc::new(ConversationStore::new()),
            status: Arc::new(StatusBoard::new(status::INITIALIZING)),
            writer: tokio::sync::Mutex::new(None),
            session: Mutex::new(None),
            shutdown: Trigger::new(),
        });
        let t = transport.clone();
        tokio::spawn(async move { t.event_loop(rx).await });
        info!("direct link transport started");
        Ok(transport)
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let mut stop = self.shutdown.signal();
        loop {
            let event = tokio::select! {
                _ = stop.fired() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
        debug!("link event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged { enabled } => {
                info!(enabled, "direct link state changed");
                self.status
                    .set(if enabled { status::LINK_ENABLED } else { status::LINK_DISABLED });
            }
            LinkEvent::PeersChanged(peers) => {
                let now = now_ms();
                let records = peers
                    .into_iter()
                    .map(|p| PeerRecord {
                        id: PeerId::new(p.device_address),
                        name: p.device_name,
                        address: String::new(),
                        port: self.config.link_port,
                        last_seen_at: now,
                    })
                    .collect::<Vec<_>>();
                debug!(count = records.len(), "link peers changed");
                self.registry.replace_all(records);
            }
            LinkEvent::Connected(group) => self.on_connected(group).await,
            LinkEvent::Disconnected => {
                info!("link group disconnected");
                self.close_link().await;
                self.status.set(status::DISCONNECTED);
            }
        }
    }

    async fn on_connected(self: &Arc<Self>, group: GroupInfo) {
        self.close_link().await;
        let session = Trigger::new();
        let signal = session.signal();
        *lock(&self.session) = Some(session);

        if group.is_group_owner {
            self.status.set(status::LINK_GROUP_OWNER);
            let addr = SocketAddr::new(self.config.bind_addr, self.config.link_port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "link server listening");
                    let t = self.clone();
                    tokio::spawn(async move { t.accept_loop(listener, signal).await });
                }
                Err(e) => {
                    warn!(%addr, "link server bind failed: {e}");
                    self.status.set(status::link_error(e));
                }
            }
            return;
        }

        self.status.set(status::LINK_CLIENT);
        let Some(owner) = group.group_owner_addr else {
            warn!("joined group without a group owner address");
            self.status.set(status::link_error("group owner address unknown"));
            return;
        };
        let addr = SocketAddr::new(owner, self.config.link_port);
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!(%addr, "link connected");
                self.attach(stream, addr, signal).await;
            }
            Ok(Err(e)) => {
                warn!(%addr, "link connect failed: {e}");
                self.status.set(status::link_error(e));
            }
            Err(_) => {
                warn!(%addr, "link connect timed out");
                self.status.set(status::link_error("connection timed out"));
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut stop: Signal) {
        loop {
            tokio::select! {
                _ = stop.fired() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        info!(%addr, "link client connected");
                        self.attach(stream, addr, stop.clone()).await;
                    }
                    Err(e) => {
                        warn!("link accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("link accept loop stopped");
    }

    async fn attach(&self, stream: TcpStream, from: SocketAddr, stop: Signal) {
        let (read, write) = stream.into_split();
        let store = self.store.clone();
        tokio::spawn(async move { read_messages(read, &store, from, stop).await });
        *self.writer.lock().await = Some(write);
    }

    async fn close_link(&self) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.fire();
        }
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Ask the link layer to scan for devices.
    pub fn start_discovery(&self) -> Result<(), NetError> {
        self.status.set_discovering(true);
        self.status.set(status::DISCOVERING);
        if let Err(e) = self.layer.start_peer_discovery() {
            warn!("link discovery failed: {e}");
            self.status.set_discovering(false);
            self.status.set(status::link_discovery_failed(e));
            return Err(e.into());
        }
        Ok(())
    }

    pub fn stop_discovery(&self) {
        if let Err(e) = self.layer.stop_peer_discovery() {
            debug!("stop link discovery: {e}");
        }
        if self.status.set_discovering(false) {
            self.status.set(status::discovery_summary(self.registry.len()));
        }
    }

    /// Request a group with the device at `device_address`.
    pub fn connect_to_peer(&self, device_address: &str) -> Result<(), NetError> {
        let id = PeerId::new(device_address);
        let peer = self
            .registry
            .get(&id)
            .ok_or_else(|| NetError::UnknownPeer(id.clone()))?;
        self.status.set(status::link_connecting(&peer.name));
        self.layer.connect(device_address).map_err(|e| {
            warn!(device = device_address, "link connect request failed: {e}");
            self.status.set(status::link_error(e));
            NetError::from(e)
        })
    }

    /// Send over the active link socket. The link is a single pipe, so `peer_id` only
    /// selects which log records the message.
    pub async fn send(&self, peer_id: &PeerId, text: &str) -> Result<ChatMessage, NetError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            warn!(peer = %peer_id, "send without an active link");
            return Err(NetError::NotConnected);
        };
        let message = ChatMessage::local(text, &self.identity.display_name, self.identity.id.clone());
        let line = encode_line(&message)?;
        let written = async {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(peer = %peer_id, "link send failed, dropping link: {e}");
            *writer = None;
            return Err(NetError::SendFailed(e));
        }
        drop(writer);
        self.store.append(peer_id, message.clone());
        Ok(message)
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Leave the group and close the link socket.
    pub async fn disconnect(&self) {
        if let Err(e) = self.layer.remove_group() {
            debug!("remove group: {e}");
        }
        self.close_link().await;
        self.status.set(status::DISCONNECTED);
    }

    /// Stop discovery, leave the group, unregister and end every task.
    pub async fn teardown(&self) {
        self.stop_discovery();
        self.disconnect().await;
        if let Err(e) = self.layer.unregister() {
            debug!("unregister link layer: {e}");
        }
        self.shutdown.fire();
        info!("direct link transport torn down");
    }

    pub(crate) fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub(crate) fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub(crate) fn status_board(&self) -> &Arc<StatusBoard> {
        &self.status
    }
}
