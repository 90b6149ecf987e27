//! Messaging engine: TCP server bound by port fallback, one reader task per inbound
//! connection, and a lazily-filled outbound connection pool keyed by peer id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::NetConfig;
use crate::conversation::ConversationStore;
use crate::error::NetError;
use crate::identity::{LocalIdentity, PeerId};
use crate::protocol::{ChatMessage, PeerRecord};
use crate::registry::PresenceRegistry;
use crate::signal::{lock, Signal, Trigger};
use crate::status::{self, StatusBoard};
use crate::wire::{decode_message, encode_message};

/// Longest message line accepted before the connection is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// One slot per peer. The async mutex serialises connect-or-reuse and writes, so a peer
/// never gets two sockets and its log order matches the write order.
type Slot = Arc<tokio::sync::Mutex<Option<TcpStream>>>;

pub struct MessagingEngine {
    config: NetConfig,
    identity: LocalIdentity,
    registry: Arc<PresenceRegistry>,
    store: Arc<ConversationStore>,
    status: Arc<StatusBoard>,
    /// 0 while unbound.
    active_port: AtomicU16,
    pool: Mutex<HashMap<PeerId, Slot>>,
    /// Port that last worked for each peer; tried before the advertised one.
    last_good_port: Mutex<HashMap<PeerId, u16>>,
    shutdown: Trigger,
}

impl MessagingEngine {
    pub fn new(
        config: NetConfig,
        identity: LocalIdentity,
        registry: Arc<PresenceRegistry>,
        store: Arc<ConversationStore>,
        status: Arc<StatusBoard>,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            store,
            status,
            active_port: AtomicU16::new(0),
            pool: Mutex::new(HashMap::new()),
            last_good_port: Mutex::new(HashMap::new()),
            shutdown: Trigger::new(),
        }
    }

    /// Bind the first available configured candidate and start accepting.
    pub async fn start(self: &Arc<Self>) -> Result<u16, NetError> {
        let candidates = self.config.message_ports.clone();
        self.bind_listening_port(&candidates).await
    }

    /// Try `candidates` strictly in order; the first that binds becomes the active port
    /// and the accept loop starts on it. If none binds the engine stays unbound and the
    /// status reports a restricted network.
    pub async fn bind_listening_port(self: &Arc<Self>, candidates: &[u16]) -> Result<u16, NetError> {
        if self.shutdown.is_fired() {
            return Err(NetError::Shutdown);
        }
        if let Some(port) = self.active_port() {
            return Ok(port);
        }
        for &port in candidates {
            match bind_port(&self.config, port).await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    self.active_port.store(port, Ordering::SeqCst);
                    self.status.set(status::server_running(port));
                    info!(port, "message server listening");
                    let engine = self.clone();
                    tokio::spawn(async move { engine.accept_loop(listener).await });
                    return Ok(port);
                }
                Err(e) => {
                    warn!(port, "{e}");
                    self.status.set(status::trying_port(port));
                }
            }
        }
        error!(?candidates, "could not bind any message port");
        self.status.set(status::restricted_network());
        Err(NetError::Unbound)
    }

    /// Port the message server listens on, or `None` while unbound.
    pub fn active_port(&self) -> Option<u16> {
        match self.active_port.load(Ordering::SeqCst) {
            0 => None,
            p => Some(p),
        }
    }

    pub fn is_unbound(&self) -> bool {
        self.active_port().is_none()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop = self.shutdown.signal();
        loop {
            tokio::select! {
                _ = stop.fired() => break,
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        debug!(%addr, "inbound connection");
                        let store = self.store.clone();
                        let stop = self.shutdown.signal();
                        tokio::spawn(async move {
                            read_messages(stream, &store, addr, stop).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    /// Connect to `peer`: last port that worked (or the advertised one) first, then the
    /// remaining candidates, each bounded by the connect timeout.
    pub async fn connect(&self, peer: &PeerRecord) -> Result<TcpStream, NetError> {
        let preferred = lock(&self.last_good_port)
            .get(&peer.id)
            .copied()
            .unwrap_or(peer.port);
        let order = self.config.connect_order(preferred);
        let mut attempts = 0;
        for port in order {
            let Some(addr) = peer.socket_addr(port) else {
                break;
            };
            attempts += 1;
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    info!(peer = %peer.id, %addr, "connected");
                    lock(&self.last_good_port).insert(peer.id.clone(), port);
                    return Ok(stream);
                }
                Ok(Err(e)) => warn!(peer = %peer.id, port, "connect failed: {e}"),
                Err(_) => warn!(peer = %peer.id, port, "connect timed out"),
            }
        }
        Err(NetError::ConnectFailed {
            peer: peer.id.clone(),
            attempts,
        })
    }

    /// Send `text` to `peer_id`, reusing its pooled connection or opening one. On any
    /// failure the pooled connection is dropped so the next send reconnects, and nothing
    /// is appended to the log.
    pub async fn send(&self, peer_id: &PeerId, text: &str) -> Result<ChatMessage, NetError> {
        if self.shutdown.is_fired() {
            return Err(NetError::Shutdown);
        }
        let peer = self.registry.get(peer_id).ok_or_else(|| {
            warn!(peer = %peer_id, "send to unknown peer");
            NetError::UnknownPeer(peer_id.clone())
        })?;
        let slot = self.slot(peer_id);
        let mut conn = slot.lock().await;
        let mut stream = match conn.take() {
            Some(s) => s,
            None => match self.connect(&peer).await {
                Ok(s) => s,
                Err(e) => {
                    self.status.set(status::unreachable_peer(&peer.name));
                    return Err(e);
                }
            },
        };

        let message = ChatMessage::local(text, &self.identity.display_name, self.identity.id.clone());
        let line = encode_line(&message)?;
        let written = async {
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(peer = %peer_id, "send failed, dropping connection: {e}");
            self.status.set(status::unreachable_peer(&peer.name));
            return Err(NetError::SendFailed(e));
        }
        *conn = Some(stream);
        self.store.append(peer_id, message.clone());
        debug!(peer = %peer_id, id = %message.id, "message sent");
        Ok(message)
    }

    fn slot(&self, peer_id: &PeerId) -> Slot {
        lock(&self.pool).entry(peer_id.clone()).or_default().clone()
    }

    /// Number of peers with a pooled slot (open or not).
    pub fn pooled_peers(&self) -> usize {
        lock(&self.pool).len()
    }

    /// Stop accepting, end every connection handler and close pooled sockets. The engine
    /// reports no port afterwards and refuses to bind or send again.
    pub fn shutdown(&self) {
        self.shutdown.fire();
        self.active_port.store(0, Ordering::SeqCst);
        lock(&self.pool).clear();
        info!("messaging engine shut down");
    }
}

async fn bind_port(config: &NetConfig, port: u16) -> Result<TcpListener, NetError> {
    TcpListener::bind(SocketAddr::new(config.bind_addr, port))
        .await
        .map_err(|source| NetError::BindFailed { port, source })
}

/// Frame a local message for the wire.
pub(crate) fn encode_line(message: &ChatMessage) -> Result<String, NetError> {
    encode_message(&message.to_envelope())
        .map_err(|e| NetError::SendFailed(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

/// Read newline-framed message records until EOF, an I/O error or `stop`. Each decoded
/// record is delivered to the sender's log; bad lines are logged and skipped.
pub(crate) async fn read_messages<R>(reader: R, store: &ConversationStore, from: SocketAddr, mut stop: Signal)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 1);
        let read = tokio::select! {
            _ = stop.fired() => break,
            r = limited.read_until(b'\n', &mut buf) => r,
        };
        match read {
            Ok(0) => {
                debug!(%from, "peer closed connection");
                break;
            }
            Ok(_) if buf.len() > MAX_LINE_LEN => {
                warn!(%from, "line too long, closing connection");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                match decode_message(&line) {
                    Ok(env) => {
                        let sender = env.sender_id.clone();
                        debug!(%from, peer = %sender, "message received");
                        store.deliver(&sender, env.into());
                    }
                    Err(e) => warn!(%from, "dropping bad message line: {e}"),
                }
            }
            Err(e) => {
                debug!(%from, "connection error: {e}");
                break;
            }
        }
    }
}
