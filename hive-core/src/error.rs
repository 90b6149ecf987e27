//! Connection-level errors. Per-packet and per-line errors never get this far; see
//! `wire::DecodeError`.

use crate::identity::PeerId;
use crate::link::LinkError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Discovery requested before a listening port exists.
    #[error("cannot discover without a port to advertise")]
    NotReady,
    #[error("could not bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    /// Every candidate listening port failed.
    #[error("no candidate port could be bound")]
    Unbound,
    #[error("could not connect to {peer} on any of {attempts} port(s)")]
    ConnectFailed { peer: PeerId, attempts: usize },
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("no active link connection")]
    NotConnected,
    #[error("network core not initialized")]
    NotInitialized,
    /// The engine or selector was shut down; it accepts no further commands.
    #[error("network core shut down")]
    Shutdown,
    #[error("no direct link capability available")]
    LinkUnavailable,
    #[error("link layer: {0}")]
    Link(#[from] LinkError),
}
