//! Serverless LAN chat core.
//! Peers find each other by UDP broadcast and talk over direct TCP connections; a
//! platform direct-link group is available as a fallback transport.

pub mod broadcast;
pub mod config;
pub mod conversation;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod link;
pub mod messaging;
pub mod protocol;
pub mod registry;
pub mod status;
pub mod transport;
pub mod wire;

mod signal;

pub use broadcast::BroadcastTransport;
pub use config::NetConfig;
pub use conversation::ConversationStore;
pub use error::NetError;
pub use identity::{LocalIdentity, PeerId};
pub use link::{DirectLinkTransport, GroupInfo, LinkError, LinkEvent, LinkLayer, LinkPeer};
pub use protocol::{Announcement, ChatMessage, MessageEnvelope, PeerRecord};
pub use registry::PresenceRegistry;
pub use status::RESTRICTED_NETWORK_TOKEN;
pub use transport::{NetworkMode, TransportSelector, TransportState};
pub use wire::{decode_announcement, decode_message, encode_announcement, encode_message, DecodeError, EncodeError};
