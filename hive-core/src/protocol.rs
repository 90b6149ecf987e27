//! HiveChat protocol: wire records and the in-memory records built from them.

use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::{new_message_id, PeerId};

/// Discovery datagram: who is announcing and where its message server listens.
/// Encoding is JSON, one record per UDP datagram (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: PeerId,
    pub display_name: String,
    pub listen_port: u16,
}

/// Message stream record: one JSON object per line on a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: String,
    pub text: String,
    pub sender_name: String,
    pub sender_id: PeerId,
    pub timestamp_ms: u64,
}

/// A known peer. Unique by `id` within a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
    /// IP text, or empty for peers reached over a non-IP link.
    pub address: String,
    pub port: u16,
    /// Wall-clock ms of the last announcement seen from this peer.
    pub last_seen_at: u64,
}

impl PeerRecord {
    /// Build a record from a decoded announcement and the datagram's source address.
    pub fn from_announcement(ann: &Announcement, from: IpAddr, now: u64) -> Self {
        Self {
            id: ann.peer_id.clone(),
            name: ann.display_name.clone(),
            address: from.to_string(),
            port: ann.listen_port,
            last_seen_at: now,
        }
    }

    /// Socket address for `port` on this peer's IP, if it has one.
    pub fn socket_addr(&self, port: u16) -> Option<SocketAddr> {
        let ip: IpAddr = self.address.parse().ok()?;
        Some(SocketAddr::new(ip, port))
    }
}

/// A chat message in a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub sender_name: String,
    pub sender_id: PeerId,
    pub timestamp_ms: u64,
    /// True if authored by this process.
    pub is_local: bool,
}

impl ChatMessage {
    /// New locally-authored message with a fresh id and the current time.
    pub fn local(text: impl Into<String>, sender_name: impl Into<String>, sender_id: PeerId) -> Self {
        Self {
            id: new_message_id(),
            text: text.into(),
            sender_name: sender_name.into(),
            sender_id,
            timestamp_ms: now_ms(),
            is_local: true,
        }
    }

    pub fn to_envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.id.clone(),
            text: self.text.clone(),
            sender_name: self.sender_name.clone(),
            sender_id: self.sender_id.clone(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

impl From<MessageEnvelope> for ChatMessage {
    /// Received envelopes are never local.
    fn from(env: MessageEnvelope) -> Self {
        Self {
            id: env.message_id,
            text: env.text,
            sender_name: env.sender_name,
            sender_id: env.sender_id,
            timestamp_ms: env.timestamp_ms,
            is_local: false,
        }
    }
}

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
