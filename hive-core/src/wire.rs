//! Framing: discovery records are one JSON object per datagram; message records are
//! one JSON object per line.

use crate::identity::PeerId;
use crate::protocol::{Announcement, MessageEnvelope};

/// Largest announcement datagram we accept.
pub const MAX_DATAGRAM_LEN: usize = 2048;

/// Encode an announcement as a single datagram payload (no trailing delimiter).
pub fn encode_announcement(
    peer_id: &PeerId,
    display_name: &str,
    listen_port: u16,
) -> Result<Vec<u8>, EncodeError> {
    let ann = Announcement {
        peer_id: peer_id.clone(),
        display_name: display_name.to_string(),
        listen_port,
    };
    Ok(serde_json::to_vec(&ann)?)
}

/// Decode one datagram. Callers drop the packet on error.
pub fn decode_announcement(bytes: &[u8]) -> Result<Announcement, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DecodeError::TooLarge);
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode a message record as one newline-terminated line.
pub fn encode_message(envelope: &MessageEnvelope) -> Result<String, EncodeError> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (with or without its terminator). Callers skip the line on error.
pub fn decode_message(line: &str) -> Result<MessageEnvelope, DecodeError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}

/// Error encoding a record.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed wire record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty record")]
    Empty,
    #[error("record too large")]
    TooLarge,
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}
