//! Conversation store: append-only per-peer message logs plus unread counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::identity::PeerId;
use crate::protocol::ChatMessage;

pub type MessageLog = Arc<Vec<ChatMessage>>;
pub type MessagesSnapshot = Arc<BTreeMap<PeerId, MessageLog>>;
pub type UnreadSnapshot = Arc<BTreeMap<PeerId, u32>>;

/// Logs are insertion-ordered and never reordered or trimmed. Readers get
/// copy-on-write snapshots.
pub struct ConversationStore {
    messages: watch::Sender<MessagesSnapshot>,
    unread: watch::Sender<UnreadSnapshot>,
}

impl ConversationStore {
    pub fn new() -> Self {
        let (messages, _) = watch::channel(Arc::new(BTreeMap::new()));
        let (unread, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self { messages, unread }
    }

    /// Append to `peer`'s log, creating it if absent.
    pub fn append(&self, peer: &PeerId, message: ChatMessage) {
        self.messages.send_modify(|all| {
            let log = Arc::make_mut(all).entry(peer.clone()).or_default();
            Arc::make_mut(log).push(message);
        });
    }

    pub fn increment_unread(&self, peer: &PeerId) {
        self.unread.send_modify(|counts| {
            *Arc::make_mut(counts).entry(peer.clone()).or_insert(0) += 1;
        });
    }

    /// Reset `peer`'s counter. The log is left alone.
    pub fn clear_unread(&self, peer: &PeerId) {
        self.unread.send_if_modified(|counts| {
            if !counts.contains_key(peer) {
                return false;
            }
            Arc::make_mut(counts).remove(peer);
            true
        });
    }

    /// Record a message received from `peer`: append and bump its unread count.
    pub fn deliver(&self, peer: &PeerId, message: ChatMessage) {
        self.append(peer, message);
        self.increment_unread(peer);
    }

    pub fn messages_for(&self, peer: &PeerId) -> MessageLog {
        self.messages.borrow().get(peer).cloned().unwrap_or_default()
    }

    pub fn unread_for(&self, peer: &PeerId) -> u32 {
        self.unread.borrow().get(peer).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MessagesSnapshot {
        self.messages.borrow().clone()
    }

    pub fn unread_snapshot(&self) -> UnreadSnapshot {
        self.unread.borrow().clone()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<MessagesSnapshot> {
        self.messages.subscribe()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<UnreadSnapshot> {
        self.unread.subscribe()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}
