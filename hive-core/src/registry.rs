//! Presence registry: the live table of known peers, keyed by peer id.
//!
//! The table lives in a `watch` channel as an `Arc<Vec<_>>`. Every mutation swaps in a
//! whole new collection, so readers holding a snapshot never see a half-applied update.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::identity::PeerId;
use crate::protocol::PeerRecord;

pub type PeerSnapshot = Arc<Vec<PeerRecord>>;

pub struct PresenceRegistry {
    peers: watch::Sender<PeerSnapshot>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        let (peers, _) = watch::channel(Arc::new(Vec::new()));
        Self { peers }
    }

    /// Replace the record with the same id, else append. Returns true if the peer is new.
    /// `last_seen_at` never moves backwards.
    pub fn upsert(&self, record: PeerRecord) -> bool {
        let mut is_new = false;
        self.peers.send_modify(|peers| {
            let list = Arc::make_mut(peers);
            match list.iter_mut().find(|p| p.id == record.id) {
                Some(existing) => {
                    let last_seen_at = existing.last_seen_at.max(record.last_seen_at);
                    *existing = PeerRecord {
                        last_seen_at,
                        ..record
                    };
                }
                None => {
                    list.push(record);
                    is_new = true;
                }
            }
        });
        is_new
    }

    /// Drop every peer with `now - last_seen_at >= threshold`. Returns how many were removed.
    pub fn evict_stale(&self, now: u64, threshold: Duration) -> usize {
        let threshold = threshold.as_millis() as u64;
        let mut removed = 0;
        self.peers.send_if_modified(|peers| {
            let before = peers.len();
            let kept: Vec<PeerRecord> = peers
                .iter()
                .filter(|p| now.saturating_sub(p.last_seen_at) < threshold)
                .cloned()
                .collect();
            removed = before - kept.len();
            if removed > 0 {
                *peers = Arc::new(kept);
                true
            } else {
                false
            }
        });
        removed
    }

    /// Current peers in insertion order.
    pub fn snapshot(&self) -> PeerSnapshot {
        self.peers.borrow().clone()
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.borrow().iter().find(|p| &p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.send_if_modified(|peers| {
            if peers.is_empty() {
                return false;
            }
            *peers = Arc::new(Vec::new());
            true
        });
    }

    /// Swap in a complete peer list (used by transports that learn peers in batches).
    pub fn replace_all(&self, records: Vec<PeerRecord>) {
        self.peers.send_replace(Arc::new(records));
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerSnapshot> {
        self.peers.subscribe()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
