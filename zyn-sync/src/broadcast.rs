//! Notification fan-out between server connections.
//!
//! Uses one tokio broadcast channel for the whole server. Every connection
//! subscribes once and filters on its own: it skips fan-outs it originated
//! and fan-outs for nodes it does not have open.
//!
//! ```text
//! conn A ── edit node 7 ──► publish(A, F-INS) ──┬──► conn A (own, skipped)
//!                                               ├──► conn B (node 7 open, forwarded)
//!                                               └──► conn C (node 7 closed, skipped)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{NodeId, Notification};

/// One encoded notification on its way to the other connections.
#[derive(Debug)]
pub struct Fanout {
    pub origin: Uuid,
    pub node_id: NodeId,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Fan-outs lost by receivers that fell behind
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Server-wide notification channel.
pub struct NotificationHub {
    sender: broadcast::Sender<Arc<Fanout>>,
    peers: Arc<RwLock<HashMap<Uuid, SocketAddr>>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl NotificationHub {
    /// `capacity` fan-outs are buffered per receiver before the slowest
    /// ones start losing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            atomic_stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub async fn add_peer(&self, peer_id: Uuid, addr: SocketAddr) -> broadcast::Receiver<Arc<Fanout>> {
        self.peers.write().await.insert(peer_id, addr);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<SocketAddr> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode `notification` once and hand it to every subscriber.
    /// Returns the number of receivers, the originator included.
    pub fn publish(&self, origin: Uuid, notification: &Notification) -> usize {
        let node_id = match notification {
            Notification::Edit { node_id, .. } => *node_id,
            Notification::Disconnected { .. } => return 0,
        };
        let fanout = Arc::new(Fanout { origin, node_id, frame: notification.encode() });
        let count = self.sender.send(fanout).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record fan-outs a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }
}
