//! Per-file fan-out for the relay.
//!
//! Every file that has been opened gets one tokio broadcast channel. Each
//! connection that opened the file holds a receiver and skips envelopes it
//! sent itself, so an edit reaches the N-1 other members. A receiver that
//! falls more than `capacity` envelopes behind loses the oldest ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One already-encoded line and the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin: Uuid,
    pub line: String,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Counters updated without taking the member lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out group for one file.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: RwLock<HashSet<Uuid>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a connection and return its receiver. Envelopes sent before this
    /// call are not delivered to it.
    pub async fn join(&self, member: Uuid) -> broadcast::Receiver<Arc<Envelope>> {
        self.members.write().await.insert(member);
        self.sender.subscribe()
    }

    pub async fn leave(&self, member: &Uuid) -> bool {
        self.members.write().await.remove(member)
    }

    /// Send `line` to every receiver. Returns how many receivers exist,
    /// including the sender's own.
    pub fn broadcast(&self, origin: Uuid, line: impl Into<String>) -> usize {
        let envelope = Arc::new(Envelope {
            origin,
            line: line.into(),
        });
        let receivers = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        receivers
    }

    /// Record envelopes a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, member: &Uuid) -> bool {
        self.members.read().await.contains(member)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps file ids to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, file_id: &str) -> Arc<BroadcastGroup> {
        if let Some(room) = self.rooms.read().await.get(file_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(file_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, file_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(file_id).cloned()
    }

    /// Drop the room if nobody is in it.
    pub async fn remove_if_empty(&self, file_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(file_id) {
            Some(room) => room.member_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(file_id);
            log::debug!("Room {file_id} removed (empty)");
        }
        empty
    }

    /// Drop the room unconditionally, e.g. when its file is deleted.
    pub async fn remove(&self, file_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.write().await.remove(file_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_and_leave() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();

        let _rx = group.join(a).await;
        assert!(group.has_member(&a).await);
        assert_eq!(group.member_count().await, 1);

        assert!(group.leave(&a).await);
        assert!(!group.leave(&a).await);
        assert_eq!(group.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = group.join(a).await;
        let mut rx_b = group.join(b).await;

        assert_eq!(group.broadcast(a, "line\n"), 2);

        let seen_b = rx_b.recv().await.unwrap();
        assert_eq!(seen_b.origin, a);
        assert_eq!(seen_b.line, "line\n");
        // The sender receives its own envelope and is expected to skip it.
        assert_eq!(rx_a.recv().await.unwrap().origin, a);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let a = Uuid::new_v4();
        let mut rx = group.join(Uuid::new_v4()).await;
        for i in 0..5 {
            group.broadcast(a, format!("{i}"));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = RoomManager::new(8);
        let f1 = rooms.get_or_create("f1").await;
        let f2 = rooms.get_or_create("f2").await;
        let mut rx1 = f1.join(Uuid::new_v4()).await;
        let _rx2 = f2.join(Uuid::new_v4()).await;

        f2.broadcast(Uuid::new_v4(), "only f2");
        assert!(rx1.try_recv().is_err());
        assert_eq!(rooms.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let rooms = RoomManager::new(8);
        let first = rooms.get_or_create("f1").await;
        let second = rooms.get_or_create("f1").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let rooms = RoomManager::new(8);
        let room = rooms.get_or_create("f1").await;
        let member = Uuid::new_v4();
        let _rx = room.join(member).await;

        assert!(!rooms.remove_if_empty("f1").await);
        room.leave(&member).await;
        assert!(rooms.remove_if_empty("f1").await);
        assert!(rooms.get("f1").await.is_none());
    }
}
