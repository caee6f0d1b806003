//! Per-topic fan-out inside the broker hub.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber gets an independent receiver that buffers up to
//! `capacity` frames; a subscriber that falls further behind loses the
//! oldest frames instead of slowing the publisher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Statistics for monitoring topic health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Atomic topic stats, lock-free on the hot path.
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicTopicStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A connected subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub subscriber_id: Uuid,
    pub addr: SocketAddr,
}

/// All subscribers of one topic share one broadcast channel.
pub struct TopicGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    subscribers: Arc<RwLock<HashMap<Uuid, SubscriberInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicTopicStats>,
}

impl TopicGroup {
    /// Create a topic group with the given per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicTopicStats::new()),
        }
    }

    /// Add a subscriber and return its receiver.
    pub async fn add_subscriber(&self, info: SubscriberInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(info.subscriber_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, subscriber_id: &Uuid) -> Option<SubscriberInfo> {
        self.subscribers.write().await.remove(subscriber_id)
    }

    /// Broadcast pre-encoded bytes. Returns the number of receivers.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps topic names to broadcast groups.
pub struct TopicRegistry {
    topics: Arc<RwLock<HashMap<String, Arc<TopicGroup>>>>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group for a topic.
    pub async fn get_or_create(&self, topic: &str) -> Arc<TopicGroup> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(group) = topics.get(topic) {
                return group.clone();
            }
        }

        let mut topics = self.topics.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = topics.get(topic) {
            return group.clone();
        }
        let group = Arc::new(TopicGroup::new(self.default_capacity));
        topics.insert(topic.to_string(), group.clone());
        group
    }

    /// Existing group, without creating one.
    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    /// Remove a topic with no subscribers.
    pub async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.subscriber_count().await == 0 {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
