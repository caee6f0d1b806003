//! Live Update Fan-out: broker topic → every live connection of the owner.
//!
//! Each live connection owns a bounded outbound queue. Delivery uses
//! `try_send`: a connection whose queue is full or closed is dropped from the
//! registry (its socket then closes) so one slow client never stalls the
//! subscriber loop. Events are delivered in the order the subscriber
//! receives them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::broker::{subscribe_loop, Backoff, Subscription};
use crate::protocol::{ChangeSigner, LiveMessage, ProtocolError};

pub type ConnectionId = u64;

struct LiveConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Live connections grouped by user.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Vec<LiveConnection>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection for `user` and return its outbound queue.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<Arc<String>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push(LiveConnection { id, tx });
        (id, rx)
    }

    pub async fn unregister(&self, user_id: Uuid, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(list) = connections.get_mut(&user_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|c| c.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            connections.remove(&user_id);
        }
        removed
    }

    /// Push `message` to every connection of `user_id`.
    pub async fn deliver(&self, user_id: Uuid, message: Arc<String>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut connections = self.connections.write().await;
        let Some(list) = connections.get_mut(&user_id) else {
            return report;
        };

        list.retain(|conn| match conn.tx.try_send(message.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Dropping live connection {} of {user_id}: outbound queue full", conn.id);
                report.dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Live connection {} of {user_id} already closed", conn.id);
                report.dropped += 1;
                false
            }
        });
        if list.is_empty() {
            connections.remove(&user_id);
        }
        report
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.connections
            .read()
            .await
            .get(&user_id)
            .map_or(0, Vec::len)
    }

    pub async fn total_connections(&self) -> usize {
        self.connections.read().await.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub received: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub dropped_connections: u64,
}

/// Verifies relay envelopes and routes them to the owner's connections.
pub struct LiveFanout {
    registry: Arc<ConnectionRegistry>,
    signer: ChangeSigner,
    received: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    dropped_connections: AtomicU64,
}

impl LiveFanout {
    pub fn new(registry: Arc<ConnectionRegistry>, signer: ChangeSigner) -> Self {
        Self {
            registry,
            signer,
            received: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_connections: AtomicU64::new(0),
        }
    }

    /// Handle one broker payload. Forged or malformed envelopes are rejected.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<DeliveryReport, ProtocolError> {
        self.received.fetch_add(1, Ordering::Relaxed);
        let event = match self.signer.open(payload) {
            Ok(event) => event,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected broker message ({} bytes): {e}", payload.len());
                return Err(e);
            }
        };

        let text = Arc::new(LiveMessage::change(&event).to_json()?);
        let report = self.registry.deliver(event.owner_id, text).await;
        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped_connections
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        log::trace!(
            "{:?} {:?} {} → {} connection(s) of {}",
            event.entity,
            event.op,
            event.id,
            report.delivered,
            event.owner_id
        );
        Ok(report)
    }

    /// Subscribe to `topic` and feed every payload through
    /// [`handle_payload`](Self::handle_payload), one at a time.
    pub fn spawn_subscriber(self: &Arc<Self>, url: String, topic: String, backoff: Backoff) -> Subscription {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1024);
        let fanout = self.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let _ = fanout.handle_payload(&payload).await;
            }
        });
        subscribe_loop(url, topic, backoff, tx)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            received: self.received.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_connections: self.dropped_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_store::{ChangeEvent, ChangeOp, EntityKind};

    fn event(owner: Uuid) -> ChangeEvent {
        ChangeEvent {
            entity: EntityKind::Revision,
            op: ChangeOp::Update,
            id: Uuid::new_v4(),
            owner_id: owner,
            emitted_at: 0,
        }
    }

    fn fanout(capacity: usize) -> (LiveFanout, ChangeSigner) {
        let signer = ChangeSigner::new("shared");
        let registry = Arc::new(ConnectionRegistry::new(capacity));
        (LiveFanout::new(registry, signer.clone()), signer)
    }

    #[tokio::test]
    async fn test_every_connection_of_owner_receives() {
        let (fanout, signer) = fanout(8);
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (_, mut rx1) = fanout.registry().register(owner).await;
        let (_, mut rx2) = fanout.registry().register(owner).await;
        let (_, mut rx3) = fanout.registry().register(other).await;

        let ev = event(owner);
        let payload = signer.sign(&ev).unwrap().to_json().unwrap();
        let report = fanout.handle_payload(&payload).await.unwrap();
        assert_eq!(report.delivered, 2);

        for rx in [&mut rx1, &mut rx2] {
            let text = rx.recv().await.unwrap();
            assert_eq!(LiveMessage::from_json(&text).unwrap(), LiveMessage::change(&ev));
        }
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forged_envelope_not_forwarded() {
        let (fanout, _) = fanout(8);
        let owner = Uuid::new_v4();
        let (_, mut rx) = fanout.registry().register(owner).await;

        let forged = ChangeSigner::new("attacker").sign(&event(owner)).unwrap();
        assert!(fanout.handle_payload(&forged.to_json().unwrap()).await.is_err());
        assert!(fanout.handle_payload(b"{}").await.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(fanout.stats().rejected, 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops_connection() {
        let (fanout, signer) = fanout(1);
        let owner = Uuid::new_v4();
        let (_, _slow_rx) = fanout.registry().register(owner).await;
        let (_, mut fast_rx) = fanout.registry().register(owner).await;

        let first = signer.sign(&event(owner)).unwrap().to_json().unwrap();
        assert_eq!(fanout.handle_payload(&first).await.unwrap().delivered, 2);
        fast_rx.recv().await.unwrap();

        let second = signer.sign(&event(owner)).unwrap().to_json().unwrap();
        let report = fanout.handle_payload(&second).await.unwrap();
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });
        assert_eq!(fanout.registry().connection_count(owner).await, 1);
        assert_eq!(fanout.stats().dropped_connections, 1);
    }

    #[tokio::test]
    async fn test_unregister() {
        let registry = ConnectionRegistry::new(4);
        let user = Uuid::new_v4();
        let (id, _rx) = registry.register(user).await;
        assert_eq!(registry.total_connections().await, 1);
        assert!(registry.unregister(user, id).await);
        assert!(!registry.unregister(user, id).await);
        assert_eq!(registry.connection_count(user).await, 0);
    }

    #[tokio::test]
    async fn test_per_user_order_preserved() {
        let (fanout, signer) = fanout(16);
        let owner = Uuid::new_v4();
        let (_, mut rx) = fanout.registry().register(owner).await;

        let events: Vec<_> = (0..5).map(|_| event(owner)).collect();
        for ev in &events {
            let payload = signer.sign(ev).unwrap().to_json().unwrap();
            fanout.handle_payload(&payload).await.unwrap();
        }
        for ev in &events {
            let text = rx.recv().await.unwrap();
            assert_eq!(LiveMessage::from_json(&text).unwrap(), LiveMessage::change(ev));
        }
    }
}
