//! Notification Relay: storage change channel → signed broker messages.
//!
//! The relay tails a [`ChangeFeed`] from a cursor, signs each event and
//! publishes it on the well-known topic. Delivery is at-most-once: when the
//! broker cannot take an event the failure is logged as a notification
//! delivery failure, the event is dropped and the cursor moves on. The
//! storage write the event describes is never affected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use folio_store::{ChangeEvent, ChangeFeed, ChangeRecord, StoreError};

use crate::broker::BrokerPublisher;
use crate::error::RelayError;
use crate::protocol::ChangeSigner;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub topic: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "folio.changes".to_string(),
            poll_interval: Duration::from_millis(250),
            batch_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub failed: u64,
}

pub struct NotificationRelay {
    feed: Arc<dyn ChangeFeed>,
    signer: ChangeSigner,
    publisher: Arc<BrokerPublisher>,
    config: RelayConfig,
    /// Next sequence number to read
    cursor: AtomicU64,
    published: AtomicU64,
    failed: AtomicU64,
}

impl NotificationRelay {
    /// A relay that forwards changes committed from now on.
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        signer: ChangeSigner,
        publisher: Arc<BrokerPublisher>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        feed.catch_up()?;
        let start = feed.next_seq()?;
        log::info!("Relay starting at change #{start}");
        Ok(Self::starting_at(feed, signer, publisher, config, start))
    }

    pub fn starting_at(
        feed: Arc<dyn ChangeFeed>,
        signer: ChangeSigner,
        publisher: Arc<BrokerPublisher>,
        config: RelayConfig,
        cursor: u64,
    ) -> Self {
        Self {
            feed,
            signer,
            publisher,
            config,
            cursor: AtomicU64::new(cursor),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    async fn read_batch(&self, since: u64) -> Result<Vec<ChangeRecord>, RelayError> {
        let feed = self.feed.clone();
        let limit = self.config.batch_size.max(1);
        tokio::task::spawn_blocking(move || {
            feed.catch_up()?;
            feed.read_since(since, limit)
        })
        .await
        .map_err(|e| RelayError::Feed(StoreError::Database(e.to_string())))?
        .map_err(RelayError::from)
    }

    async fn forward(&self, event: &ChangeEvent) -> Result<(), RelayError> {
        let signed = self
            .signer
            .sign(event)
            .map_err(|e| RelayError::Signing(e.to_string()))?;
        let payload = signed.to_json().map_err(|e| RelayError::Signing(e.to_string()))?;
        self.publisher
            .publish(&self.config.topic, payload)
            .await
            .map_err(|e| RelayError::Delivery(e.to_string()))
    }

    /// Forward one batch. Returns how many change rows were consumed.
    pub async fn run_once(&self) -> Result<usize, RelayError> {
        let since = self.cursor.load(Ordering::Acquire);
        let records = self.read_batch(since).await?;

        for record in &records {
            match self.forward(&record.event).await {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "NotificationDeliveryFailure: change #{} ({:?} {:?} {}) dropped: {e}",
                        record.seq,
                        record.event.entity,
                        record.event.op,
                        record.event.id
                    );
                }
            }
            self.cursor.store(record.seq + 1, Ordering::Release);
        }
        Ok(records.len())
    }

    /// Relay forever: drain the feed, then wait for a commit or the poll
    /// interval.
    pub async fn run(&self) {
        let wake = self.feed.wake_handle();
        log::info!(
            "Relay publishing to {} on {}",
            self.config.topic,
            self.publisher.url()
        );
        loop {
            match self.run_once().await {
                Ok(n) if n >= self.config.batch_size => continue,
                Ok(_) => {}
                Err(e) => log::error!("Change feed read failed: {e}"),
            }
            match &wake {
                Some(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{subscribe_loop, Backoff, BrokerConfig, BrokerHub};
    use folio_store::{ChangeOp, EntityKind};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// In-memory feed.
    #[derive(Default)]
    struct VecFeed {
        rows: Mutex<Vec<ChangeRecord>>,
    }

    impl VecFeed {
        fn push(&self, owner: Uuid) -> ChangeEvent {
            let mut rows = self.rows.lock().unwrap();
            let event = ChangeEvent {
                entity: EntityKind::Revision,
                op: ChangeOp::Update,
                id: Uuid::new_v4(),
                owner_id: owner,
                emitted_at: 0,
            };
            let seq = rows.len() as u64;
            rows.push(ChangeRecord {
                seq,
                event: event.clone(),
            });
            event
        }
    }

    impl ChangeFeed for VecFeed {
        fn read_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeRecord>, StoreError> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|r| r.seq >= since)
                .take(limit)
                .cloned()
                .collect())
        }

        fn next_seq(&self) -> Result<u64, StoreError> {
            Ok(self.rows.lock().unwrap().len() as u64)
        }
    }

    fn dead_url() -> String {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        format!("ws://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_starts_at_head() {
        let feed = Arc::new(VecFeed::default());
        feed.push(Uuid::new_v4());
        feed.push(Uuid::new_v4());
        let publisher = Arc::new(BrokerPublisher::new(
            dead_url(),
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
        ));
        let relay = NotificationRelay::new(
            feed,
            ChangeSigner::new("k"),
            publisher,
            RelayConfig::default(),
        )
        .unwrap();
        assert_eq!(relay.cursor(), 2);
        assert_eq!(relay.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broker_down_drops_and_advances() {
        let feed = Arc::new(VecFeed::default());
        let publisher = Arc::new(BrokerPublisher::new(
            dead_url(),
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
        ));
        let relay = NotificationRelay::starting_at(
            feed.clone(),
            ChangeSigner::new("k"),
            publisher,
            RelayConfig::default(),
            0,
        );
        for _ in 0..3 {
            feed.push(Uuid::new_v4());
        }

        assert_eq!(relay.run_once().await.unwrap(), 3);
        assert_eq!(relay.cursor(), 3);
        assert_eq!(relay.stats(), RelayStats { published: 0, failed: 3 });
        // nothing is retried
        assert_eq!(relay.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publishes_signed_events() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let hub = Arc::new(BrokerHub::new(BrokerConfig::default()));
        tokio::spawn(async move {
            let _ = hub.serve(listener).await;
        });

        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(8);
        let mut sub = subscribe_loop(url.clone(), "folio.changes".into(), backoff.clone(), tx);
        sub.wait_subscribed().await;

        let feed = Arc::new(VecFeed::default());
        let signer = ChangeSigner::new("shared");
        let relay = NotificationRelay::starting_at(
            feed.clone(),
            signer.clone(),
            Arc::new(BrokerPublisher::new(url, backoff)),
            RelayConfig::default(),
            0,
        );
        let owner = Uuid::new_v4();
        let event = feed.push(owner);
        assert_eq!(relay.run_once().await.unwrap(), 1);
        assert_eq!(relay.stats().published, 1);

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signer.open(&payload).unwrap(), event);
        sub.abort();
    }
}
