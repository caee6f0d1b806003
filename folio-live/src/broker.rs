//! Topic broker: the pub/sub hop between the relay and the fan-out.
//!
//! ```text
//!  relay ── BrokerPublisher ──Publish──┐
//!                                      ▼
//!                        BrokerHub ── TopicGroup("folio.changes")
//!                                      │
//!          subscribe_loop ◄──Message───┴──► (any other subscriber)
//! ```
//!
//! Frames are [`BrokerFrame`]s in binary WebSocket messages. The hub keeps
//! no history: a subscriber sees only what is published after its
//! `Subscribed` acknowledgement, and a subscriber that lags loses frames.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{SubscriberInfo, TopicGroup, TopicRegistry};
use crate::error::BrokerError;
use crate::protocol::BrokerFrame;

const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Hub ──────────────────────────────────────────────────────────────

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-subscriber buffer, in frames
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7070".to_string(),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_published: u64,
}

/// The broker process.
pub struct BrokerHub {
    config: BrokerConfig,
    topics: Arc<TopicRegistry>,
    stats: Arc<RwLock<HubStats>>,
}

impl BrokerHub {
    pub fn new(config: BrokerConfig) -> Self {
        let topics = Arc::new(TopicRegistry::new(config.channel_capacity));
        Self {
            config,
            topics,
            stats: Arc::new(RwLock::new(HubStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Broker listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New broker connection from {addr}");

            let topics = self.topics.clone();
            let stats = self.stats.clone();
            let capacity = self.config.channel_capacity;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, topics, stats, capacity).await {
                    log::warn!("Broker connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        topics: Arc<TopicRegistry>,
        stats: Arc<RwLock<HubStats>>,
        capacity: usize,
    ) -> Result<(), BrokerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let subscriber_id = Uuid::new_v4();
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
        let result = Self::pump(
            ws_stream,
            addr,
            subscriber_id,
            &topics,
            &stats,
            &mut forwarders,
            capacity,
        )
        .await;

        for (topic, task) in forwarders {
            task.abort();
            leave_topic(&topics, &topic, &subscriber_id).await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        subscriber_id: Uuid,
        topics: &TopicRegistry,
        stats: &RwLock<HubStats>,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
        capacity: usize,
    ) -> Result<(), BrokerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        // Every subscribed topic forwards into this one queue
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(capacity.max(1));

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let frame = match BrokerFrame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Undecodable broker frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            match frame {
                                BrokerFrame::Subscribe { topic } => {
                                    if !forwarders.contains_key(&topic) {
                                        let group = topics.get_or_create(&topic).await;
                                        let rx = group
                                            .add_subscriber(SubscriberInfo { subscriber_id, addr })
                                            .await;
                                        let task = spawn_forwarder(group, rx, out_tx.clone(), addr);
                                        forwarders.insert(topic.clone(), task);
                                        log::info!("{addr} subscribed to {topic}");
                                    }
                                    let ack = BrokerFrame::Subscribed { topic }.encode()?;
                                    ws_sender.send(Message::Binary(ack.into())).await?;
                                }
                                BrokerFrame::Unsubscribe { topic } => {
                                    if let Some(task) = forwarders.remove(&topic) {
                                        task.abort();
                                        leave_topic(topics, &topic, &subscriber_id).await;
                                    }
                                }
                                BrokerFrame::Publish { topic, payload } => {
                                    let group = topics.get_or_create(&topic).await;
                                    let encoded = BrokerFrame::Message { topic, payload }.encode()?;
                                    group.broadcast_raw(Arc::new(encoded));
                                    stats.write().await.frames_published += 1;
                                }
                                BrokerFrame::Ping => {
                                    let pong = BrokerFrame::Pong.encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }
                                BrokerFrame::Pong
                                | BrokerFrame::Subscribed { .. }
                                | BrokerFrame::Message { .. } => {}
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Broker connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }

                Some(frame) = out_rx.recv() => {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }
            }
        }
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.topics
    }

    pub async fn stats(&self) -> HubStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

fn spawn_forwarder(
    group: Arc<TopicGroup>,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
    addr: SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if out_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {addr} lagged by {n} frames");
                    group.record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn leave_topic(topics: &TopicRegistry, topic: &str, subscriber_id: &Uuid) {
    if let Some(group) = topics.get(topic).await {
        group.remove_subscriber(subscriber_id).await;
    }
    topics.remove_if_empty(topic).await;
}

// ─── Client ───────────────────────────────────────────────────────────

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

enum Inbound {
    Subscribed(String),
    Message(BrokerMessage),
}

/// One WebSocket connection to the hub.
pub struct BrokerConnection {
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    inbound_rx: mpsc::Receiver<Inbound>,
    pending: VecDeque<BrokerMessage>,
}

impl BrokerConnection {
    /// Connect and spawn the reader and writer tasks.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BrokerError::Connect(format!("{url}: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(1024);

        // Writer task: forward outgoing channel to WebSocket
        let writer_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            *writer_state.write().await = ConnectionState::Disconnected;
        });

        // Reader task: decode hub frames
        let reader_state = state.clone();
        let pong_tx = outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match BrokerFrame::decode(&data) {
                        Ok(BrokerFrame::Message { topic, payload }) => {
                            let inbound = Inbound::Message(BrokerMessage { topic, payload });
                            if inbound_tx.send(inbound).await.is_err() {
                                break;
                            }
                        }
                        Ok(BrokerFrame::Subscribed { topic }) => {
                            if inbound_tx.send(Inbound::Subscribed(topic)).await.is_err() {
                                break;
                            }
                        }
                        Ok(BrokerFrame::Ping) => {
                            if let Ok(pong) = BrokerFrame::Pong.encode() {
                                let _ = pong_tx.send(Message::Binary(pong.into())).await;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Undecodable frame from broker: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            state,
            outgoing_tx,
            inbound_rx,
            pending: VecDeque::new(),
        })
    }

    async fn send_frame(&self, frame: &BrokerFrame) -> Result<(), BrokerError> {
        if !self.is_connected().await {
            return Err(BrokerError::Closed);
        }
        let encoded = frame.encode()?;
        self.outgoing_tx
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| BrokerError::Closed)
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.send_frame(&BrokerFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
        .await
    }

    /// Subscribe and wait for the hub's acknowledgement.
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.send_frame(&BrokerFrame::Subscribe {
            topic: topic.to_string(),
        })
        .await?;

        let wait = async {
            loop {
                match self.inbound_rx.recv().await {
                    Some(Inbound::Subscribed(t)) if t == topic => return Ok(()),
                    Some(Inbound::Subscribed(_)) => {}
                    Some(Inbound::Message(m)) => self.pending.push_back(m),
                    None => return Err(BrokerError::Closed),
                }
            }
        };
        tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, wait)
            .await
            .map_err(|_| BrokerError::Connect(format!("no subscription ack for {topic}")))?
    }

    /// Next message on any subscribed topic. `None` once the connection is gone.
    pub async fn next_message(&mut self) -> Option<BrokerMessage> {
        if let Some(m) = self.pending.pop_front() {
            return Some(m);
        }
        loop {
            match self.inbound_rx.recv().await? {
                Inbound::Message(m) => return Some(m),
                Inbound::Subscribed(_) => {}
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
    }
}

// ─── Reconnect policy ─────────────────────────────────────────────────

/// Exponential reconnect delay, doubling up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct PublisherState {
    conn: Option<BrokerConnection>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

/// Lazily connected publisher used by the relay.
///
/// While the hub is unreachable, `publish` fails fast until the backoff
/// delay has elapsed; the caller decides what to do with the event.
pub struct BrokerPublisher {
    url: String,
    state: Mutex<PublisherState>,
}

impl BrokerPublisher {
    pub fn new(url: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(PublisherState {
                conn: None,
                backoff,
                retry_at: None,
            }),
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;

        if let Some(conn) = &state.conn {
            if conn.is_connected().await {
                match conn.publish(topic, payload.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => log::warn!("Broker publish failed, reconnecting: {e}"),
                }
            }
            state.conn = None;
        }

        if let Some(at) = state.retry_at {
            if Instant::now() < at {
                return Err(BrokerError::Connect(format!("{} unreachable, backing off", self.url)));
            }
        }

        match BrokerConnection::connect(&self.url).await {
            Ok(conn) => {
                log::info!("Connected to broker at {}", self.url);
                state.backoff.reset();
                state.retry_at = None;
                let result = conn.publish(topic, payload).await;
                state.conn = Some(conn);
                result
            }
            Err(e) => {
                let delay = state.backoff.next_delay();
                state.retry_at = Some(Instant::now() + delay);
                Err(e)
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

// ─── Subscriber loop ──────────────────────────────────────────────────

/// Handle to a background subscription.
pub struct Subscription {
    task: JoinHandle<()>,
    subscribed: watch::Receiver<bool>,
}

impl Subscription {
    /// Wait until the hub has acknowledged the subscription.
    pub async fn wait_subscribed(&mut self) {
        let _ = self.subscribed.wait_for(|s| *s).await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Keep a subscription to `topic` alive, forwarding payloads into `tx`.
///
/// Reconnects with backoff whenever the hub goes away. Stops once `tx` is
/// closed.
pub fn subscribe_loop(
    url: String,
    topic: String,
    mut backoff: Backoff,
    tx: mpsc::Sender<Vec<u8>>,
) -> Subscription {
    let (state_tx, state_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            match BrokerConnection::connect(&url).await {
                Ok(mut conn) => match conn.subscribe(&topic).await {
                    Ok(()) => {
                        log::info!("Subscribed to {topic} at {url}");
                        backoff.reset();
                        let _ = state_tx.send(true);
                        while let Some(msg) = conn.next_message().await {
                            if tx.send(msg.payload).await.is_err() {
                                return;
                            }
                        }
                        let _ = state_tx.send(false);
                        log::warn!("Lost broker subscription to {topic}");
                    }
                    Err(e) => log::warn!("Subscribe to {topic} failed: {e}"),
                },
                Err(e) => log::warn!("Broker unreachable: {e}"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    });
    Subscription {
        task,
        subscribed: state_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_hub() -> (String, Arc<BrokerHub>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Arc::new(BrokerHub::new(BrokerConfig {
            bind_addr: addr.to_string(),
            channel_capacity: 64,
        }));
        let serving = hub.clone();
        tokio::spawn(async move {
            let _ = serving.serve(listener).await;
        });
        (format!("ws://{addr}"), hub)
    }

    #[test]
    fn test_backoff_doubles_to_ceiling() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:7070");
        assert_eq!(config.channel_capacity, 1024);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let (url, hub) = start_hub().await;

        let mut sub = BrokerConnection::connect(&url).await.unwrap();
        sub.subscribe("folio.changes").await.unwrap();

        let publisher = BrokerConnection::connect(&url).await.unwrap();
        publisher.publish("folio.changes", b"hello".to_vec()).await.unwrap();
        publisher.publish("other", b"ignored".to_vec()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "folio.changes");
        assert_eq!(msg.payload, b"hello");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = hub.stats().await;
        assert_eq!(stats.frames_published, 2);
        assert_eq!(stats.active_connections, 2);
    }

    #[tokio::test]
    async fn test_publisher_fails_fast_while_backing_off() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let publisher = BrokerPublisher::new(
            format!("ws://127.0.0.1:{port}"),
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
        );
        assert!(matches!(
            publisher.publish("t", vec![1]).await,
            Err(BrokerError::Connect(_))
        ));
        let second = publisher.publish("t", vec![2]).await.unwrap_err();
        assert!(second.to_string().contains("backing off"));
    }

    #[tokio::test]
    async fn test_subscribe_loop_forwards_payloads() {
        let (url, _hub) = start_hub().await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut subscription = subscribe_loop(
            url.clone(),
            "folio.changes".into(),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(2), subscription.wait_subscribed())
            .await
            .unwrap();

        let publisher = BrokerPublisher::new(
            url,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        );
        publisher.publish("folio.changes", b"payload".to_vec()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"payload");
        subscription.abort();
    }
}
