//! Discovery bus
//!
//! Topic-based publish/subscribe used to exchange endpoint advertisements.
//! Delivery is best effort: a message published while nobody is subscribed
//! is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, CoreResult};

/// Pub/sub collaborator
#[async_trait]
pub trait DiscoveryBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> CoreResult<()>;

    /// Messages on `topic` from now on. Dropping the receiver unsubscribes.
    async fn subscribe(&self, topic: &str) -> CoreResult<mpsc::UnboundedReceiver<String>>;
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<String>>>;

fn lock(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliver to every live subscriber of `topic`, pruning dead ones.
/// Returns how many received it.
fn fan_out(subscribers: &Mutex<Subscribers>, topic: &str, payload: &str) -> usize {
    let mut map = lock(subscribers);
    let Some(senders) = map.get_mut(topic) else {
        return 0;
    };
    senders.retain(|tx| tx.send(payload.to_string()).is_ok());
    let delivered = senders.len();
    if senders.is_empty() {
        map.remove(topic);
    }
    delivered
}

/// In-process bus shared by engines in the same process
#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<Subscribers>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.subscribers)
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DiscoveryBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> CoreResult<()> {
        let delivered = fan_out(&self.subscribers, topic, &payload);
        debug!("Published on {} to {} subscribers", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

/// Line-delimited JSON frames spoken with the discovery broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String },
    Message { topic: String, payload: String },
}

impl BrokerFrame {
    pub fn to_line(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// First pause before reconnecting to the broker
const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound of the reconnect pause
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Bus backed by a remote discovery broker
///
/// A lost broker connection is re-established with exponential backoff and
/// every live subscription is replayed. Frames sent while the broker is
/// unreachable are dropped.
pub struct TcpBus {
    outgoing: mpsc::UnboundedSender<BrokerFrame>,
    subscribers: Arc<Mutex<Subscribers>>,
    task: JoinHandle<()>,
}

impl TcpBus {
    /// Fails if the broker is unreachable right now
    pub async fn connect(addr: SocketAddr) -> CoreResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::Bus(format!("connect {}: {}", addr, e)))?;
        info!("Connected to discovery broker at {}", addr);

        let (outgoing, frames) = mpsc::unbounded_channel::<BrokerFrame>();
        let subscribers: Arc<Mutex<Subscribers>> = Arc::default();
        let task = tokio::spawn(maintain_broker(addr, stream, frames, subscribers.clone()));

        Ok(Self {
            outgoing,
            subscribers,
            task,
        })
    }

    fn send(&self, frame: BrokerFrame) -> CoreResult<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| CoreError::Bus("broker connection closed".into()))
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Topics that still have a live receiver, pruning the rest
fn live_topics(subscribers: &Mutex<Subscribers>) -> Vec<String> {
    let mut map = lock(subscribers);
    map.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
    map.keys().cloned().collect()
}

async fn maintain_broker(
    addr: SocketAddr,
    mut stream: TcpStream,
    mut frames: mpsc::UnboundedReceiver<BrokerFrame>,
    subscribers: Arc<Mutex<Subscribers>>,
) {
    loop {
        if serve_broker(stream, &mut frames, &subscribers).await {
            return;
        }

        let mut backoff = INITIAL_RECONNECT_BACKOFF;
        stream = loop {
            if !sit_out(backoff, &mut frames).await {
                return;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    info!("Reconnected to discovery broker at {}", addr);
                    break stream;
                }
                Err(e) => {
                    debug!("Discovery broker {} unreachable: {}", addr, e);
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
                }
            }
        };
    }
}

/// Wait out `pause`, dropping frames meant for the lost connection.
/// `false` once the bus itself is gone.
async fn sit_out(pause: Duration, frames: &mut mpsc::UnboundedReceiver<BrokerFrame>) -> bool {
    let pause = sleep(pause);
    tokio::pin!(pause);
    loop {
        tokio::select! {
            _ = &mut pause => return true,
            frame = frames.recv() => match frame {
                Some(frame) => debug!("Broker unreachable, dropping {:?}", frame),
                None => return false,
            }
        }
    }
}

/// Pump one broker connection. `true` once the bus is gone, `false` when
/// the connection was lost.
async fn serve_broker(
    stream: TcpStream,
    frames: &mut mpsc::UnboundedReceiver<BrokerFrame>,
    subscribers: &Mutex<Subscribers>,
) -> bool {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // A fresh connection has no subscriptions on the broker side
    for topic in live_topics(subscribers) {
        let replay = BrokerFrame::Subscribe { topic };
        let Ok(line) = replay.to_line() else { continue };
        if let Err(e) = write_half.write_all(&line).await {
            error!("Discovery broker write failed: {}", e);
            return false;
        }
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    return true;
                };
                let line = match frame.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(&line).await {
                    error!("Discovery broker write failed: {}", e);
                    return false;
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<BrokerFrame>(&line) {
                    Ok(BrokerFrame::Message { topic, payload }) => {
                        fan_out(subscribers, &topic, &payload);
                    }
                    Ok(other) => debug!("Ignoring broker frame {:?}", other),
                    Err(e) => warn!("Malformed broker frame: {}", e),
                },
                Ok(None) => {
                    warn!("Discovery broker closed the connection");
                    return false;
                }
                Err(e) => {
                    error!("Discovery broker read failed: {}", e);
                    return false;
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryBus for TcpBus {
    async fn publish(&self, topic: &str, payload: String) -> CoreResult<()> {
        self.send(BrokerFrame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, topic: &str) -> CoreResult<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let first = {
            let mut map = lock(&self.subscribers);
            let senders = map.entry(topic.to_string()).or_default();
            senders.retain(|s| !s.is_closed());
            senders.push(tx);
            senders.len() == 1
        };
        if first {
            self.send(BrokerFrame::Subscribe {
                topic: topic.to_string(),
            })?;
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_memory_bus_fan_out() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();
        let mut other = bus.subscribe("u").await.unwrap();

        bus.publish("t", "hello".into()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_memory_bus_prunes_dropped_subscribers() {
        let bus = MemoryBus::new();
        let a = bus.subscribe("t").await.unwrap();
        let _b = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 2);
        drop(a);
        bus.publish("t", "x".into()).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::new();
        bus.publish("t", "lost".into()).await.unwrap();
        let mut late = bus.subscribe("t").await.unwrap();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_broker_frame_wire_shape() {
        let frame = BrokerFrame::Publish {
            topic: "peers/ab".into(),
            payload: "{}".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["op"], "publish");
        assert_eq!(value["topic"], "peers/ab");
    }

    #[tokio::test]
    async fn test_tcp_bus_against_scripted_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let first: BrokerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(first, BrokerFrame::Subscribe { topic: "t".into() });

            let second: BrokerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            let BrokerFrame::Publish { topic, payload } = second else {
                panic!("expected publish, got {:?}", second);
            };
            let echo = BrokerFrame::Message { topic, payload };
            write_half.write_all(&echo.to_line().unwrap()).await.unwrap();
            // Hold the connection open until the client is done
            let _ = lines.next_line().await;
        });

        let bus = TcpBus::connect(addr).await.unwrap();
        let mut rx = bus.subscribe("t").await.unwrap();
        bus.publish("t", "ping".into()).await.unwrap();

        let got = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("ping"));

        drop(bus);
        broker.abort();
    }

    async fn next_frame<R: tokio::io::AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> BrokerFrame {
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_bus_resubscribes_after_broker_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // First broker takes the subscription, then goes away
        let first = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            assert_eq!(next_frame(&mut lines).await, BrokerFrame::Subscribe { topic: "t".into() });
        });

        let bus = TcpBus::connect(addr).await.unwrap();
        let mut rx = bus.subscribe("t").await.unwrap();
        first.await.unwrap();

        let listener = TcpListener::bind(addr).await.unwrap();
        let (stream, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        assert_eq!(next_frame(&mut lines).await, BrokerFrame::Subscribe { topic: "t".into() });

        // The old receiver is fed again
        let message = BrokerFrame::Message {
            topic: "t".into(),
            payload: "after-restart".into(),
        };
        write_half.write_all(&message.to_line().unwrap()).await.unwrap();
        let got = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("after-restart"));

        bus.publish("t", "ping".into()).await.unwrap();
        assert_eq!(
            next_frame(&mut lines).await,
            BrokerFrame::Publish {
                topic: "t".into(),
                payload: "ping".into()
            }
        );
    }
}
