//! MeshPeer Discovery Broker
//!
//! Topic publish/subscribe relay that carries endpoint advertisements
//! between peers. Speaks line-delimited JSON `BrokerFrame`s over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use meshpeer_core::BrokerFrame;

/// MeshPeer Discovery Broker
#[derive(Parser)]
#[command(name = "meshpeer-discovery")]
#[command(author, version, about)]
struct Cli {
    /// Listen address for TCP
    #[arg(short, long, default_value = "0.0.0.0:51822")]
    listen: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

type ClientId = u64;

/// Broker state
#[derive(Default)]
struct Broker {
    /// topic -> subscribed clients
    topics: DashMap<String, DashMap<ClientId, mpsc::UnboundedSender<BrokerFrame>>>,
    next_id: AtomicU64,
}

impl Broker {
    fn register(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self, client: ClientId, topic: &str, tx: &mpsc::UnboundedSender<BrokerFrame>) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(client, tx.clone());
    }

    fn unsubscribe(&self, client: ClientId, topic: &str) {
        if let Some(subscribers) = self.topics.get(topic) {
            subscribers.remove(&client);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    /// Drop every subscription of a disconnected client
    fn disconnect(&self, client: ClientId) {
        for entry in self.topics.iter() {
            entry.value().remove(&client);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Deliver to every subscriber of `topic`; returns how many got it
    fn publish(&self, topic: &str, payload: &str) -> usize {
        let Some(subscribers) = self.topics.get(topic) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            let frame = BrokerFrame::Message {
                topic: topic.to_string(),
                payload: payload.to_string(),
            };
            if subscriber.value().send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn topic_count(&self) -> usize {
        self.topics.len()
    }

    async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    let broker = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_client(stream, from).await {
                            debug!("Client {} ended: {}", from, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_client(&self, stream: TcpStream, from: SocketAddr) -> Result<()> {
        let client = self.register();
        info!("Client {} connected from {}", client, from);

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerFrame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let line = match frame.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping unencodable frame: {}", e);
                        continue;
                    }
                };
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        let result = self.read_frames(client, read_half, &tx).await;

        self.disconnect(client);
        writer.abort();
        info!("Client {} disconnected", client);
        result
    }

    async fn read_frames(
        &self,
        client: ClientId,
        read_half: tokio::net::tcp::OwnedReadHalf,
        tx: &mpsc::UnboundedSender<BrokerFrame>,
    ) -> Result<()> {
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let frame = match serde_json::from_str::<BrokerFrame>(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Malformed frame from client {}: {}", client, e);
                    continue;
                }
            };

            match frame {
                BrokerFrame::Subscribe { topic } => {
                    debug!("Client {} subscribed to {}", client, topic);
                    self.subscribe(client, &topic, tx);
                }
                BrokerFrame::Unsubscribe { topic } => {
                    self.unsubscribe(client, &topic);
                }
                BrokerFrame::Publish { topic, payload } => {
                    let delivered = self.publish(&topic, &payload);
                    debug!("Client {} published on {} to {} subscribers", client, topic, delivered);
                }
                BrokerFrame::Message { .. } => {
                    debug!("Unexpected message frame from client {}", client);
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Discovery broker listening on {}", listener.local_addr()?);

    let broker = Arc::new(Broker::default());

    tokio::select! {
        result = broker.clone().run(listener) => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down with {} active topics", broker.topic_count());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshpeer_core::{DiscoveryBus, TcpBus};
    use tokio::time::timeout;

    async fn start_broker() -> (Arc<Broker>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let broker = Arc::new(Broker::default());
        tokio::spawn(broker.clone().run(listener));
        (broker, addr)
    }

    async fn wait_for_subscribers(broker: &Broker, topic: &str, count: usize) {
        for _ in 0..100 {
            if broker.topics.get(topic).map(|s| s.len()).unwrap_or(0) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscribers on {} never reached {}", topic, count);
    }

    #[test]
    fn test_publish_only_reaches_topic_subscribers() {
        let broker = Broker::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = broker.register();
        let b = broker.register();

        broker.subscribe(a, "peers/one", &tx_a);
        broker.subscribe(b, "peers/two", &tx_b);

        assert_eq!(broker.publish("peers/one", "hello"), 1);
        assert_eq!(
            rx_a.try_recv().unwrap(),
            BrokerFrame::Message { topic: "peers/one".into(), payload: "hello".into() }
        );
        assert!(rx_b.try_recv().is_err());
        assert_eq!(broker.publish("peers/none", "lost"), 0);
    }

    #[test]
    fn test_disconnect_drops_empty_topics() {
        let broker = Broker::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = broker.register();
        let b = broker.register();

        broker.subscribe(a, "peers/one", &tx);
        broker.subscribe(b, "peers/one", &tx);
        broker.subscribe(a, "peers/two", &tx);
        assert_eq!(broker.topic_count(), 2);

        broker.disconnect(a);
        assert_eq!(broker.topic_count(), 1);
        broker.unsubscribe(b, "peers/one");
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_tcp_bus_clients_exchange_through_broker() {
        let (broker, addr) = start_broker().await;

        let alice = TcpBus::connect(addr).await.unwrap();
        let bob = TcpBus::connect(addr).await.unwrap();

        let mut alice_rx = alice.subscribe("peers/ab").await.unwrap();
        let mut bob_rx = bob.subscribe("peers/ab").await.unwrap();
        wait_for_subscribers(&broker, "peers/ab", 2).await;

        alice.publish("peers/ab", "{\"type\":\"x\"}".into()).await.unwrap();

        let got = timeout(Duration::from_secs(2), bob_rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, "{\"type\":\"x\"}");
        let echoed = timeout(Duration::from_secs(2), alice_rx.recv()).await.unwrap().unwrap();
        assert_eq!(echoed, got);

        drop(bob);
        wait_for_subscribers(&broker, "peers/ab", 1).await;
    }
}
