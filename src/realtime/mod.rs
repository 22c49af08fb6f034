pub mod protocol;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::CoreError;

use self::protocol::ServerMessage;

/// Registry entry for one live client connection.
///
/// `tx` feeds the connection's bounded outbound queue; the delivery task on
/// the socket side drains it in order. Dropping the entry closes the queue,
/// which ends the delivery task and the socket.
struct Connection {
    client_id: String,
    connected_at: DateTime<Utc>,
    /// Last peer heartbeat reply, as epoch milliseconds.
    last_pong_ms: AtomicI64,
    tx: mpsc::Sender<ServerMessage>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of one connection's delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub sent: u64,
    pub dropped: u64,
}

struct HubInner {
    max_connections: usize,
    queue_capacity: usize,
    heartbeat: Duration,
    connections: RwLock<HashMap<Uuid, Connection>>,
    topics: RwLock<HashMap<String, HashSet<Uuid>>>,
}

/// Connection registry and topic fan-out.
///
/// `send` never blocks: a full queue drops the message and increments the
/// connection's failure counter, so one slow client can neither grow memory
/// without bound nor head-of-line-block anyone else. Wrapped in `Arc` so it
/// can be cheaply cloned and shared across tasks.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new(max_connections: usize, queue_capacity: usize, heartbeat: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                max_connections,
                queue_capacity,
                heartbeat,
                connections: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        self.inner.heartbeat
    }

    /// Register a connection. Returns its ID and the receiving end of its
    /// outbound queue, or `CapacityExceeded` once `max_connections` live
    /// connections exist.
    pub async fn connect(
        &self,
        client_id: Option<String>,
    ) -> Result<(Uuid, mpsc::Receiver<ServerMessage>), CoreError> {
        let mut connections = self.inner.connections.write().await;
        if connections.len() >= self.inner.max_connections {
            return Err(CoreError::CapacityExceeded);
        }

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        connections.insert(
            id,
            Connection {
                client_id: client_id.unwrap_or_else(|| id.to_string()),
                connected_at: Utc::now(),
                last_pong_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                tx,
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            },
        );
        info!(connection_id = %id, total = connections.len(), "client connected");
        Ok((id, rx))
    }

    /// Remove a connection and every topic membership it holds.
    pub async fn disconnect(&self, id: Uuid) {
        let removed = self.inner.connections.write().await.remove(&id);
        if let Some(conn) = removed {
            let mut topics = self.inner.topics.write().await;
            topics.retain(|_, members| {
                members.remove(&id);
                !members.is_empty()
            });
            info!(
                connection_id = %id,
                client_id = %conn.client_id,
                connected_at = %conn.connected_at,
                messages_sent = conn.sent.load(Ordering::Relaxed),
                "client disconnected"
            );
        }
    }

    pub async fn subscribe(&self, id: Uuid, topic: &str) {
        self.inner
            .topics
            .write()
            .await
            .entry(topic.to_owned())
            .or_default()
            .insert(id);
    }

    pub async fn unsubscribe(&self, id: Uuid, topic: &str) {
        let mut topics = self.inner.topics.write().await;
        if let Some(members) = topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Non-blocking enqueue. A full or closed queue drops the message,
    /// bumps the failure counter, and returns false; the connection stays
    /// alive.
    pub async fn send(&self, id: Uuid, message: ServerMessage) -> bool {
        let connections = self.inner.connections.read().await;
        let Some(conn) = connections.get(&id) else {
            return false;
        };
        match conn.tx.try_send(message) {
            Ok(()) => {
                conn.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                conn.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(connection_id = %id, "outbound queue full, message dropped");
                false
            }
        }
    }

    /// Deliver to every live connection, or to the topic's current
    /// subscribers only. Returns how many queues accepted the message.
    pub async fn broadcast(&self, message: ServerMessage, topic: Option<&str>) -> usize {
        let targets: Vec<Uuid> = match topic {
            None => self.inner.connections.read().await.keys().copied().collect(),
            Some(topic) => self
                .inner
                .topics
                .read()
                .await
                .get(topic)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
        };

        let mut delivered = 0;
        for id in targets {
            if self.send(id, message.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Note a heartbeat reply from the peer.
    pub async fn record_pong(&self, id: Uuid) {
        if let Some(conn) = self.inner.connections.read().await.get(&id) {
            conn.last_pong_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        }
    }

    /// Close connections whose last heartbeat reply is older than twice the
    /// heartbeat period. Returns the IDs that were closed.
    pub async fn sweep_stale(&self) -> Vec<Uuid> {
        let cutoff = Utc::now().timestamp_millis() - 2 * self.inner.heartbeat.as_millis() as i64;
        let stale: Vec<Uuid> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.last_pong_ms.load(Ordering::Relaxed) < cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            info!(connection_id = %id, "closing dead connection (heartbeat timeout)");
            self.disconnect(*id).await;
        }
        stale
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub async fn stats(&self, id: Uuid) -> Option<ConnectionStats> {
        self.inner.connections.read().await.get(&id).map(|c| ConnectionStats {
            sent: c.sent.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        })
    }

    /// Periodic dead-connection sweep; spawn once at startup.
    pub async fn run_sweeper(self) {
        let mut ticker = tokio::time::interval(self.inner.heartbeat);
        loop {
            ticker.tick().await;
            let closed = self.sweep_stale().await;
            if !closed.is_empty() {
                info!(count = closed.len(), "heartbeat sweep closed connections");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(max: usize, queue: usize) -> FanoutHub {
        FanoutHub::new(max, queue, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn connect_enforces_capacity() {
        let hub = hub(2, 10);
        let _a = hub.connect(None).await.unwrap();
        let _b = hub.connect(Some("dash".into())).await.unwrap();

        let err = hub.connect(None).await.unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded));

        // Disconnecting frees a slot.
        hub.disconnect(_a.0).await;
        assert!(hub.connect(None).await.is_ok());
    }

    #[tokio::test]
    async fn overflow_drops_messages_but_keeps_connection() {
        let hub = hub(10, 100);
        let (id, _rx) = hub.connect(None).await.unwrap();

        let mut accepted = 0;
        for _ in 0..150 {
            if hub.send(id, ServerMessage::Ping).await {
                accepted += 1;
            }
        }

        let stats = hub.stats(id).await.unwrap();
        assert_eq!(accepted, 100);
        assert_eq!(stats.sent, 100);
        assert_eq!(stats.dropped, 50);
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn queue_drains_in_order() {
        let hub = hub(10, 100);
        let (id, mut rx) = hub.connect(None).await.unwrap();

        for topic in ["a", "b", "c"] {
            hub.send(id, ServerMessage::Subscribed { topic: topic.into() }).await;
        }

        for expected in ["a", "b", "c"] {
            match rx.recv().await.unwrap() {
                ServerMessage::Subscribed { topic } => assert_eq!(topic, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_without_topic_reaches_everyone() {
        let hub = hub(10, 10);
        let (_a, mut rx_a) = hub.connect(None).await.unwrap();
        let (_b, mut rx_b) = hub.connect(None).await.unwrap();

        let delivered = hub.broadcast(ServerMessage::Ping, None).await;

        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), ServerMessage::Ping);
        assert_eq!(rx_b.recv().await.unwrap(), ServerMessage::Ping);
    }

    #[tokio::test]
    async fn topic_broadcast_targets_current_subscribers_only() {
        let hub = hub(10, 10);
        let (a, mut rx_a) = hub.connect(None).await.unwrap();
        let (b, mut rx_b) = hub.connect(None).await.unwrap();

        hub.subscribe(a, "alerts").await;
        hub.subscribe(b, "alerts").await;
        hub.unsubscribe(b, "alerts").await;

        let delivered = hub.broadcast(ServerMessage::Ping, Some("alerts")).await;

        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap(), ServerMessage::Ping);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_topic_delivers_nothing() {
        let hub = hub(10, 10);
        let _conn = hub.connect(None).await.unwrap();
        assert_eq!(hub.broadcast(ServerMessage::Ping, Some("nope")).await, 0);
    }

    #[tokio::test]
    async fn sweep_closes_only_silent_connections() {
        let hub = FanoutHub::new(10, 10, Duration::from_millis(10));
        let (stale, _rx1) = hub.connect(None).await.unwrap();
        let (fresh, _rx2) = hub.connect(None).await.unwrap();

        // Stale connection: last pong far in the past.
        hub.inner
            .connections
            .read()
            .await
            .get(&stale)
            .unwrap()
            .last_pong_ms
            .store(0, Ordering::Relaxed);
        hub.record_pong(fresh).await;

        let closed = hub.sweep_stale().await;

        assert_eq!(closed, vec![stale]);
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_cleans_topic_membership() {
        let hub = hub(10, 10);
        let (a, _rx) = hub.connect(None).await.unwrap();
        hub.subscribe(a, "alerts").await;

        hub.disconnect(a).await;

        assert!(hub.inner.topics.read().await.is_empty());
    }
}
