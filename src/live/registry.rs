use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use warp::ws::Message;

use super::protocol::ServerEvent;
use crate::error::{QuizError, Result};

pub type ConnId = u64;

/// Tracks live connections and per-class subscriber sets.
///
/// Invariant: a connection appears in a class's subscriber set iff that
/// class appears in the connection's reverse entry, so both maps are
/// always mutated under both write locks.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnId, mpsc::UnboundedSender<Message>>>,
    class_subscribers: RwLock<HashMap<String, HashSet<ConnId>>>,
    socket_classes: RwLock<HashMap<ConnId, HashSet<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            class_subscribers: RwLock::new(HashMap::new()),
            socket_classes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> ConnId {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        connections.insert(conn_id, sender);
        tracing::debug!(conn_id = conn_id, "Connection registered");
        conn_id
    }

    /// Removes the connection and every subscription it held.
    /// Returns the classes it was subscribed to for disconnect handling.
    pub async fn unregister(&self, conn_id: ConnId) -> Vec<String> {
        let mut connections = self.connections.write().await;
        connections.remove(&conn_id);

        let mut subscribers = self.class_subscribers.write().await;
        let mut reverse = self.socket_classes.write().await;

        let classes: Vec<String> = reverse
            .remove(&conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for class_id in &classes {
            if let Some(set) = subscribers.get_mut(class_id) {
                set.remove(&conn_id);
                if set.is_empty() {
                    subscribers.remove(class_id);
                }
            }
        }

        tracing::debug!(
            conn_id = conn_id,
            class_count = classes.len(),
            "Connection unregistered"
        );
        classes
    }

    /// Idempotent set semantics: subscribing twice is a no-op
    pub async fn subscribe(&self, conn_id: ConnId, class_id: &str) {
        let mut subscribers = self.class_subscribers.write().await;
        let mut reverse = self.socket_classes.write().await;

        subscribers
            .entry(class_id.to_string())
            .or_default()
            .insert(conn_id);
        reverse
            .entry(conn_id)
            .or_default()
            .insert(class_id.to_string());
    }

    pub async fn unsubscribe(&self, conn_id: ConnId, class_id: &str) {
        let mut subscribers = self.class_subscribers.write().await;
        let mut reverse = self.socket_classes.write().await;

        if let Some(set) = subscribers.get_mut(class_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                subscribers.remove(class_id);
            }
        }
        if let Some(set) = reverse.get_mut(&conn_id) {
            set.remove(class_id);
            if set.is_empty() {
                reverse.remove(&conn_id);
            }
        }
    }

    /// Sends an event to a single connection
    pub async fn send_to(&self, conn_id: ConnId, event: &ServerEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        let connections = self.connections.read().await;
        let sender = connections
            .get(&conn_id)
            .ok_or(QuizError::Broadcast(conn_id))?;
        sender
            .send(Message::text(text))
            .map_err(|_| QuizError::Broadcast(conn_id))
    }

    /// Fan-out publish. Serializes once; with a class id sends to that
    /// class's subscriber set, otherwise to every registered connection.
    /// A failed send is logged and never blocks delivery to siblings.
    /// Returns the number of connections reached.
    pub async fn publish(&self, event: &ServerEvent, class_id: Option<&str>) -> usize {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast event");
                return 0;
            }
        };

        let targets: Vec<ConnId> = match class_id {
            Some(class_id) => {
                let subscribers = self.class_subscribers.read().await;
                subscribers
                    .get(class_id)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default()
            }
            None => {
                let connections = self.connections.read().await;
                connections.keys().copied().collect()
            }
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for conn_id in targets {
            let Some(sender) = connections.get(&conn_id) else {
                continue;
            };
            match sender.send(Message::text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        conn_id = conn_id,
                        class_id = ?class_id,
                        error = %e,
                        "Failed to send broadcast to connection"
                    );
                }
            }
        }
        delivered
    }

    #[cfg(test)]
    pub async fn maps_consistent(&self) -> bool {
        let subscribers = self.class_subscribers.read().await;
        let reverse = self.socket_classes.read().await;

        let forward_ok = subscribers.iter().all(|(class_id, set)| {
            set.iter().all(|conn_id| {
                reverse
                    .get(conn_id)
                    .map(|classes| classes.contains(class_id))
                    .unwrap_or(false)
            })
        });
        let reverse_ok = reverse.iter().all(|(conn_id, classes)| {
            classes.iter().all(|class_id| {
                subscribers
                    .get(class_id)
                    .map(|set| set.contains(conn_id))
                    .unwrap_or(false)
            })
        });
        forward_ok && reverse_ok
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(registry: &ConnectionRegistry) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = registry.register(tx).await;
        (conn_id, rx)
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn_id, _rx) = connect(&registry).await;

        registry.subscribe(conn_id, "C1").await;
        registry.subscribe(conn_id, "C1").await;

        let event = ServerEvent::ClassReset {
            class_id: "C1".to_string(),
        };
        assert_eq!(registry.publish(&event, Some("C1")).await, 1);
        assert!(registry.maps_consistent().await);
    }

    #[tokio::test]
    async fn test_unregister_clears_both_maps() {
        let registry = ConnectionRegistry::new();
        let (conn_id, _rx) = connect(&registry).await;
        registry.subscribe(conn_id, "C1").await;
        registry.subscribe(conn_id, "C2").await;

        let mut classes = registry.unregister(conn_id).await;
        classes.sort();
        assert_eq!(classes, vec!["C1".to_string(), "C2".to_string()]);

        let event = ServerEvent::ClassReset {
            class_id: "C1".to_string(),
        };
        assert_eq!(registry.publish(&event, Some("C1")).await, 0);
        assert!(registry.maps_consistent().await);
    }

    #[tokio::test]
    async fn test_publish_scoped_to_class() {
        let registry = ConnectionRegistry::new();
        let (conn_a, mut rx_a) = connect(&registry).await;
        let (conn_b, mut rx_b) = connect(&registry).await;
        registry.subscribe(conn_a, "C1").await;
        registry.subscribe(conn_b, "C2").await;

        let event = ServerEvent::ClassReset {
            class_id: "C1".to_string(),
        };
        let delivered = registry.publish(&event, Some("C1")).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_connection_does_not_block_siblings() {
        let registry = ConnectionRegistry::new();
        let (conn_a, rx_a) = connect(&registry).await;
        let (conn_b, mut rx_b) = connect(&registry).await;
        registry.subscribe(conn_a, "C1").await;
        registry.subscribe(conn_b, "C1").await;

        // Kill the first connection's receiving end so its send fails
        drop(rx_a);

        let event = ServerEvent::ClassReset {
            class_id: "C1".to_string(),
        };
        let delivered = registry.publish(&event, Some("C1")).await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_class_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let (_conn_a, mut rx_a) = connect(&registry).await;
        let (_conn_b, mut rx_b) = connect(&registry).await;

        let event = ServerEvent::Error {
            error: "shutdown".to_string(),
        };
        let delivered = registry.publish(&event, None).await;
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
