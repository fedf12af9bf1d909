//! In-memory broker for single-process deployments and tests.
//!
//! A process-wide `tokio::sync::broadcast` channel stands in for the wire;
//! each subscriber filters on its own topic set. The `set_connected(false)`
//! switch simulates a broker outage — blocked subscribers are woken
//! immediately via a `watch` channel — so the bridge's buffering and
//! reconnect paths can be exercised without a real broker.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use crate::broker::{Broker, BrokerError, BrokerMessage, BrokerSubscriber, Result};

/// Process-local broker satisfying the same trait as the Redis backend.
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
    connected: watch::Sender<bool>,
}

impl MemoryBroker {
    /// Create a broker with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let (connected, _) = watch::channel(true);
        Self { tx, connected }
    }

    /// Simulate broker loss (`false`) or recovery (`true`).
    ///
    /// While down, publishes fail, open subscribers error out of their
    /// blocked reads, and new subscriber connections are refused.
    pub fn set_connected(&self, connected: bool) {
        let _ = self.connected.send(connected);
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected("memory broker offline".into()));
        }
        // A send error just means no subscriber exists yet; pub/sub has no
        // delivery guarantee either way.
        let _ = self.tx.send(BrokerMessage {
            topic: topic.to_owned(),
            payload: payload.to_owned(),
        });
        Ok(())
    }

    async fn subscriber(&self) -> Result<Box<dyn BrokerSubscriber>> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected("memory broker offline".into()));
        }
        Ok(Box::new(MemorySubscriber {
            rx: self.tx.subscribe(),
            topics: HashSet::new(),
            connected: self.connected.subscribe(),
        }))
    }
}

#[derive(Debug)]
struct MemorySubscriber {
    rx: broadcast::Receiver<BrokerMessage>,
    topics: HashSet<String>,
    connected: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        if !*self.connected.borrow() {
            return Err(BrokerError::Disconnected("memory broker offline".into()));
        }
        let _ = self.topics.insert(topic.to_owned());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let _ = self.topics.remove(topic);
        Ok(())
    }

    async fn next_message(&mut self) -> Result<BrokerMessage> {
        loop {
            if !*self.connected.borrow() {
                return Err(BrokerError::Disconnected("memory broker offline".into()));
            }
            tokio::select! {
                changed = self.connected.changed() => {
                    if changed.is_err() || !*self.connected.borrow() {
                        return Err(BrokerError::Disconnected("memory broker offline".into()));
                    }
                }
                received = self.rx.recv() => match received {
                    Ok(msg) if self.topics.contains(&msg.topic) => return Ok(msg),
                    // Not subscribed — keep waiting.
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BrokerError::Disconnected("memory broker closed".into()));
                    }
                },
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_reaches_subscribed_topic() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscriber().await.unwrap();
        sub.subscribe("post:42").await.unwrap();

        broker.publish("post:42", "hello").await.unwrap();

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.topic, "post:42");
        assert_eq!(msg.payload, "hello");
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_filtered() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscriber().await.unwrap();
        sub.subscribe("post:1").await.unwrap();

        broker.publish("post:2", "other").await.unwrap();
        broker.publish("post:1", "mine").await.unwrap();

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, "mine");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscriber().await.unwrap();
        sub.subscribe("post:1").await.unwrap();
        sub.unsubscribe("post:1").await.unwrap();
        sub.subscribe("post:2").await.unwrap();

        broker.publish("post:1", "old").await.unwrap();
        broker.publish("post:2", "new").await.unwrap();

        let msg = sub.next_message().await.unwrap();
        assert_eq!(msg.payload, "new");
    }

    #[tokio::test]
    async fn two_subscribers_both_receive() {
        let broker = MemoryBroker::default();
        let mut a = broker.subscriber().await.unwrap();
        let mut b = broker.subscriber().await.unwrap();
        a.subscribe("room").await.unwrap();
        b.subscribe("room").await.unwrap();

        broker.publish("room", "x").await.unwrap();

        assert_eq!(a.next_message().await.unwrap().payload, "x");
        assert_eq!(b.next_message().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn offline_publish_fails() {
        let broker = MemoryBroker::default();
        broker.set_connected(false);
        let err = broker.publish("t", "p").await.unwrap_err();
        assert_matches!(err, BrokerError::Disconnected(_));
    }

    #[tokio::test]
    async fn offline_refuses_new_subscribers() {
        let broker = MemoryBroker::default();
        broker.set_connected(false);
        assert!(broker.subscriber().await.is_err());
    }

    #[tokio::test]
    async fn outage_wakes_blocked_subscriber() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscriber().await.unwrap();
        sub.subscribe("t").await.unwrap();

        let reader = tokio::spawn(async move { sub.next_message().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.set_connected(false);

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("blocked read must be woken")
            .unwrap();
        assert_matches!(result, Err(BrokerError::Disconnected(_)));
    }

    #[tokio::test]
    async fn recovery_restores_service() {
        let broker = MemoryBroker::default();
        broker.set_connected(false);
        assert!(broker.publish("t", "p").await.is_err());

        broker.set_connected(true);
        let mut sub = broker.subscriber().await.unwrap();
        sub.subscribe("t").await.unwrap();
        broker.publish("t", "back").await.unwrap();
        assert_eq!(sub.next_message().await.unwrap().payload, "back");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::default();
        assert!(broker.publish("nowhere", "p").await.is_ok());
    }
}
