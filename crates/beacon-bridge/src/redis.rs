//! Redis broker backend.
//!
//! Publishes on a multiplexed [`ConnectionManager`] (lazily established,
//! rebuilt after failure) and subscribes on a dedicated pub/sub connection,
//! which Redis requires to be separate from command traffic. All reconnect
//! pacing lives in the bridge; this type only reports failures.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::debug;

use crate::broker::{Broker, BrokerError, BrokerMessage, BrokerSubscriber, Result};

/// Broker backed by Redis pub/sub.
pub struct RedisBroker {
    client: redis::Client,
    publish_conn: Mutex<Option<ConnectionManager>>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Create a broker for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// No connection is made yet; both paths connect lazily so the gateway
    /// can boot while Redis is still coming up.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| BrokerError::Backend(format!("invalid redis url: {err}")))?;
        Ok(Self {
            client,
            publish_conn: Mutex::new(None),
        })
    }

    async fn publish_connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.publish_conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|err| BrokerError::Disconnected(err.to_string()))?;
        *guard = Some(conn.clone());
        debug!("redis publish connection established");
        Ok(conn)
    }

    async fn drop_publish_connection(&self) {
        *self.publish_conn.lock().await = None;
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let mut conn = self.publish_connection().await?;
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            self.drop_publish_connection().await;
            return Err(BrokerError::Disconnected(err.to_string()));
        }
        Ok(())
    }

    async fn subscriber(&self) -> Result<Box<dyn BrokerSubscriber>> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BrokerError::Disconnected(err.to_string()))?;
        Ok(Box::new(RedisSubscriber { pubsub }))
    }
}

struct RedisSubscriber {
    pubsub: redis::aio::PubSub,
}

impl std::fmt::Debug for RedisSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscriber").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.pubsub
            .subscribe(topic)
            .await
            .map_err(|err| BrokerError::Disconnected(err.to_string()))
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.pubsub
            .unsubscribe(topic)
            .await
            .map_err(|err| BrokerError::Disconnected(err.to_string()))
    }

    async fn next_message(&mut self) -> Result<BrokerMessage> {
        let message = {
            let mut stream = self.pubsub.on_message();
            stream.next().await
        };
        let Some(message) = message else {
            return Err(BrokerError::Disconnected("redis pubsub stream ended".into()));
        };
        let payload: String = message
            .get_payload()
            .map_err(|err| BrokerError::Backend(err.to_string()))?;
        Ok(BrokerMessage {
            topic: message.get_channel_name().to_owned(),
            payload,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
