//! The broker seam.
//!
//! Modeled on Redis pub/sub: a cheap multiplexed handle for publishing and
//! a dedicated subscriber connection that owns its topic set. The in-memory
//! implementation mimics the same split so the bridge code has exactly one
//! shape to drive.

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

/// A raw message received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Channel the message was published on.
    pub topic: String,
    /// Opaque payload — the envelope wire form.
    pub payload: String,
}

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker connection is down or could not be established.
    #[error("broker disconnected: {0}")]
    Disconnected(String),

    /// The broker rejected an operation.
    #[error("broker error: {0}")]
    Backend(String),
}

/// Convenience type alias for broker results.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Shared external pub/sub used to fan events out across processes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `topic`. Errors are the caller's signal to
    /// buffer and retry; the broker itself never queues.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Open a dedicated subscriber connection.
    ///
    /// Called again after any subscriber failure; the returned subscriber
    /// starts with an empty topic set and must be re-fed the current local
    /// topics.
    async fn subscriber(&self) -> Result<Box<dyn BrokerSubscriber>>;
}

/// A broker subscription connection with its own topic set.
#[async_trait]
pub trait BrokerSubscriber: Send + Debug {
    /// Add `topic` to this subscriber's set.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Remove `topic` from this subscriber's set.
    async fn unsubscribe(&mut self, topic: &str) -> Result<()>;

    /// Wait for the next message on any subscribed topic.
    ///
    /// `Err` means the connection is gone and the caller must reconnect.
    async fn next_message(&mut self) -> Result<BrokerMessage>;
}
