//! # beacon-bridge
//!
//! Cross-process event fan-out over a shared broker.
//!
//! - **[`Broker`]**: the seam between the gateway and whatever carries
//!   events between processes. [`RedisBroker`] is the production backend;
//!   [`MemoryBroker`] satisfies the same trait for single-process
//!   deployments and tests, so nothing branches on broker presence.
//! - **[`PubSubBridge`]**: publisher + subscriber background tasks with
//!   bounded buffering (drop-oldest), exponential-backoff reconnect,
//!   resubscribe-on-reconnect, and inbound envelope-id dedupe.
//!
//! Delivery is explicitly best-effort: at-most-once per broker hop with
//! tolerated, deduped redelivery. This is fan-out, not a durable log.

#![deny(unsafe_code)]

pub mod backoff;
pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod memory;
pub mod redis;

pub use bridge::{BridgeConfig, BridgeHandle, PubSubBridge, TopicSource};
pub use broker::{Broker, BrokerError, BrokerMessage, BrokerSubscriber};
pub use memory::MemoryBroker;
pub use redis::RedisBroker;
