//! The pub/sub bridge: two background tasks per process.
//!
//! The **publisher** drains the dispatcher queue into the broker. While the
//! broker is down, envelopes accumulate in the bounded [`PublishBuffer`]
//! (drop-oldest, counted) and the task retries with exponential backoff.
//!
//! The **subscriber** holds the dedicated broker subscription, forwards
//! inbound envelopes to local fan-out, and — after any reconnect —
//! resubscribes to a fresh snapshot of the process's local topics, so
//! membership changes made during an outage are never lost.
//!
//! Inbound envelopes are deduped by id against a bounded recent-id window:
//! broker redelivery is tolerated, never assumed impossible.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beacon_core::EventId;
use beacon_events::EventEnvelope;

use crate::backoff::ExponentialBackoff;
use crate::broker::{Broker, BrokerSubscriber};
use crate::buffer::PublishBuffer;

/// Where the subscriber learns the process's current topics on reconnect.
///
/// Implemented by the room manager; the bridge never owns membership.
pub trait TopicSource: Send + Sync {
    /// Snapshot of every topic with at least one local member.
    fn local_topics(&self) -> Vec<String>;
}

/// Bridge tuning knobs.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Outbound buffer capacity while the broker is down.
    pub buffer_capacity: usize,
    /// How many recent envelope ids to remember for dedupe.
    pub dedupe_window: usize,
    /// Reconnect backoff floor.
    pub backoff_base: Duration,
    /// Reconnect backoff ceiling.
    pub backoff_cap: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1_000,
            dedupe_window: 4_096,
            backoff_base: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Subscription change requested by the room manager.
#[derive(Debug)]
enum SubscriptionCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Running bridge: counters and control surface.
pub struct BridgeHandle {
    subs_tx: mpsc::UnboundedSender<SubscriptionCommand>,
    dropped: Arc<AtomicU64>,
    deduped: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Ask the subscriber to follow `topic`.
    ///
    /// Best-effort: if the broker is currently down, the next reconnect's
    /// topic-source snapshot covers it.
    pub fn subscribe_topic(&self, topic: &str) {
        let _ = self
            .subs_tx
            .send(SubscriptionCommand::Subscribe(topic.to_owned()));
    }

    /// Ask the subscriber to stop following `topic`.
    pub fn unsubscribe_topic(&self, topic: &str) {
        let _ = self
            .subs_tx
            .send(SubscriptionCommand::Unsubscribe(topic.to_owned()));
    }

    /// Outbound events dropped by the bounded buffer.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Inbound duplicates absorbed by the dedupe window.
    pub fn deduped_events(&self) -> u64 {
        self.deduped.load(Ordering::Relaxed)
    }

    /// Successful subscriber (re)connects beyond the first.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// The per-process bridge between the dispatcher and the broker.
pub struct PubSubBridge;

impl PubSubBridge {
    /// Spawn the publisher and subscriber tasks.
    ///
    /// `outbound` feeds from the dispatcher; `delivery` feeds local
    /// fan-out; `topics` is consulted on every subscriber (re)connect.
    /// Cancelling `cancel` stops both tasks; [`BridgeHandle::shutdown`]
    /// does the same and also waits for them.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        outbound: mpsc::Receiver<EventEnvelope>,
        delivery: mpsc::Sender<EventEnvelope>,
        topics: Arc<dyn TopicSource>,
        config: BridgeConfig,
        cancel: CancellationToken,
    ) -> BridgeHandle {
        let (subs_tx, subs_rx) = mpsc::unbounded_channel();

        let buffer = PublishBuffer::new(config.buffer_capacity);
        let dropped = buffer.dropped_counter();
        let deduped = Arc::new(AtomicU64::new(0));
        let reconnects = Arc::new(AtomicU64::new(0));

        let publisher = tokio::spawn(run_publisher(
            broker.clone(),
            outbound,
            buffer,
            config.clone(),
            cancel.clone(),
        ));
        let subscriber = tokio::spawn(run_subscriber(
            broker,
            subs_rx,
            delivery,
            topics,
            config,
            deduped.clone(),
            reconnects.clone(),
            cancel.clone(),
        ));

        BridgeHandle {
            subs_tx,
            dropped,
            deduped,
            reconnects,
            cancel,
            tasks: vec![publisher, subscriber],
        }
    }
}

/// Publisher loop: dispatcher queue → buffer → broker.
async fn run_publisher(
    broker: Arc<dyn Broker>,
    mut outbound: mpsc::Receiver<EventEnvelope>,
    mut buffer: PublishBuffer,
    config: BridgeConfig,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_cap);

    loop {
        if buffer.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = outbound.recv() => match received {
                    Some(envelope) => buffer.push(envelope),
                    None => break,
                },
            }
        }

        while let Some(envelope) = buffer.pop() {
            let wire = match envelope.to_wire() {
                Ok(wire) => wire,
                Err(err) => {
                    warn!(event_id = %envelope.id, error = %err, "unencodable envelope, skipping");
                    continue;
                }
            };
            let topic = envelope.target.to_string();
            match broker.publish(&topic, &wire).await {
                Ok(()) => {
                    backoff.reset();
                    metrics::counter!("bridge_published_total").increment(1);
                    debug!(event_id = %envelope.id, topic = %topic, "published");
                }
                Err(err) => {
                    buffer.requeue_front(envelope);
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        buffered = buffer.len(),
                        "broker publish failed, buffering"
                    );
                    if wait_and_collect(delay, &mut outbound, &mut buffer, &cancel).await {
                        return;
                    }
                    break;
                }
            }
        }
    }
    info!(buffered = buffer.len(), "bridge publisher stopped");
}

/// Sleep out a backoff delay while still accepting outbound envelopes into
/// the buffer. Returns `true` if cancelled.
async fn wait_and_collect(
    delay: Duration,
    outbound: &mut mpsc::Receiver<EventEnvelope>,
    buffer: &mut PublishBuffer,
    cancel: &CancellationToken,
) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return true,
            () = &mut deadline => return false,
            received = outbound.recv() => match received {
                Some(envelope) => buffer.push(envelope),
                // Dispatcher gone; just finish the sleep.
                None => {
                    deadline.await;
                    return false;
                }
            },
        }
    }
}

/// Subscriber loop: broker → dedupe → local fan-out.
#[allow(clippy::too_many_arguments)]
async fn run_subscriber(
    broker: Arc<dyn Broker>,
    mut subs_rx: mpsc::UnboundedReceiver<SubscriptionCommand>,
    delivery: mpsc::Sender<EventEnvelope>,
    topics: Arc<dyn TopicSource>,
    config: BridgeConfig,
    deduped: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_cap);
    let mut recent = RecentIds::new(config.dedupe_window);
    let mut connected_before = false;

    'connect: loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut subscription = match broker.subscriber().await {
            Ok(subscription) => subscription,
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "broker subscribe failed");
                if sleep_cancellable(delay, &cancel).await {
                    break;
                }
                continue;
            }
        };

        // Resubscribe to everything this process currently cares about.
        let snapshot = topics.local_topics();
        for topic in &snapshot {
            if let Err(err) = subscription.subscribe(topic).await {
                warn!(topic = %topic, error = %err, "resubscribe failed, reconnecting");
                let delay = backoff.next_delay();
                if sleep_cancellable(delay, &cancel).await {
                    break 'connect;
                }
                continue 'connect;
            }
        }
        backoff.reset();
        if connected_before {
            let _ = reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bridge_reconnects_total").increment(1);
        }
        connected_before = true;
        info!(topics = snapshot.len(), "bridge subscriber connected");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break 'connect,
                command = subs_rx.recv() => match command {
                    Some(SubscriptionCommand::Subscribe(topic)) => {
                        if let Err(err) = subscription.subscribe(&topic).await {
                            warn!(topic = %topic, error = %err, "subscribe failed, reconnecting");
                            break;
                        }
                    }
                    Some(SubscriptionCommand::Unsubscribe(topic)) => {
                        if let Err(err) = subscription.unsubscribe(&topic).await {
                            warn!(topic = %topic, error = %err, "unsubscribe failed, reconnecting");
                            break;
                        }
                    }
                    None => break 'connect,
                },
                message = subscription.next_message() => match message {
                    Ok(message) => {
                        let envelope = match EventEnvelope::from_wire(&message.payload) {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                warn!(topic = %message.topic, error = %err, "undecodable envelope");
                                metrics::counter!("bridge_decode_errors_total").increment(1);
                                continue;
                            }
                        };
                        if !recent.insert(envelope.id.clone()) {
                            let _ = deduped.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!("bridge_deduped_total").increment(1);
                            debug!(event_id = %envelope.id, "duplicate envelope absorbed");
                            continue;
                        }
                        if delivery.try_send(envelope).is_err() {
                            metrics::counter!("bridge_delivery_overflow_total").increment(1);
                            warn!("local delivery queue full, envelope dropped");
                        }
                    }
                    Err(err) => {
                        let delay = backoff.next_delay();
                        warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "broker read failed");
                        if sleep_cancellable(delay, &cancel).await {
                            break 'connect;
                        }
                        break;
                    }
                },
            }
        }
    }
    info!("bridge subscriber stopped");
}

async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

/// Bounded window of recently seen envelope ids.
struct RecentIds {
    order: VecDeque<EventId>,
    seen: HashSet<EventId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns `false` if it was already in the window.
    fn insert(&mut self, id: EventId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                let _ = self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        let _ = self.seen.insert(id);
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
