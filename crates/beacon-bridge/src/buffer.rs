//! Bounded publish buffer with drop-oldest overflow.
//!
//! Holds outbound envelopes while the broker is unreachable. This is a
//! fan-out cache-invalidation pattern, not a durable log: on overflow the
//! oldest entry is dropped and counted, and nothing is ever replayed from
//! disk.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use beacon_events::EventEnvelope;

/// FIFO buffer of pending publishes, bounded by entry count.
pub struct PublishBuffer {
    entries: VecDeque<EventEnvelope>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl PublishBuffer {
    /// Create a buffer holding at most `capacity` envelopes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an envelope, dropping the oldest entry on overflow.
    pub fn push(&mut self, envelope: EventEnvelope) {
        if self.entries.len() >= self.capacity {
            let _ = self.entries.pop_front();
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bridge_dropped_events_total").increment(1);
        }
        self.entries.push_back(envelope);
    }

    /// Take the oldest pending envelope.
    pub fn pop(&mut self) -> Option<EventEnvelope> {
        self.entries.pop_front()
    }

    /// Put an envelope back at the front after a failed send.
    pub fn requeue_front(&mut self, envelope: EventEnvelope) {
        self.entries.push_front(envelope);
        // Requeueing can momentarily exceed capacity by one; trim the tail
        // (the newest entry) so the bound holds and ordering is preserved.
        if self.entries.len() > self.capacity {
            let _ = self.entries.pop_back();
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("bridge_dropped_events_total").increment(1);
        }
    }

    /// Pending entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shared handle to the dropped-events counter.
    #[must_use]
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }

    /// Events dropped due to overflow since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
