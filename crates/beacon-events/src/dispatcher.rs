//! Dispatcher — the entry point CRUD handlers call.
//!
//! [`EventDispatcher::notify_user`] and [`EventDispatcher::broadcast_room`]
//! are the only calls the rest of the platform needs to know about. Both
//! normalize the action into an [`EventEnvelope`] and `try_send` it into a
//! bounded queue drained by the bridge's publisher task. The enqueue never
//! blocks and never fails the caller: a full queue drops the event, bumps a
//! counter, and the originating HTTP write returns untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use beacon_core::{ConnectionId, EventId, GatewayError, RoomTopic, UserId};

use crate::envelope::EventEnvelope;
use crate::kind::EventKind;

/// Create a dispatcher and the receiving end consumed by the bridge.
pub fn dispatch_channel(capacity: usize) -> (EventDispatcher, mpsc::Receiver<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventDispatcher {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Turns domain actions into envelopes and hands them to the publish path.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::Sender<EventEnvelope>,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    /// Send an event to a single user's room (`user:{id}`).
    pub fn notify_user(
        &self,
        user_id: &UserId,
        kind: EventKind,
        data: Value,
    ) -> Result<EventId, GatewayError> {
        let envelope = EventEnvelope::new(kind, RoomTopic::User(user_id.clone()), data)?;
        Ok(self.enqueue(envelope))
    }

    /// Send an event to every member of a room.
    pub fn broadcast_room(
        &self,
        topic: RoomTopic,
        kind: EventKind,
        data: Value,
    ) -> Result<EventId, GatewayError> {
        let envelope = EventEnvelope::new(kind, topic, data)?;
        Ok(self.enqueue(envelope))
    }

    /// Broadcast on behalf of a connection, which is excluded from delivery.
    ///
    /// Typing indicators use this: the sender already knows it is typing.
    /// These carry random ids — repeated keystrokes are distinct events.
    pub fn broadcast_from(
        &self,
        origin: &ConnectionId,
        topic: RoomTopic,
        kind: EventKind,
        data: Value,
    ) -> Result<EventId, GatewayError> {
        let envelope = EventEnvelope::new_random(kind, topic, data)?.from_connection(origin.clone());
        Ok(self.enqueue(envelope))
    }

    /// Emit a `user_status` transition for presence.
    ///
    /// `last_seen` is part of the payload (clients show it), and it also
    /// makes each transition's id unique so a later genuine transition is
    /// never mistaken for a redelivered old one.
    pub fn user_status(
        &self,
        user_id: &UserId,
        online: bool,
        last_seen: &str,
    ) -> Result<EventId, GatewayError> {
        self.notify_user(
            user_id,
            EventKind::UserStatus,
            serde_json::json!({
                "userId": user_id,
                "status": if online { "online" } else { "offline" },
                "lastSeen": last_seen,
            }),
        )
    }

    /// Events dropped because the publish queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fire-and-forget enqueue. A full or closed queue drops the event;
    /// the caller still gets the id it would have had.
    fn enqueue(&self, envelope: EventEnvelope) -> EventId {
        let id = envelope.id.clone();
        if let Err(err) = self.tx.try_send(envelope) {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("dispatch_dropped_total").increment(1);
            warn!(event_id = %id, error = %err, "publish queue full, event dropped");
        }
        id
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn notify_user_targets_user_room() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let user = UserId::from("user_1");
        let id = dispatcher
            .notify_user(&user, EventKind::Notification, json!({"text": "hi"}))
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.target, RoomTopic::User(user));
        assert_eq!(envelope.kind, EventKind::Notification);
    }

    #[tokio::test]
    async fn broadcast_room_targets_topic() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let _ = dispatcher
            .broadcast_room(
                RoomTopic::Post("42".into()),
                EventKind::LikeUpdate,
                json!({"postId": "42", "likes": 5}),
            )
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.target.to_string(), "post:42");
        assert_eq!(envelope.data["likes"], 5);
    }

    #[tokio::test]
    async fn retried_write_produces_same_id() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let first = dispatcher
            .broadcast_room(
                RoomTopic::Post("42".into()),
                EventKind::LikeUpdate,
                json!({"postId": "42", "likes": 5}),
            )
            .unwrap();
        let second = dispatcher
            .broadcast_room(
                RoomTopic::Post("42".into()),
                EventKind::LikeUpdate,
                json!({"postId": "42", "likes": 5}),
            )
            .unwrap();
        assert_eq!(first, second, "handler retry must not mint a new id");
        assert_eq!(rx.recv().await.unwrap().id, first);
        assert_eq!(rx.recv().await.unwrap().id, second);
    }

    #[tokio::test]
    async fn broadcast_from_sets_origin_and_random_id() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let conn = ConnectionId::from("conn_a");
        let a = dispatcher
            .broadcast_from(
                &conn,
                RoomTopic::Conversation("9".into()),
                EventKind::Typing,
                json!({"userId": "user_1"}),
            )
            .unwrap();
        let b = dispatcher
            .broadcast_from(
                &conn,
                RoomTopic::Conversation("9".into()),
                EventKind::Typing,
                json!({"userId": "user_1"}),
            )
            .unwrap();
        assert_ne!(a, b, "typing events are distinct");

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.origin.as_ref().map(AsRef::as_ref), Some("conn_a"));
    }

    #[tokio::test]
    async fn user_status_payload_shape() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let user = UserId::from("user_1");
        let _ = dispatcher
            .user_status(&user, true, "2026-08-06T12:00:00Z")
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EventKind::UserStatus);
        assert_eq!(envelope.data["status"], "online");
        assert_eq!(envelope.data["userId"], "user_1");
        assert_eq!(envelope.data["lastSeen"], "2026-08-06T12:00:00Z");
    }

    #[tokio::test]
    async fn online_offline_online_ids_differ() {
        let (dispatcher, mut rx) = dispatch_channel(8);
        let user = UserId::from("user_1");
        let first = dispatcher
            .user_status(&user, true, "2026-08-06T12:00:00Z")
            .unwrap();
        let _ = dispatcher
            .user_status(&user, false, "2026-08-06T12:05:00Z")
            .unwrap();
        let third = dispatcher
            .user_status(&user, true, "2026-08-06T12:06:00Z")
            .unwrap();
        assert_ne!(
            first, third,
            "a later genuine transition must not dedupe against an old one"
        );
        while rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn full_queue_drops_without_failing_caller() {
        let (dispatcher, _rx) = dispatch_channel(1);
        let user = UserId::from("user_1");
        let first = dispatcher.notify_user(&user, EventKind::Notification, json!({"n": 1}));
        let second = dispatcher.notify_user(&user, EventKind::Notification, json!({"n": 2}));
        assert!(first.is_ok());
        assert!(second.is_ok(), "caller never sees backpressure");
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn closed_queue_drops_without_failing_caller() {
        let (dispatcher, rx) = dispatch_channel(1);
        drop(rx);
        let user = UserId::from("user_1");
        assert!(
            dispatcher
                .notify_user(&user, EventKind::Notification, json!({}))
                .is_ok()
        );
        assert_eq!(dispatcher.dropped(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_the_callers_error() {
        let (dispatcher, _rx) = dispatch_channel(8);
        let user = UserId::from("user_1");
        let result = dispatcher.notify_user(&user, EventKind::Notification, json!(42));
        assert!(result.is_err(), "validation happens before the queue");
        assert_eq!(dispatcher.dropped(), 0);
    }
}
