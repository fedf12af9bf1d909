//! Local fan-out: bridge deliveries → room members.
//!
//! One background task per process. For each envelope it snapshots the
//! room's member list (short shard lock inside the room manager), encodes
//! the client frame once, and sends to every member outside any lock. The
//! producing connection, when recorded, is skipped so typing indicators do
//! not echo.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beacon_events::EventEnvelope;

use crate::connection::ConnectionRegistry;
use crate::rooms::RoomManager;
use crate::transport::codec;

/// Spawn the delivery loop.
pub fn spawn_fanout(
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    mut delivery: mpsc::Receiver<EventEnvelope>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = delivery.recv() => match received {
                    Some(envelope) => deliver(&registry, &rooms, &envelope),
                    None => break,
                },
            }
        }
    })
}

/// Deliver one envelope to the local members of its target room.
fn deliver(registry: &ConnectionRegistry, rooms: &RoomManager, envelope: &EventEnvelope) {
    let members = rooms.members(&envelope.target);
    if members.is_empty() {
        return;
    }
    let frame = match codec::encode_client_frame(envelope) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event_id = %envelope.id, error = %err, "unencodable client frame");
            return;
        }
    };

    let mut delivered = 0u64;
    for member in &members {
        if envelope.origin.as_ref() == Some(member) {
            continue;
        }
        let Some(conn) = registry.get(member) else {
            // Raced with teardown; the member list was a snapshot.
            continue;
        };
        if conn.send(&frame) {
            delivered += 1;
        }
    }
    metrics::counter!("envelopes_delivered_total").increment(delivered);
    debug!(
        event_id = %envelope.id,
        kind = envelope.kind.as_str(),
        target = %envelope.target,
        members = members.len(),
        delivered,
        "fan-out"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, TransportKind};
    use beacon_core::{RoomTopic, UserId};
    use beacon_events::EventKind;
    use serde_json::json;
    use std::time::Duration;

    fn open_conn(
        registry: &ConnectionRegistry,
        user: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(Connection::new(
            UserId::from(user),
            TransportKind::Socket,
            tx,
        ));
        assert!(conn.begin_authenticating());
        assert!(conn.open());
        let _ = registry.register(conn.clone());
        (conn, rx)
    }

    fn like(n: u64) -> EventEnvelope {
        EventEnvelope::new(
            EventKind::LikeUpdate,
            RoomTopic::Post("42".into()),
            json!({"likes": n}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_to_all_room_members() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let (a, mut rx_a) = open_conn(&registry, "user_a");
        let (b, mut rx_b) = open_conn(&registry, "user_b");
        let (_c, mut rx_c) = open_conn(&registry, "user_c");
        let _ = rooms.join(&a.id, &RoomTopic::Post("42".into()));
        let _ = rooms.join(&b.id, &RoomTopic::Post("42".into()));

        deliver(&registry, &rooms, &like(5));

        let frame = rx_a.try_recv().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "like_update");
        assert_eq!(parsed["data"]["likes"], 5);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err(), "non-members receive nothing");
    }

    #[tokio::test]
    async fn origin_connection_is_skipped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let (a, mut rx_a) = open_conn(&registry, "user_a");
        let (b, mut rx_b) = open_conn(&registry, "user_b");
        let topic = RoomTopic::Conversation("9".into());
        let _ = rooms.join(&a.id, &topic);
        let _ = rooms.join(&b.id, &topic);

        let envelope = EventEnvelope::new_random(
            EventKind::Typing,
            topic,
            json!({"userId": "user_a"}),
        )
        .unwrap()
        .from_connection(a.id.clone());

        deliver(&registry, &rooms, &envelope);

        assert!(rx_a.try_recv().is_err(), "sender must not echo");
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn empty_room_is_a_noop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        deliver(&registry, &rooms, &like(1));
    }

    #[tokio::test]
    async fn unregistered_member_is_skipped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let (a, _rx_a) = open_conn(&registry, "user_a");
        let _ = rooms.join(&a.id, &RoomTopic::Post("42".into()));
        let _ = registry.unregister(&a.id);

        // Member list still names the connection; delivery must not panic.
        deliver(&registry, &rooms, &like(1));
    }

    #[tokio::test]
    async fn fanout_task_drains_channel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        let (a, mut rx_a) = open_conn(&registry, "user_a");
        let _ = rooms.join(&a.id, &RoomTopic::Post("42".into()));

        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_fanout(registry, rooms, rx, cancel.clone());

        tx.send(like(5)).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("like_update"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn slow_member_does_not_block_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new());

        // Slow consumer with a single-slot queue, pre-filled.
        let (tx_slow, _rx_slow) = mpsc::channel(1);
        let slow = Arc::new(Connection::new(
            UserId::from("user_slow"),
            TransportKind::Socket,
            tx_slow,
        ));
        assert!(slow.begin_authenticating());
        assert!(slow.open());
        let _ = registry.register(slow.clone());
        assert!(slow.send(&Arc::from("filler")));

        let (healthy, mut rx_healthy) = open_conn(&registry, "user_b");
        let topic = RoomTopic::Post("42".into());
        let _ = rooms.join(&slow.id, &topic);
        let _ = rooms.join(&healthy.id, &topic);

        deliver(&registry, &rooms, &like(9));

        assert!(rx_healthy.try_recv().is_ok(), "healthy member delivered");
        assert!(!slow.is_open(), "slow consumer starts closing");
    }
}
