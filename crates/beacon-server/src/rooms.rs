//! Local room membership.
//!
//! Topic → member-set and connection → joined-set maps, both sharded.
//! Membership is process-local by design; cross-process consistency comes
//! from the bridge, so joins and leaves report whether the room just
//! became active or idle — the caller turns those edges into broker
//! subscribe/unsubscribe calls.
//!
//! Member lists are snapshotted under the shard lock and handed out as
//! owned vectors; no lock is ever held across a fan-out send.

use std::collections::HashSet;

use dashmap::DashMap;

use beacon_bridge::TopicSource;
use beacon_core::{ConnectionId, RoomTopic};

/// Result of a join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Membership granted; `first_in_room` marks a topic going active.
    Joined {
        /// This connection is the room's first local member.
        first_in_room: bool,
    },
    /// Already a member; joins are idempotent.
    AlreadyMember,
}

/// Result of a leave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Membership removed; `room_now_empty` marks a topic going idle.
    Left {
        /// The room has no local members left.
        room_now_empty: bool,
    },
    /// Was not a member; leaves are idempotent.
    NotMember,
}

/// Per-process topic → member mapping.
#[derive(Default)]
pub struct RoomManager {
    rooms: DashMap<String, HashSet<ConnectionId>>,
    joined: DashMap<ConnectionId, HashSet<String>>,
}

impl RoomManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn_id` to `topic`.
    pub fn join(&self, conn_id: &ConnectionId, topic: &RoomTopic) -> JoinOutcome {
        let key = topic.to_string();
        let inserted = self
            .joined
            .entry(conn_id.clone())
            .or_default()
            .insert(key.clone());
        if !inserted {
            return JoinOutcome::AlreadyMember;
        }
        let mut members = self.rooms.entry(key).or_default();
        let first_in_room = members.is_empty();
        let _ = members.insert(conn_id.clone());
        metrics::gauge!("room_memberships").increment(1.0);
        JoinOutcome::Joined { first_in_room }
    }

    /// Remove `conn_id` from `topic`.
    pub fn leave(&self, conn_id: &ConnectionId, topic: &RoomTopic) -> LeaveOutcome {
        let key = topic.to_string();
        let was_member = self
            .joined
            .get_mut(conn_id)
            .is_some_and(|mut set| set.remove(&key));
        if !was_member {
            return LeaveOutcome::NotMember;
        }
        metrics::gauge!("room_memberships").decrement(1.0);
        let room_now_empty = self.remove_member(&key, conn_id);
        LeaveOutcome::Left { room_now_empty }
    }

    /// Drop a connection from every room it joined, in one pass.
    ///
    /// Returns the topics whose rooms are now empty (to unsubscribe).
    pub fn remove_connection(&self, conn_id: &ConnectionId) -> Vec<String> {
        let Some((_, topics)) = self.joined.remove(conn_id) else {
            return Vec::new();
        };
        metrics::gauge!("room_memberships").decrement(topics.len() as f64);
        topics
            .into_iter()
            .filter(|topic| self.remove_member(topic, conn_id))
            .collect()
    }

    /// Snapshot of a room's local members.
    #[must_use]
    pub fn members(&self, topic: &RoomTopic) -> Vec<ConnectionId> {
        self.rooms
            .get(&topic.to_string())
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is currently a member of `topic`.
    #[must_use]
    pub fn is_member(&self, conn_id: &ConnectionId, topic: &RoomTopic) -> bool {
        self.joined
            .get(conn_id)
            .is_some_and(|topics| topics.contains(&topic.to_string()))
    }

    /// Topics the connection has joined.
    #[must_use]
    pub fn joined_topics(&self, conn_id: &ConnectionId) -> Vec<String> {
        self.joined
            .get(conn_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of rooms with at least one local member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn remove_member(&self, key: &str, conn_id: &ConnectionId) -> bool {
        let Some(mut members) = self.rooms.get_mut(key) else {
            return false;
        };
        let _ = members.remove(conn_id);
        let now_empty = members.is_empty();
        drop(members);
        if now_empty {
            // Entry-lock re-check: a concurrent join may have repopulated.
            let _ = self.rooms.remove_if(key, |_, members| members.is_empty());
        }
        now_empty
    }
}

impl TopicSource for RoomManager {
    fn local_topics(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u32) -> ConnectionId {
        ConnectionId::from(format!("conn_{n}"))
    }

    fn post(id: &str) -> RoomTopic {
        RoomTopic::Post(id.into())
    }

    #[test]
    fn first_join_activates_room() {
        let rooms = RoomManager::new();
        assert_eq!(
            rooms.join(&conn(1), &post("42")),
            JoinOutcome::Joined { first_in_room: true }
        );
        assert_eq!(
            rooms.join(&conn(2), &post("42")),
            JoinOutcome::Joined { first_in_room: false }
        );
        assert_eq!(rooms.members(&post("42")).len(), 2);
    }

    #[test]
    fn join_is_idempotent() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("42"));
        assert_eq!(rooms.join(&conn(1), &post("42")), JoinOutcome::AlreadyMember);
        assert_eq!(rooms.members(&post("42")).len(), 1);
    }

    #[test]
    fn last_leave_idles_room() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("42"));
        let _ = rooms.join(&conn(2), &post("42"));

        assert_eq!(
            rooms.leave(&conn(1), &post("42")),
            LeaveOutcome::Left { room_now_empty: false }
        );
        assert_eq!(
            rooms.leave(&conn(2), &post("42")),
            LeaveOutcome::Left { room_now_empty: true }
        );
        assert_eq!(rooms.room_count(), 0, "empty rooms leave no residue");
    }

    #[test]
    fn leave_is_idempotent() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("42"));
        let _ = rooms.leave(&conn(1), &post("42"));
        assert_eq!(rooms.leave(&conn(1), &post("42")), LeaveOutcome::NotMember);
        assert_eq!(
            rooms.leave(&conn(9), &post("nope")),
            LeaveOutcome::NotMember
        );
    }

    #[test]
    fn join_leave_join_restores_identical_membership() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("42"));
        let _ = rooms.leave(&conn(1), &post("42"));
        assert_eq!(
            rooms.join(&conn(1), &post("42")),
            JoinOutcome::Joined { first_in_room: true }
        );
        assert_eq!(rooms.members(&post("42")), vec![conn(1)]);
    }

    #[test]
    fn remove_connection_clears_all_memberships() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("1"));
        let _ = rooms.join(&conn(1), &post("2"));
        let _ = rooms.join(&conn(1), &RoomTopic::Conversation("9".into()));
        let _ = rooms.join(&conn(2), &post("2"));

        let mut emptied = rooms.remove_connection(&conn(1));
        emptied.sort();
        assert_eq!(emptied, vec!["conversation:9", "post:1"]);
        assert_eq!(rooms.members(&post("2")), vec![conn(2)], "others untouched");
        assert!(rooms.joined_topics(&conn(1)).is_empty());
    }

    #[test]
    fn remove_unknown_connection_is_noop() {
        let rooms = RoomManager::new();
        assert!(rooms.remove_connection(&conn(1)).is_empty());
    }

    #[test]
    fn members_of_unknown_room_is_empty() {
        let rooms = RoomManager::new();
        assert!(rooms.members(&post("42")).is_empty());
    }

    #[test]
    fn joined_topics_lists_connection_rooms() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("1"));
        let _ = rooms.join(&conn(1), &RoomTopic::user("user_1"));
        let mut topics = rooms.joined_topics(&conn(1));
        topics.sort();
        assert_eq!(topics, vec!["post:1", "user:user_1"]);
    }

    #[test]
    fn topic_source_snapshot() {
        let rooms = RoomManager::new();
        let _ = rooms.join(&conn(1), &post("1"));
        let _ = rooms.join(&conn(2), &RoomTopic::user("user_2"));
        let mut topics = rooms.local_topics();
        topics.sort();
        assert_eq!(topics, vec!["post:1", "user:user_2"]);
    }

    #[test]
    fn concurrent_joins_and_leaves_stay_consistent() {
        use std::sync::Arc;

        let rooms = Arc::new(RoomManager::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let rooms = rooms.clone();
                std::thread::spawn(move || {
                    for round in 0..100 {
                        let id = conn(n);
                        let topic = post(&format!("{}", round % 4));
                        let _ = rooms.join(&id, &topic);
                        let _ = rooms.leave(&id, &topic);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(rooms.room_count(), 0);
        for n in 0..8 {
            assert!(rooms.joined_topics(&conn(n)).is_empty());
        }
    }
}
