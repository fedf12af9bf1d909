//! The immutable event envelope.
//!
//! Two wire shapes share this type. The broker form carries everything —
//! `{id, type, target, data, producedAt, origin?}` — so any process can
//! route it. The client form is exactly `{id, type, data, ts}` on both
//! transports; clients dedupe on `id` and must never see routing fields.
//!
//! IDs are deterministic where the producing action allows: a retried CRUD
//! write that dispatches the same resulting state produces the same
//! envelope id, and the duplicate is absorbed by dedupe instead of
//! double-notifying.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use beacon_core::{ConnectionId, EventId, GatewayError, RoomTopic};

use crate::kind::EventKind;

/// Envelope wrapping one published event.
///
/// Immutable once created; construction validates the payload so nothing
/// downstream needs to re-check it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Envelope id — the client-side dedupe key.
    pub id: EventId,
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Routing target: a room topic or a `user:{id}` topic.
    pub target: RoomTopic,
    /// Event payload. Always a JSON object.
    pub data: Value,
    /// RFC 3339 creation timestamp.
    pub produced_at: String,
    /// Connection that produced the event, when one did (typing). Used to
    /// skip echoing back to the sender; meaningless outside routing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ConnectionId>,
}

impl EventEnvelope {
    /// Build an envelope with a deterministic id derived from its content.
    ///
    /// Returns [`GatewayError::Protocol`] if `data` is not a JSON object.
    pub fn new(kind: EventKind, target: RoomTopic, data: Value) -> Result<Self, GatewayError> {
        validate_payload(kind, &data)?;
        let id = derive_id(kind, &target, &data);
        Ok(Self {
            id,
            kind,
            target,
            data,
            produced_at: chrono::Utc::now().to_rfc3339(),
            origin: None,
        })
    }

    /// Build an envelope with a random id, for actions with no natural
    /// dedupe identity (e.g. typing indicators).
    pub fn new_random(
        kind: EventKind,
        target: RoomTopic,
        data: Value,
    ) -> Result<Self, GatewayError> {
        let mut envelope = Self::new(kind, target, data)?;
        envelope.id = EventId::new();
        Ok(envelope)
    }

    /// Attach the producing connection, so fan-out can skip echoing it.
    #[must_use]
    pub fn from_connection(mut self, origin: ConnectionId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Serialize the broker wire form.
    pub fn to_wire(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the broker wire form.
    pub fn from_wire(raw: &str) -> Result<Self, GatewayError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Serialize the client frame: `{id, type, data, ts}`.
    pub fn to_client_frame(&self) -> Result<String, GatewayError> {
        Ok(serde_json::to_string(&serde_json::json!({
            "id": self.id,
            "type": self.kind,
            "data": self.data,
            "ts": self.produced_at,
        }))?)
    }
}

/// Validate a payload once, at the publish boundary.
fn validate_payload(kind: EventKind, data: &Value) -> Result<(), GatewayError> {
    let Some(object) = data.as_object() else {
        return Err(GatewayError::Protocol(format!(
            "{} payload must be a JSON object",
            kind.as_str()
        )));
    };
    if kind == EventKind::UserStatus {
        let status = object.get("status").and_then(Value::as_str);
        if !matches!(status, Some("online" | "offline")) {
            return Err(GatewayError::Protocol(
                "user_status payload requires status: online|offline".into(),
            ));
        }
    }
    Ok(())
}

/// Derive a deterministic envelope id.
///
/// Hashes `kind | target | payload` (payload canonicalized with sorted
/// keys, so serializer ordering cannot split identical events). A payload
/// carrying a string `dedupeKey` supersedes the payload hash — callers
/// with a natural idempotency key use it directly.
fn derive_id(kind: EventKind, target: &RoomTopic, data: &Value) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(target.to_string().as_bytes());
    hasher.update(b"|");
    match data.get("dedupeKey").and_then(Value::as_str) {
        Some(key) => hasher.update(key.as_bytes()),
        None => hasher.update(canonical_json(data).as_bytes()),
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(36);
    hex.push_str("evt_");
    for byte in &digest[..16] {
        hex.push_str(&format!("{byte:02x}"));
    }
    EventId::from_string(hex)
}

/// Serialize JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
