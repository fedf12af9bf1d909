//! Injected collaborator boundaries.
//!
//! The gateway consumes these interfaces; it never implements the policy
//! behind them. Token issuance, login throttling, and room-participation
//! checks all live in the main platform. [`StaticTokenGate`] exists for
//! tests and single-node development only.
//!
//! The auth gate is consulted exactly once, at handshake. A token that
//! expires mid-session does not retroactively close the connection; that
//! is a documented scope boundary, not a defect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::ids::UserId;
use crate::topic::RoomTopic;

/// Result of a successful token validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthDecision {
    /// The user the token belongs to.
    pub user_id: UserId,
}

/// Validates a bearer token at connection time.
#[async_trait]
pub trait AuthGate: Send + Sync {
    /// Validate `token`, returning the owning user on success.
    ///
    /// Implementations are expected to answer quickly; the gateway wraps
    /// every call in a bounded timeout regardless.
    async fn authenticate(&self, token: &str) -> Result<AuthDecision, GatewayError>;
}

/// Authorizes explicit room joins (`post:{id}`, `conversation:{id}`).
///
/// `user:{id}` rooms are auto-joined and never pass through here.
#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    /// Whether `user_id` may join `topic`.
    async fn may_join(&self, user_id: &UserId, topic: &RoomTopic) -> bool;
}

/// Run `gate.authenticate` under a bounded timeout.
///
/// A gate that does not answer within `timeout` yields
/// [`GatewayError::AuthTimeout`]; the connection closes as unauthorized.
pub async fn authenticate_with_timeout(
    gate: &dyn AuthGate,
    token: &str,
    timeout: Duration,
) -> Result<AuthDecision, GatewayError> {
    match tokio::time::timeout(timeout, gate.authenticate(token)).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::AuthTimeout(
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        )),
    }
}

/// Fixed token → user map for tests and single-node development.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenGate {
    tokens: Arc<HashMap<String, UserId>>,
}

impl StaticTokenGate {
    /// Build a gate from `(token, user_id)` pairs.
    pub fn new<I, T, U>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<UserId>,
    {
        Self {
            tokens: Arc::new(
                pairs
                    .into_iter()
                    .map(|(t, u)| (t.into(), u.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl AuthGate for StaticTokenGate {
    async fn authenticate(&self, token: &str) -> Result<AuthDecision, GatewayError> {
        self.tokens
            .get(token)
            .map(|user_id| AuthDecision {
                user_id: user_id.clone(),
            })
            .ok_or_else(|| GatewayError::AuthRejected("unknown token".into()))
    }
}

/// Authorizer that admits every join. For tests and open deployments.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl RoomAuthorizer for AllowAllAuthorizer {
    async fn may_join(&self, _user_id: &UserId, _topic: &RoomTopic) -> bool {
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
