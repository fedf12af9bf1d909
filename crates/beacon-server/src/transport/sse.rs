//! One-way SSE push stream transport.
//!
//! Server→client only: the client signals liveness with periodic
//! `POST /realtime/heartbeat` calls, and the server emits a keep-alive
//! comment line so intermediaries do not time the stream out. Frames are
//! the same `{id, type, data, ts}` JSON the WebSocket sends; the opening
//! `connection` event carries the connection id the heartbeat calls need.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, instrument};

use beacon_core::auth::authenticate_with_timeout;
use beacon_core::{ConnectionId, RoomTopic};

use crate::connection::{Connection, TransportKind};
use crate::rooms::JoinOutcome;
use crate::server::AppState;
use crate::transport::{HandshakeParams, codec, extract_token, teardown_connection};

/// Tears the connection down when the response stream is dropped,
/// whichever side ends it first.
struct StreamGuard {
    state: AppState,
    conn: Arc<Connection>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        teardown_connection(&self.state, &self.conn);
    }
}

/// `GET /events` — SSE subscription.
#[instrument(skip_all)]
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
) -> Response {
    let token = extract_token(&params, &headers);
    let timeout = Duration::from_millis(state.config.auth_timeout_ms);
    let decision = match authenticate_with_timeout(
        state.auth.as_ref(),
        token.as_deref().unwrap_or_default(),
        timeout,
    )
    .await
    {
        Ok(decision) => decision,
        Err(err) => {
            info!(error = %err, "sse handshake rejected");
            metrics::counter!("disconnections_total", "reason" => "auth").increment(1);
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };

    let (tx, mut rx) = mpsc::channel::<Arc<str>>(state.config.outbound_queue_capacity);
    let conn = Arc::new(Connection::new(
        decision.user_id,
        TransportKind::Stream,
        tx,
    ));
    let _ = conn.begin_authenticating();
    let _ = conn.open();

    let conn_id = state.registry.register(conn.clone());
    let user_topic = RoomTopic::User(conn.user_id.clone());
    if let JoinOutcome::Joined { first_in_room: true } = state.rooms.join(&conn_id, &user_topic) {
        state.bridge.subscribe_topic(&user_topic.to_string());
    }
    state.presence.on_connect(&conn.user_id);
    info!(conn_id = %conn_id, user_id = %conn.user_id, "sse stream connected");

    let keepalive_secs = state.config.sse_keepalive_secs;
    let hello = Event::default()
        .event("connection")
        .data(codec::hello_frame(&conn_id));
    let cancel = conn.cancel_token();
    let guard = StreamGuard {
        state,
        conn: conn.clone(),
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<Event, Infallible>(hello);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(text) => yield Ok(Event::default().data(text.as_ref())),
                    None => break,
                },
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(keepalive_secs))
                .text("keep-alive"),
        )
        .into_response()
}

/// `POST /realtime/heartbeat?connection=<id>` — SSE client liveness.
#[derive(Debug, Deserialize)]
pub struct HeartbeatParams {
    /// Connection id from the opening `connection` event.
    pub connection: String,
}

/// Refresh a stream connection's heartbeat.
pub async fn heartbeat_handler(
    State(state): State<AppState>,
    Query(params): Query<HeartbeatParams>,
) -> StatusCode {
    if state
        .registry
        .heartbeat(&ConnectionId::from(params.connection))
    {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// SSE sessions need a bound server and a streaming client; covered
// end-to-end in tests/integration.rs.
