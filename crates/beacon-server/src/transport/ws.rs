//! Bidirectional WebSocket transport.
//!
//! One session task per connection drives the whole lifecycle: bounded
//! authentication, registration and auto-join, a single dispatch loop for
//! inbound control frames, an outbound forwarder with periodic pings, and
//! one teardown path. A fault anywhere ends this connection only — nothing
//! escapes the session task.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use beacon_core::auth::authenticate_with_timeout;
use beacon_core::{RoomTopic, errors::close_code};

use crate::connection::{CloseReason, Connection, TransportKind};
use crate::rooms::{JoinOutcome, LeaveOutcome};
use crate::server::AppState;
use crate::transport::{HandshakeParams, codec, extract_token, teardown_connection};

/// `GET /ws` — WebSocket upgrade.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = extract_token(&params, &headers);
    ws.on_upgrade(move |socket| run_socket_session(socket, state, token))
}

/// Run a WebSocket session from upgrade through teardown.
#[instrument(skip_all)]
async fn run_socket_session(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Connecting → Authenticating, bounded by the handshake window.
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
            info!(error = %err, "websocket handshake rejected");
            metrics::counter!("disconnections_total", "reason" => "auth").increment(1);
            let code = err.close_code().unwrap_or(close_code::UNAUTHORIZED);
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: err.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel::<Arc<str>>(state.config.outbound_queue_capacity);
    let conn = Arc::new(Connection::new(
        decision.user_id,
        TransportKind::Socket,
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
    info!(conn_id = %conn_id, user_id = %conn.user_id, "websocket connected");

    let _ = ws_tx
        .send(Message::Text(codec::hello_frame(&conn_id).into()))
        .await;

    // Outbound forwarder: frames from fan-out, periodic pings, and the
    // close frame once a closer has won the CAS.
    let outbound = tokio::spawn(run_outbound(
        ws_tx,
        rx,
        conn.clone(),
        Duration::from_secs(state.config.ping_interval_secs),
    ));

    // Single inbound dispatch loop.
    let cancel = conn.cancel_token();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            incoming = ws_rx.next() => match incoming {
                Some(Ok(message)) => {
                    if handle_ws_message(&state, &conn, message).await.is_break() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(conn_id = %conn.id, error = %err, "websocket read error");
                    let _ = conn.begin_close(CloseReason::Error);
                    break;
                }
                None => {
                    let _ = conn.begin_close(CloseReason::ClientClosed);
                    break;
                }
            },
        }
    }

    // Let the forwarder flush its close frame, then tear down.
    let _ = tokio::time::timeout(Duration::from_secs(1), outbound).await;
    teardown_connection(&state, &conn);
}

/// Forward outbound frames and pings until the connection closes.
async fn run_outbound(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    conn: Arc<Connection>,
    ping_interval: Duration,
) {
    let cancel = conn.cancel_token();
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick.
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let reason = conn.close_reason().unwrap_or(CloseReason::Error);
                let close = reason.close_code().map(|code| CloseFrame {
                    code,
                    reason: reason.as_str().into(),
                });
                let _ = ws_tx.send(Message::Close(close)).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(text) => {
                    if ws_tx.send(Message::Text(text.to_string().into())).await.is_err() {
                        let _ = conn.begin_close(CloseReason::ClientClosed);
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    let _ = conn.begin_close(CloseReason::ClientClosed);
                    break;
                }
            }
        }
    }
}

/// Dispatch one inbound WebSocket message.
async fn handle_ws_message(
    state: &AppState,
    conn: &Arc<Connection>,
    message: Message,
) -> ControlFlow<()> {
    match message {
        Message::Text(text) => handle_control(state, conn, text.as_str()).await,
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(text) => handle_control(state, conn, text).await,
            Err(_) => {
                warn!(conn_id = %conn.id, len = data.len(), "non-UTF8 binary frame");
                protocol_close(conn)
            }
        },
        Message::Ping(_) | Message::Pong(_) => {
            conn.heartbeat();
            ControlFlow::Continue(())
        }
        Message::Close(_) => {
            let _ = conn.begin_close(CloseReason::ClientClosed);
            ControlFlow::Break(())
        }
    }
}

/// Parse and act on a control frame.
async fn handle_control(state: &AppState, conn: &Arc<Connection>, text: &str) -> ControlFlow<()> {
    let frame = match codec::parse_control(text, state.config.max_frame_bytes) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(conn_id = %conn.id, error = %err, "protocol error");
            metrics::counter!("protocol_errors_total").increment(1);
            return protocol_close(conn);
        }
    };

    match frame.action {
        codec::ControlAction::Ack => {
            let _ = state.registry.heartbeat(&conn.id);
            let _ = conn.send(&Arc::from(codec::pong_frame()));
            ControlFlow::Continue(())
        }
        codec::ControlAction::Join => {
            let Some(topic) = require_room(conn, frame.room.as_deref()) else {
                return ControlFlow::Break(());
            };
            handle_join(state, conn, topic).await;
            ControlFlow::Continue(())
        }
        codec::ControlAction::Leave => {
            let Some(topic) = require_room(conn, frame.room.as_deref()) else {
                return ControlFlow::Break(());
            };
            if let LeaveOutcome::Left { room_now_empty: true } =
                state.rooms.leave(&conn.id, &topic)
            {
                state.bridge.unsubscribe_topic(&topic.to_string());
            }
            send_room_event(conn, "left", &topic);
            ControlFlow::Continue(())
        }
        codec::ControlAction::Typing => {
            let Some(topic) = require_room(conn, frame.room.as_deref()) else {
                return ControlFlow::Break(());
            };
            if state.rooms.is_member(&conn.id, &topic) {
                let _ = state.dispatcher.broadcast_from(
                    &conn.id,
                    topic.clone(),
                    beacon_events::EventKind::Typing,
                    serde_json::json!({
                        "userId": conn.user_id,
                        "room": topic.to_string(),
                    }),
                );
            } else {
                debug!(conn_id = %conn.id, topic = %topic, "typing for non-member room ignored");
            }
            ControlFlow::Continue(())
        }
    }
}

/// Authorize and apply a join request.
async fn handle_join(state: &AppState, conn: &Arc<Connection>, topic: RoomTopic) {
    // Own user room: already auto-joined, idempotent. Someone else's user
    // room (presence watching) and post/conversation rooms go through the
    // injected authorizer.
    let denied = match &topic {
        RoomTopic::User(user_id) if *user_id == conn.user_id => false,
        RoomTopic::User(_) => !state.authorizer.may_join(&conn.user_id, &topic).await,
        _ => {
            topic.requires_authorization()
                && !state.authorizer.may_join(&conn.user_id, &topic).await
        }
    };
    if denied {
        info!(conn_id = %conn.id, user_id = %conn.user_id, topic = %topic, "join denied");
        metrics::counter!("joins_denied_total").increment(1);
        send_room_event(conn, "join_denied", &topic);
        return;
    }

    if let JoinOutcome::Joined { first_in_room: true } = state.rooms.join(&conn.id, &topic) {
        state.bridge.subscribe_topic(&topic.to_string());
    }
    debug!(conn_id = %conn.id, topic = %topic, "joined room");
    send_room_event(conn, "joined", &topic);
}

/// Missing or unparsable room on a room-scoped action is a protocol error.
fn require_room(conn: &Arc<Connection>, room: Option<&str>) -> Option<RoomTopic> {
    let parsed = room.and_then(|raw| RoomTopic::parse(raw).ok());
    if parsed.is_none() {
        warn!(conn_id = %conn.id, ?room, "room-scoped action without valid room");
        metrics::counter!("protocol_errors_total").increment(1);
        let _ = conn.begin_close(CloseReason::Protocol);
    }
    parsed
}

fn protocol_close(conn: &Arc<Connection>) -> ControlFlow<()> {
    let _ = conn.begin_close(CloseReason::Protocol);
    ControlFlow::Break(())
}

/// Direct room lifecycle acknowledgment to one connection.
fn send_room_event(conn: &Arc<Connection>, event: &str, topic: &RoomTopic) {
    let frame = serde_json::json!({
        "id": beacon_core::EventId::new(),
        "type": "notification",
        "data": { "event": event, "room": topic.to_string() },
        "ts": chrono::Utc::now().to_rfc3339(),
    })
    .to_string();
    let _ = conn.send(&Arc::from(frame));
}

// WebSocket sessions need a live upgrade, covered end-to-end in
// tests/integration.rs; pure frame logic lives in codec and is unit-tested
// there.
