//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use courier_core::serializer::serialize;
use courier_core::{Envelope, Payload};
use futures::StreamExt;
use futures::stream::SplitStream;
use metrics::counter;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, trace, warn};

use super::connection::ClientConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::manager::SessionLease;
use super::transport::{CLOSE_GOING_AWAY, CLOSE_NORMAL, WebSocketTransport};
use crate::metrics::HEARTBEAT_TIMEOUTS_TOTAL;

/// Event type of the first frame every client receives.
pub const CONNECTION_ESTABLISHED: &str = "connection_established";

/// Heartbeat timing for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// How often liveness is checked.
    pub heartbeat_interval: Duration,
    /// Silence after which the client is dropped.
    pub heartbeat_timeout: Duration,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Close frame, read error or end of stream.
    ClientClosed,
    /// No sign of life within the heartbeat timeout.
    HeartbeatTimeout,
    /// The connection was closed server-side (pruned, replaced, shutdown).
    ServerClosed,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection with the user's facade
/// 2. Sends a `connection_established` envelope
/// 3. Answers application-level `{"type": "ping"}` frames with `pong`
/// 4. Drops the client once the heartbeat times out
/// 5. Removes the connection on disconnect
///
/// The lease is dropped on return, releasing the facade if this was its
/// last session.
#[instrument(skip_all, fields(user_id = %lease.manager().user_id()))]
pub async fn run_ws_session(ws: WebSocket, lease: SessionLease, config: SessionConfig) {
    let manager = lease.manager();
    let (sink, mut stream) = ws.split();
    let transport = Arc::new(WebSocketTransport::new(sink));

    let connection = match manager.open_connection(None, transport) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, code = e.code(), "connection rejected");
            return;
        }
    };
    let conn_id = connection.id.clone();
    info!(conn_id = %conn_id, "client connected");

    let established = Arc::from(established_frame(&connection).to_string());
    if let Err(e) = connection.deliver(established).await {
        warn!(conn_id = %conn_id, error = %e, "failed to send connection_established");
    }

    let heartbeat = run_heartbeat(
        Arc::clone(&connection),
        config.heartbeat_interval,
        config.heartbeat_timeout,
        connection.closed_token(),
    );
    let end = tokio::select! {
        result = heartbeat => match result {
            HeartbeatResult::TimedOut => SessionEnd::HeartbeatTimeout,
            HeartbeatResult::Cancelled => SessionEnd::ServerClosed,
        },
        end = read_loop(&mut stream, &connection) => end,
    };

    match end {
        SessionEnd::HeartbeatTimeout => {
            counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
            warn!(conn_id = %conn_id, timeout = ?config.heartbeat_timeout, "client unresponsive, disconnecting");
            let _ = manager.close_connection(&conn_id, CLOSE_GOING_AWAY, "heartbeat timeout", "heartbeat_timeout");
        }
        SessionEnd::ClientClosed => {
            let _ = manager.close_connection(&conn_id, CLOSE_NORMAL, "client closed", "client_closed");
        }
        SessionEnd::ServerClosed => {}
    }
    info!(conn_id = %conn_id, end = ?end, "client disconnected");
}

async fn read_loop(stream: &mut SplitStream<WebSocket>, connection: &ClientConnection) -> SessionEnd {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn_id = %connection.id, error = %e, "websocket read error");
                return SessionEnd::ClientClosed;
            }
        };
        connection.mark_alive();
        match msg {
            Message::Text(text) => handle_client_frame(text.as_str(), connection).await,
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_client_frame(text, connection).await,
                Err(_) => debug!(conn_id = %connection.id, len = data.len(), "non-UTF8 binary frame ignored"),
            },
            Message::Close(_) => {
                info!(conn_id = %connection.id, "client sent close frame");
                return SessionEnd::ClientClosed;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    SessionEnd::ClientClosed
}

/// Clients only send application pings; anything else is ignored.
async fn handle_client_frame(text: &str, connection: &ClientConnection) {
    if !is_client_ping(text) {
        trace!(conn_id = %connection.id, len = text.len(), "client frame ignored");
        return;
    }
    let pong = Envelope::new("pong", json!({})).into_value().to_string();
    if let Err(e) = connection.deliver(Arc::from(pong)).await {
        debug!(conn_id = %connection.id, error = %e, "failed to answer ping");
    }
}

fn is_client_ping(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ping"))
        .unwrap_or(false)
}

fn established_frame(connection: &ClientConnection) -> Value {
    let mut data = json!({
        "connection_id": connection.id.as_str(),
        "user_id": connection.user_id.as_str(),
        "state": serialize(&Payload::from_enum(&connection.state())),
    });
    if let (Some(thread), Some(map)) = (&connection.thread_id, data.as_object_mut()) {
        let _ = map.insert("thread_id".into(), Value::from(thread.as_str()));
    }
    Envelope::new(CONNECTION_ESTABLISHED, data).into_value()
}
