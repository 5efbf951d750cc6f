//! Axum WebSocket server: the wire transport for the event vocabulary. Carries
//! no SPA/static assets/job preview routes — those are out of scope for the broker
//! core. `/ws` is the entire surface plus a small `/api/stats` probe
//! onto the telemetry counters.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use termhub_core::config::BrokerConfig;
use termhub_core::permission::Role;
use termhub_core::session::SessionRegistry;
use termhub_core::workspace::Workspace;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::connection::{ConnectionId, ConnectionRegistry, ConnectionState};
use crate::dispatch::{dispatch, Outbound};
use crate::protocol::{chunk_output, ClientEvent, ServerEvent};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub workspace: Arc<Workspace>,
    pub connections: Arc<ConnectionRegistry>,
    pub cfg: &'static BrokerConfig,
}

#[derive(serde::Deserialize)]
struct IdentityQuery {
    identity: Option<String>,
}

fn resolve_identity(headers: &HeaderMap, query: &IdentityQuery, addr: SocketAddr) -> String {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                if !token.is_empty() {
                    return token.to_string();
                }
            }
        }
    }
    if let Some(ref identity) = query.identity {
        if !identity.is_empty() {
            return identity.clone();
        }
    }
    format!("anon-{addr}")
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = build_router(state)
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await
}

async fn stats_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    use std::sync::atomic::Ordering;
    let t = &state.registry.telemetry;
    Json(serde_json::json!({
        "sessions_created": t.sessions_created.load(Ordering::Relaxed),
        "sessions_closed_graceful": t.sessions_closed_graceful.load(Ordering::Relaxed),
        "sessions_closed_error": t.sessions_closed_error.load(Ordering::Relaxed),
        "bytes_broadcast": t.bytes_broadcast.load(Ordering::Relaxed),
        "clients_dropped_overflow": t.clients_dropped_overflow.load(Ordering::Relaxed),
        "permission_denials": t.permission_denials.load(Ordering::Relaxed),
    }))
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<IdentityQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = resolve_identity(&headers, &query, addr);
    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

#[instrument(skip(socket, state), fields(%identity))]
async fn handle_socket(socket: WebSocket, identity: String, state: AppState) {
    let conn_id = ConnectionId::new();
    let conn_state = Arc::new(ConnectionState::new(identity));
    if state.cfg.open_mode {
        conn_state.set_role(Role::User);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(state.cfg.outbound_queue_capacity);
    let (close_tx, mut close_rx) = watch::channel(false);
    state
        .connections
        .register(conn_id, outbound_tx.clone(), close_tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    let pump = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe_event = outbound_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(_) => {
                let _ = outbound_tx
                    .try_send(ServerEvent::TerminalError {
                        error: "InvalidRequest".to_string(),
                        session: None,
                    });
                continue;
            }
        };
        if let ClientEvent::WorkspaceConnect { ref role } = event {
            if let Some(parsed) = Role::from_wire(role) {
                conn_state.set_role(parsed);
            }
        }

        let requester = conn_state.requester();
        let outcomes = dispatch(event, &requester, &state.registry, &state.workspace, state.cfg).await;
        for outcome in outcomes {
            match outcome {
                Outbound::ToSender(e) => {
                    let _ = outbound_tx.try_send(e);
                }
                Outbound::BroadcastAll(e) => {
                    state.connections.broadcast_all(e, &state.registry.telemetry);
                }
                Outbound::ToSessionSubscribers(_id, _e) => {
                    // Every attached subscriber — including the closer, if it is
                    // one — already has a forwarder task watching the session's
                    // state channel (below); that watch fires exactly once per
                    // Closed* transition. Sending here too would double-deliver
                    // terminal_closed to a closer that is also a subscriber, so
                    // this path is intentionally a no-op.
                }
                Outbound::AttachToSession(session_id, data_rx, state_rx) => {
                    spawn_session_forwarder(
                        session_id,
                        data_rx,
                        state_rx,
                        outbound_tx.clone(),
                        close_tx.clone(),
                        state.registry.telemetry.clone(),
                        state.cfg.max_chunk_bytes,
                    );
                }
            }
        }
    }

    pump.abort();
    state.connections.unregister(conn_id);
}

/// Forwards one session's live output to one connection: chunks PTY bytes into
/// ordered `terminal_output` frames, and emits exactly one `terminal_closed` when
/// the session's state transitions into a Closed* variant.
///
/// Uses `try_send` against the connection's bounded outbound queue rather than a
/// blocking send: per §5/§8 property 11, a subscriber whose queue overflows is
/// dropped within a bounded time so it cannot stall the session's fan-out for
/// everyone else, not left to block this forwarder indefinitely.
fn spawn_session_forwarder(
    session_id: termhub_core::session::SessionId,
    mut data_rx: tokio::sync::broadcast::Receiver<bytes::Bytes>,
    mut state_rx: watch::Receiver<termhub_core::session::SessionState>,
    outbound_tx: mpsc::Sender<ServerEvent>,
    close_tx: watch::Sender<bool>,
    telemetry: Arc<termhub_core::session::Telemetry>,
    max_chunk_bytes: usize,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                data = data_rx.recv() => {
                    match data {
                        Ok(bytes) => {
                            for event in chunk_output(session_id, &bytes, max_chunk_bytes) {
                                if outbound_tx.try_send(event).is_err() {
                                    telemetry.clients_dropped_overflow.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                    let _ = close_tx.send(true);
                                    return;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if state_rx.borrow().is_closed() {
                        let _ = outbound_tx
                            .try_send(ServerEvent::TerminalClosed {
                                session: session_id.to_string(),
                                reason: None,
                            });
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use termhub_core::session::{SessionId, SessionState, Telemetry};
    use tokio::sync::broadcast;

    /// A subscriber forwarder whose outbound queue is never drained overflows on
    /// the first send past its capacity and is signaled to close (§8 property 11),
    /// rather than blocking forever against a full channel.
    #[tokio::test]
    async fn forwarder_signals_close_on_outbound_overflow() {
        let session_id = SessionId::new();
        let (data_tx, data_rx) = broadcast::channel::<bytes::Bytes>(16);
        let (_state_tx, state_rx) = watch::channel(SessionState::Running);
        let (outbound_tx, _outbound_rx) = mpsc::channel::<ServerEvent>(1);
        let (close_tx, mut close_rx) = watch::channel(false);
        let telemetry = Arc::new(Telemetry::default());

        spawn_session_forwarder(
            session_id,
            data_rx,
            state_rx,
            outbound_tx,
            close_tx,
            telemetry.clone(),
            64 * 1024,
        );

        // Nobody ever drains _outbound_rx, so the first publish fills the single
        // slot and the second one finds it still full.
        data_tx.send(bytes::Bytes::from_static(b"first")).unwrap();
        data_tx.send(bytes::Bytes::from_static(b"second")).unwrap();

        tokio::time::timeout(Duration::from_secs(2), close_rx.changed())
            .await
            .expect("forwarder should signal close within the timeout")
            .expect("close_tx sender must not be dropped before signaling");
        assert!(*close_rx.borrow());
        assert_eq!(telemetry.clients_dropped_overflow.load(Ordering::Relaxed), 1);
    }
}
