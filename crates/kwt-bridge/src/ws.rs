//! WebSocket endpoint: upgrades the connection and wires it to a terminal
//! session against the requested pod.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use kwt_core::types::{AuditAction, AuditEvent, PodRef};
use kwt_exec::ExecRequest;

use crate::api::ApiState;
use crate::audit::record_best_effort;
use crate::session::{run_session, ClientGone, ClientRx, ClientTx};

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub username: Option<String>,
}

/// GET /ws/terminal/{namespace}/{pod}?username=...
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<TerminalQuery>,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let username = query
        .username
        .unwrap_or_else(|| "unknown_user".to_string());
    ws.on_upgrade(move |socket| handle_terminal(socket, state, namespace, pod, username))
}

struct WsClientRx(SplitStream<WebSocket>);

#[async_trait]
impl ClientRx for WsClientRx {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Some(text.to_string()),
                Some(Ok(Message::Binary(data))) => {
                    return Some(String::from_utf8_lossy(&data).into_owned())
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Ping/pong is handled by the library.
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    }
}

struct WsClientTx {
    sink: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl ClientTx for WsClientTx {
    async fn send_text(&mut self, text: &str) -> Result<(), ClientGone> {
        if self.closed {
            return Err(ClientGone);
        }
        self.sink
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|_| {
                self.closed = true;
                ClientGone
            })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

async fn handle_terminal(
    socket: WebSocket,
    state: Arc<ApiState>,
    namespace: String,
    pod: String,
    username: String,
) {
    let pod_ref = PodRef::new(namespace.as_str(), pod.as_str());
    info!(%pod_ref, %username, "terminal session opened");
    record_best_effort(
        state.audit.as_ref(),
        &AuditEvent::now(username.as_str(), &pod_ref, AuditAction::Connected),
    )
    .await;

    let (sink, stream) = socket.split();
    let rx = WsClientRx(stream);
    let mut tx = WsClientTx {
        sink,
        closed: false,
    };

    let request = ExecRequest::shell(&state.config.session.shell);
    match state.factory.open(&namespace, &pod, &request).await {
        Ok(stream) => {
            let idle = Duration::from_secs(state.config.session.idle_timeout_secs);
            let total = Duration::from_secs(state.config.session.total_timeout_secs);
            let end = run_session(rx, tx, stream, idle, total).await;
            info!(%pod_ref, %username, ?end, "terminal session closed");
        }
        Err(e) => {
            warn!(%pod_ref, error = %e, "failed to attach terminal");
            let _ = tx
                .send_text(&format!("failed to attach to {pod_ref}: {e}\r\n"))
                .await;
            tx.close().await;
        }
    }

    record_best_effort(
        state.audit.as_ref(),
        &AuditEvent::now(username.as_str(), &pod_ref, AuditAction::Disconnected),
    )
    .await;
}
