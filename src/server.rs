use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::notify::Subscription;
use crate::state::TunnelState;
use crate::supervisor::{Supervisor, WorkspaceView};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Deserialize)]
pub struct BootstrapRequest {
    pub workspace_name: String,
    #[serde(default)]
    pub host_token_dir: String,
}

#[derive(Serialize)]
pub struct BootstrapResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub state: TunnelState,
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    pub attached: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/workspaces", get(list_workspaces))
        .route(
            "/api/workspaces/{id}/tunnel",
            get(get_tunnel).post(create_tunnel).delete(delete_tunnel),
        )
        .route("/api/reconcile", post(reconcile))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Health check endpoint for container probes
async fn health_check() -> &'static str {
    "OK"
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.prometheus.map(|h| h.render()).unwrap_or_default()
}

async fn list_workspaces(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkspaceView>>, StatusCode> {
    match state.supervisor.list_workspaces().await {
        Ok(views) => Ok(Json(views)),
        Err(e) => {
            tracing::error!(error = %e, "Workspace listing failed");
            Err(StatusCode::BAD_GATEWAY)
        }
    }
}

async fn get_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelState>, StatusCode> {
    state
        .supervisor
        .get_state(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn create_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BootstrapRequest>,
) -> Json<BootstrapResponse> {
    let (session_id, tunnel) = state
        .supervisor
        .bootstrap(&id, &req.workspace_name, &req.host_token_dir)
        .await;
    Json(BootstrapResponse {
        session_id,
        state: tunnel,
    })
}

/// Deletion contract: stop the monitor, then clear the store entry, before
/// the caller removes the container itself.
async fn delete_tunnel(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.supervisor.stop_monitor(&id);
    state.supervisor.store().clear(&id);
    StatusCode::NO_CONTENT
}

async fn reconcile(State(state): State<AppState>) -> Json<ReconcileResponse> {
    let attached = state.supervisor.reconcile().await;
    Json(ReconcileResponse { attached })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let subscription = state.supervisor.subscribe();
    ws.on_upgrade(move |socket| serve_socket(socket, subscription))
}

/// Push every snapshot to the client; the first message is the snapshot
/// taken at subscribe time. A subscription closed for slowness ends the
/// socket with a normal close frame.
async fn serve_socket(socket: WebSocket, mut subscription: Subscription) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                let Some(snapshot) = snapshot else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let Ok(payload) = serde_json::to_string(&snapshot) else { continue };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // pings are answered by axum itself; ignore the rest
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
