use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dropwatch_detector::{BroadcastHub, Outbound, SnapshotStore, StorageError};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub hub: Arc<BroadcastHub>,
    pub store: Arc<SnapshotStore>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/snapshots", get(list_snapshots))
        .route("/snapshots/:name", get(get_snapshot))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// GET /ws: live annotated frames (binary) and trigger events (text)
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| client_session(socket, hub))
}

async fn client_session(socket: WebSocket, hub: Arc<BroadcastHub>) {
    let (id, mut mailbox) = hub.connect();
    let (mut tx, mut rx) = socket.split();
    debug!(client = %id, "websocket session started");

    loop {
        tokio::select! {
            outbound = mailbox.recv() => {
                let msg = match outbound {
                    Some(Outbound::Binary(frame)) => Message::Binary(frame.to_vec()),
                    Some(Outbound::Text(text)) => Message::Text(text),
                    // Hub already dropped this client
                    None => break,
                };
                if let Err(e) = tx.send(msg).await {
                    debug!(client = %id, error = %e, "websocket send failed");
                    break;
                }
            }
            incoming = rx.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client = %id, error = %e, "websocket receive failed");
                    break;
                }
                // Client text is only a keep-alive
                Some(Ok(_)) => {}
            }
        }
    }

    hub.disconnect(id);
    debug!(client = %id, clients = hub.len(), "websocket session ended");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /snapshots: stored snapshot names, most recent first
async fn list_snapshots(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list().await {
        Ok(names) => Json(json!({ "ok": true, "snapshots": names })).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list snapshots");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /snapshots/:name: raw JPEG
async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match state.store.read(&name).await {
        Ok(Some(data)) => ([(header::CONTENT_TYPE, "image/jpeg")], data).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(StorageError::InvalidName(_)) => StatusCode::BAD_REQUEST.into_response(),
        Err(e) => {
            error!(error = %e, name, "failed to read snapshot");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}
