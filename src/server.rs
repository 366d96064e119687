//! Thin status server (§6): `/healthz`, `/status`, and a
//! `/ws/status-feed` WebSocket that mirrors the bus's status-feed
//! channel verbatim.
//!
//! Generalized from an axum/WS status plumbing base: the chat completion
//! routes and the HTML dashboard body are dropped (the out-of-scope
//! dashboard surface), leaving only the operational read side.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::bus::{channels, Bus};
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub bus: Arc<Bus>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Store, bus: Arc<Bus>) -> Self {
        Self {
            store,
            bus,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/ws/status-feed", get(status_feed_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(state: AppState, bind: &str) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind, "status server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Roster snapshot plus process uptime. Intentionally read-only: no
/// route here can mutate agent or task state.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.store.agents.list().await.unwrap_or_default();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "agents": agents,
    }))
}

/// Mirrors `channel:status-feed` onto the socket as JSON text frames.
/// Inbound client frames are discarded; this is a one-way feed.
async fn status_feed_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (mut sender, mut receiver) = socket.split();
        let mut stream = state.bus.subscribe(channels::STATUS_FEED).await;

        let forward = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(_) => continue,
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize status-feed message");
                        continue;
                    }
                };
                if sender.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while receiver.next().await.is_some() {
            // status-feed is read-only; inbound frames are ignored.
        }
        forward.abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueDelays;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("agency.sqlite3")).await.unwrap();
        let bus = Bus::new(QueueDelays {
            critical: 0,
            urgent: 0,
            high: 0,
            normal: 0,
            low: 0,
            operational: 0,
        });
        AppState::new(store, bus)
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_empty_roster_on_a_fresh_store() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
