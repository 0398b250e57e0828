use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::pipeline::EngineSnapshot;

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    cycle: u64,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    segments_corrupt: bool,
}

#[derive(Clone)]
struct AppState {
    snapshot: watch::Receiver<EngineSnapshot>,
}

impl AppState {
    fn latest(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub fn router(snapshot: watch::Receiver<EngineSnapshot>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/segments", get(segments))
        .route("/risk", get(risk))
        .route("/calibration", get(calibration))
        .with_state(AppState { snapshot })
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snap = state.latest();
    let status = if snap.segments_corrupt { "degraded" } else { "ok" };
    Json(Health {
        status,
        cycle: snap.cycle,
        updated_at: snap.updated_at,
        segments_corrupt: snap.segments_corrupt,
    })
}

async fn segments(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.latest().segments)
}

async fn risk(State(state): State<AppState>) -> impl IntoResponse {
    let snap = state.latest();
    match snap.risk {
        Some(risk) => (
            StatusCode::OK,
            Json(serde_json::json!({ "state": risk, "breaker": snap.breaker })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "no cycle has completed yet" })),
        ),
    }
}

async fn calibration(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.latest().calibration)
}

/// Serve until `shutdown` flips to `true`.
pub async fn serve(
    bind: &str,
    snapshot: watch::Receiver<EngineSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind = %bind, "inspection server listening");
    axum::serve(listener, router(snapshot))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
