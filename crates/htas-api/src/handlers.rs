//! REST API handlers.
//!
//! Every handler reads from `StateStore` and returns JSON in the same
//! envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use htas_core::epoch_secs;
use htas_state::{StateResult, Versioned};
use serde::Serialize;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// A stored record with its version inlined.
#[derive(Serialize)]
struct Record<T: Serialize> {
    version: u64,
    #[serde(flatten)]
    record: T,
}

impl<T: Serialize> From<Versioned<T>> for Record<T> {
    fn from(v: Versioned<T>) -> Self {
        Record {
            version: v.version,
            record: v.value,
        }
    }
}

fn list_response<T: Serialize>(listed: StateResult<Vec<Versioned<T>>>) -> axum::response::Response {
    match listed {
        Ok(items) => ApiResponse::ok(items.into_iter().map(Record::from).collect::<Vec<_>>()).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    list_response(state.store.list_profiles())
}

/// GET /api/v1/nodes/{name}
pub async fn get_node(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.store.get_profile(&name) {
        Ok(Some(profile)) => ApiResponse::ok(Record::from(profile)).into_response(),
        Ok(None) => error_response("node not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Coordination records ───────────────────────────────────────

/// GET /api/v1/placements
pub async fn list_placements(State(state): State<ApiState>) -> impl IntoResponse {
    list_response(state.store.list_placements())
}

/// GET /api/v1/intents
pub async fn list_intents(State(state): State<ApiState>) -> impl IntoResponse {
    list_response(state.store.list_intents())
}

/// GET /api/v1/pending
pub async fn list_pending(State(state): State<ApiState>) -> impl IntoResponse {
    list_response(state.store.list_pending())
}

/// GET /api/v1/alerts
pub async fn list_alerts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_alerts() {
        Ok(alerts) => ApiResponse::ok(alerts).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health and metrics ─────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = match state.store.snapshot(epoch_secs()) {
        Ok(snapshot) => snapshot,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    };
    let alerts = state.store.list_alerts().unwrap_or_default();
    let body = crate::metrics::render_prometheus(&snapshot, &alerts);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
