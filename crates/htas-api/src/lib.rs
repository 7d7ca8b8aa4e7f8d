//! htas-api — read-only REST API over the coordination store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | All node profiles |
//! | GET | `/api/v1/nodes/{name}` | One node profile |
//! | GET | `/api/v1/placements` | Placement records |
//! | GET | `/api/v1/intents` | Scaling intents in flight |
//! | GET | `/api/v1/pending` | Unplaced demand per pool |
//! | GET | `/api/v1/alerts` | Operator alerts |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod metrics;

use axum::Router;
use axum::routing::get;
use htas_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
}

/// Build the complete API router.
pub fn build_router(store: StateStore) -> Router {
    let state = ApiState { store };

    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{name}", get(handlers::get_node))
        .route("/placements", get(handlers::list_placements))
        .route("/intents", get(handlers::list_intents))
        .route("/pending", get(handlers::list_pending))
        .route("/alerts", get(handlers::list_alerts))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
