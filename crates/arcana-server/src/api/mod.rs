//! API routes

mod model;
mod readings;

use arcana_core::config::ServerConfig;
use axum::{
    extract::State,
    http::HeaderValue,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/model", get(model::status))
        .route("/v1/model/load", post(model::load))
        .route("/v1/model/unload", post(model::unload))
        .route("/v1/model/reset", post(model::reset))
        .route("/v1/model/memory-pressure", post(model::memory_pressure))
        .route("/v1/readings", post(readings::create_reading))
        .route("/v1/readings/cancel", post(readings::cancel_reading))
        .with_state(state);

    let router = if server.cors_enabled {
        router.layer(cors_layer(&server.cors_origins))
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.manager.state().name()
    }))
}
