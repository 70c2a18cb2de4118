//! Model lifecycle endpoints

use arcana_core::{CapabilitySnapshot, CapabilityVerdict, ModelLifecycleState};
use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Lifecycle state flattened for clients
#[derive(Debug, Serialize)]
pub struct StateView {
    pub state: &'static str,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorView>,
}

#[derive(Debug, Serialize)]
pub struct ErrorView {
    pub message: String,
    pub retryable: bool,
}

impl From<&ModelLifecycleState> for StateView {
    fn from(state: &ModelLifecycleState) -> Self {
        Self {
            state: state.name(),
            progress: state.progress(),
            error: state.error().map(|e| ErrorView {
                message: e.to_string(),
                retryable: e.is_retryable(),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ModelStatusResponse {
    #[serde(flatten)]
    pub lifecycle: StateView,
    pub capability: CapabilitySnapshot,
    pub verdict: CapabilityVerdict,
}

#[derive(Debug, Serialize)]
pub struct EvictionResponse {
    pub evicted: bool,
    #[serde(flatten)]
    pub lifecycle: StateView,
}

fn lifecycle(state: &AppState) -> StateView {
    StateView::from(&state.manager.state())
}

/// `GET /v1/model`
pub async fn status(State(state): State<AppState>) -> Json<ModelStatusResponse> {
    let (capability, verdict) = state.manager.capability();
    Json(ModelStatusResponse {
        lifecycle: lifecycle(&state),
        capability,
        verdict,
    })
}

/// `POST /v1/model/load`
pub async fn load(State(state): State<AppState>) -> Result<Json<StateView>, ApiError> {
    info!("Model load requested");
    state.manager.load().await?;
    Ok(Json(lifecycle(&state)))
}

/// `POST /v1/model/unload`
pub async fn unload(State(state): State<AppState>) -> Json<StateView> {
    info!("Model unload requested");
    state.manager.unload().await;
    Json(lifecycle(&state))
}

/// `POST /v1/model/reset`
pub async fn reset(State(state): State<AppState>) -> Result<Json<StateView>, ApiError> {
    state.manager.reset_error()?;
    Ok(Json(lifecycle(&state)))
}

/// `POST /v1/model/memory-pressure`
pub async fn memory_pressure(State(state): State<AppState>) -> Json<EvictionResponse> {
    let evicted = state.manager.on_memory_pressure().await;
    Json(EvictionResponse {
        evicted,
        lifecycle: lifecycle(&state),
    })
}
