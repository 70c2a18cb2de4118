//! Reading generation endpoints

use arcana_core::{GenerationParameters, ReadingInput};
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Reading request
#[derive(Debug, Deserialize)]
pub struct ReadingRequest {
    #[serde(flatten)]
    pub input: ReadingInput,
    /// Stream fragments as server-sent events
    #[serde(default)]
    pub stream: bool,
    /// Sampling overrides; the engine's configured defaults otherwise
    #[serde(default)]
    pub params: Option<GenerationParameters>,
}

/// Non-streaming reading response
#[derive(Debug, Serialize)]
pub struct ReadingResponse {
    pub id: Uuid,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// `POST /v1/readings`
pub async fn create_reading(
    State(state): State<AppState>,
    Json(req): Json<ReadingRequest>,
) -> Result<Response, ApiError> {
    let params = req
        .params
        .unwrap_or(state.manager.config().generation);
    info!(
        "Reading request: {} cards, stream: {}",
        req.input.cards.len(),
        req.stream
    );

    let fragments = state.coordinator.request_reading(&req.input, params);
    let id = fragments.id();

    if !req.stream {
        let text = fragments.collect_text().await?;
        return Ok(Json(ReadingResponse { id, text }).into_response());
    }

    // Dropping the response body drops `fragments`, which cancels the
    // generation on its next token.
    let events = async_stream::stream! {
        let mut fragments = fragments;
        while let Some(item) = fragments.next().await {
            match item {
                Ok(fragment) => match Event::default().json_data(&fragment) {
                    Ok(event) => yield Ok::<Event, Infallible>(event),
                    Err(e) => warn!("Failed to encode fragment: {}", e),
                },
                Err(e) => {
                    let error = ApiError::from(e);
                    yield Ok(Event::default().event("error").data(error.body().to_string()));
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// `POST /v1/readings/cancel`
pub async fn cancel_reading(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.coordinator.cancel_current(),
    })
}
