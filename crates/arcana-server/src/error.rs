//! API error handling

use arcana_core::{GenerationError, ModelError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Whether the client should offer a retry
    pub retryable: bool,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status,
            message: message.into(),
            retryable,
        }
    }

    /// JSON body shared by error responses and SSE error events.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "code": self.status.as_u16(),
                "retryable": self.retryable
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        let status = match &err {
            ModelError::DeviceNotSupported(_) | ModelError::InsufficientMemory { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ModelError::ModelNotFound => StatusCode::NOT_FOUND,
            ModelError::ModelCorrupted { .. } | ModelError::LoadingFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ModelError::AlreadyLoading | ModelError::InvalidTransition(_) => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string(), err.is_retryable())
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        let (status, retryable) = match &err {
            GenerationError::InvalidInput(_) | GenerationError::TokenizeFailed(_) => {
                (StatusCode::BAD_REQUEST, false)
            }
            GenerationError::ContextOverflow { .. } => (StatusCode::PAYLOAD_TOO_LARGE, false),
            GenerationError::ModelNotLoaded | GenerationError::Cancelled => {
                (StatusCode::CONFLICT, true)
            }
            GenerationError::DecodeFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, true),
            GenerationError::WorkerUnavailable => (StatusCode::SERVICE_UNAVAILABLE, false),
        };
        Self::new(status, err.to_string(), retryable)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_errors_map_to_status_and_retry() {
        let err = ApiError::from(ModelError::ModelNotFound);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert!(!err.retryable);

        let err = ApiError::from(ModelError::LoadingFailed("context".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.retryable);
    }

    #[test]
    fn test_generation_errors_map_to_status_and_retry() {
        let err = ApiError::from(GenerationError::ContextOverflow {
            prompt_tokens: 4096,
            context_size: 2048,
        });
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert!(!err.retryable);

        let err = ApiError::from(GenerationError::ModelNotLoaded);
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.retryable);
        assert_eq!(err.body()["error"]["code"], 409);
    }
}
