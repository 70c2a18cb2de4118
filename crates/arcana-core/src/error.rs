//! Error types for the Arcana inference engine

use thiserror::Error;

/// Failures of the model lifecycle.
///
/// A failed load is recorded in [`ModelLifecycleState::Error`](crate::model::ModelLifecycleState)
/// and also returned from [`ModelLifecycleManager::load`](crate::model::ModelLifecycleManager::load).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Device not supported: {0}")]
    DeviceNotSupported(String),

    #[error("Model file not found")]
    ModelNotFound,

    #[error("Model file corrupted: {actual} bytes on disk, expected about {expected}")]
    ModelCorrupted { actual: u64, expected: u64 },

    #[error("Insufficient memory: {available} bytes available, {required} required")]
    InsufficientMemory { available: u64, required: u64 },

    #[error("Model loading failed: {0}")]
    LoadingFailed(String),

    #[error("Model is already loading")]
    AlreadyLoading,

    #[error("Invalid lifecycle transition: {0}")]
    InvalidTransition(String),
}

impl ModelError {
    /// Whether `reset_error()` followed by `load()` can succeed without
    /// changing the device or reinstalling the model file.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::InsufficientMemory { .. }
                | ModelError::LoadingFailed(_)
                | ModelError::AlreadyLoading
        )
    }
}

/// Failures of a single generation. Delivered as the terminal item of a
/// [`FragmentStream`](crate::generation::FragmentStream).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Prompt of {prompt_tokens} tokens does not fit the {context_size}-token context window")]
    ContextOverflow {
        prompt_tokens: usize,
        context_size: usize,
    },

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Decode failed ({0})")]
    DecodeFailed(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference worker is not running")]
    WorkerUnavailable,
}

impl GenerationError {
    /// A failed decode leaves the native context in an unknown state; the
    /// model has to be unloaded and loaded again before the next generation.
    pub fn requires_reload(&self) -> bool {
        matches!(self, GenerationError::DecodeFailed(_))
    }
}

/// Errors raised by the native inference library behind [`crate::backend`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend initialisation failed: {0}")]
    Init(String),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Context creation failed: {0}")]
    Context(String),

    #[error("Sampler creation failed: {0}")]
    Sampler(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Token conversion failed: {0}")]
    Detokenize(String),

    #[error("Inference worker unavailable: {0}")]
    Unavailable(String),
}

/// Crate-level error for setup paths.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, Error>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::LoadingFailed("boom".into()).is_retryable());
        assert!(ModelError::InsufficientMemory {
            available: 1,
            required: 2
        }
        .is_retryable());
        assert!(!ModelError::ModelNotFound.is_retryable());
        assert!(!ModelError::DeviceNotSupported("old".into()).is_retryable());
        assert!(!ModelError::ModelCorrupted {
            actual: 1,
            expected: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_only_decode_failure_requires_reload() {
        assert!(GenerationError::DecodeFailed("token".into()).requires_reload());
        assert!(!GenerationError::Cancelled.requires_reload());
        assert!(!GenerationError::ContextOverflow {
            prompt_tokens: 10,
            context_size: 8
        }
        .requires_reload());
    }
}
