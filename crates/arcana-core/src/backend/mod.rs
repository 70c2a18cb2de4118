//! Seam around the native inference library
//!
//! The lifecycle and generation code only ever talks to these traits. Every
//! handle is created and dropped on the inference worker thread, so none of
//! them need to be `Send`; only the backend factory crosses threads.
//!
//! With the `llama` feature, [`llama::LlamaCppBackend`] implements the seam
//! over `llama-cpp-2`.

#[cfg(feature = "llama")]
pub mod llama;

use std::any::Any;
use std::path::Path;

use crate::config::ModelConfig;
use crate::error::BackendError;

/// Vocabulary index as used by the native library.
pub type TokenId = i32;

/// Factory for native model handles.
pub trait NativeBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    fn load_model(
        &self,
        path: &Path,
        config: &ModelConfig,
    ) -> Result<Box<dyn NativeModel>, BackendError>;
}

/// Loaded weights and vocabulary.
pub trait NativeModel {
    fn new_context(&self, config: &ModelConfig) -> Result<Box<dyn NativeContext>, BackendError>;

    fn new_sampler(&self) -> Result<Box<dyn NativeSampler>, BackendError>;

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, BackendError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of a token's text. May be an incomplete UTF-8 sequence.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>, BackendError>;
}

/// Inference context: KV cache plus sequence-position bookkeeping.
pub trait NativeContext: Any {
    /// Context window in tokens.
    fn context_size(&self) -> u32;

    /// Drop every cached position so the next decode starts a fresh sequence.
    fn clear_cache(&mut self);

    /// Feed `tokens` at positions `start_pos..`, requesting an output
    /// distribution for the final token only.
    fn decode(&mut self, tokens: &[TokenId], start_pos: u32) -> Result<(), BackendError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Distribution-reshaping chain applied before each draw.
pub trait NativeSampler {
    /// Replace the whole chain. Stages apply in slice order.
    fn reset_chain(&mut self, stages: &[SamplerStage]) -> Result<(), BackendError>;

    /// Draw the next token from the context's latest output distribution.
    fn sample(&mut self, context: &mut dyn NativeContext) -> Result<TokenId, BackendError>;
}

/// One step of a sampler chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    Temperature(f32),
    TopK(i32),
    TopP(f32),
    RepetitionPenalty { last_n: i32, penalty: f32 },
    /// Final stochastic draw.
    Distribution { seed: u32 },
}
