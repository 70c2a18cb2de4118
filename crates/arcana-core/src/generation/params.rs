//! Sampling parameters for one generation

use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Immutable per-request sampling settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus cutoff in `(0, 1]`
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// `1.0` disables the penalty
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Seed of the final distribution draw
    #[serde(default = "default_seed")]
    pub seed: u32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repetition_penalty(),
            max_output_tokens: default_max_output_tokens(),
            seed: default_seed(),
        }
    }
}

impl GenerationParameters {
    /// Reject values the sampler chain cannot work with.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(invalid("temperature must be positive"));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(invalid("top_p must be in (0, 1]"));
        }
        if self.top_k == 0 {
            return Err(invalid("top_k must be positive"));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(invalid("repetition_penalty must be positive"));
        }
        if self.max_output_tokens == 0 {
            return Err(invalid("max_output_tokens must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> GenerationError {
    GenerationError::InvalidInput(message.to_string())
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_top_k() -> u32 {
    40
}

fn default_repetition_penalty() -> f32 {
    1.1
}

fn default_max_output_tokens() -> u32 {
    512
}

fn default_seed() -> u32 {
    1234
}
