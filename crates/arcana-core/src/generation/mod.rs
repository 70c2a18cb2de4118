//! Streaming text generation
//!
//! [`GenerationEngine`] runs one generation on the inference thread;
//! [`GenerationCoordinator`] is the async entry point that keeps at most one
//! generation in flight and hands callers a [`FragmentStream`].

mod coordinator;
mod engine;
mod params;
mod stream;

pub use coordinator::GenerationCoordinator;
pub use engine::{
    sampler_chain, FinishReason, GenerationEngine, GenerationSession, GenerationSummary,
    TextFragment,
};
pub use params::GenerationParameters;
pub use stream::{FragmentResult, FragmentStream};
