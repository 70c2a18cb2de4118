//! Arcana Core - On-Device Reading Engine
//!
//! This crate loads a local GGUF language model and streams tarot readings
//! from it, on hardware that can afford to.
//!
//! # Architecture
//!
//! - [`capability::CapabilityGate`] decides whether the device may run the model
//! - [`model::ModelLifecycleManager`] owns the single model slot as an
//!   observable state machine (`NotLoaded → Checking → Loading → Loaded`)
//! - a dedicated inference thread ([`runtime::InferenceWorker`]) is the only
//!   place native handles are created, used and freed
//! - [`generation::GenerationCoordinator`] keeps at most one generation in
//!   flight and hands out cancellable fragment streams
//!
//! # Example
//!
//! ```ignore
//! use arcana_core::backend::llama::LlamaCppBackend;
//! use arcana_core::capability::SystemProbe;
//! use arcana_core::prompt::ChatMlAssembler;
//! use arcana_core::{EngineConfig, GenerationCoordinator, ModelLifecycleManager};
//!
//! let manager = Arc::new(ModelLifecycleManager::new(
//!     EngineConfig::default(),
//!     Arc::new(LlamaCppBackend::new()?),
//!     Arc::new(SystemProbe),
//! )?);
//! manager.load().await?;
//!
//! let coordinator = GenerationCoordinator::new(manager, Arc::new(ChatMlAssembler::default()));
//! let reading = coordinator
//!     .request_generation(&prompt, Default::default())
//!     .collect_text()
//!     .await?;
//! ```

pub mod backend;
pub mod capability;
pub mod config;
pub mod error;
pub mod generation;
pub mod model;
pub mod prompt;
pub mod runtime;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use capability::{CapabilityGate, CapabilitySnapshot, CapabilityVerdict};
pub use config::{CapabilityConfig, EngineConfig, ModelConfig};
pub use error::{BackendError, Error, GenerationError, ModelError, Result};
pub use generation::{
    FragmentStream, GenerationCoordinator, GenerationParameters, TextFragment,
};
pub use model::{ModelLifecycleManager, ModelLifecycleState};
pub use prompt::{ChatMlAssembler, DrawnCard, PromptAssembler, ReadingInput};
