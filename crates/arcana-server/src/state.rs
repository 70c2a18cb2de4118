//! Application state management

use arcana_core::{GenerationCoordinator, ModelLifecycleManager, PromptAssembler};
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ModelLifecycleManager>,
    pub coordinator: Arc<GenerationCoordinator>,
}

impl AppState {
    pub fn new(manager: Arc<ModelLifecycleManager>, assembler: Arc<dyn PromptAssembler>) -> Self {
        Self {
            coordinator: Arc::new(GenerationCoordinator::new(manager.clone(), assembler)),
            manager,
        }
    }
}
