//! The on-device model: artifact, native resource, lifecycle

mod artifact;
mod manager;
mod resource;
mod state;

pub use artifact::{locate_artifact, ModelArtifactDescriptor};
pub use manager::ModelLifecycleManager;
pub use resource::{ConstructionStep, ModelResource, ResourceParts};
pub use state::ModelLifecycleState;
