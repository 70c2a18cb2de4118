//! Lifecycle state of the on-device model

use std::fmt;

use crate::error::ModelError;

/// Exactly one state is active at a time. `NotLoaded` and `Loaded` are the
/// only rest states; `Checking` and `Loading` last for one `load()` call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModelLifecycleState {
    #[default]
    NotLoaded,
    Checking,
    Loading {
        /// In `[0, 1]`, never decreases within one load
        progress: f32,
    },
    Loaded,
    Error(ModelError),
}

impl ModelLifecycleState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }

    /// A `load()` call owns the state machine.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Checking | Self::Loading { .. })
    }

    pub fn error(&self) -> Option<&ModelError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Progress for UI binding: 0 before loading, 1 once loaded.
    pub fn progress(&self) -> f32 {
        match self {
            Self::NotLoaded | Self::Checking | Self::Error(_) => 0.0,
            Self::Loading { progress } => *progress,
            Self::Loaded => 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotLoaded => "not_loaded",
            Self::Checking => "checking",
            Self::Loading { .. } => "loading",
            Self::Loaded => "loaded",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Display for ModelLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading { progress } => write!(f, "loading ({:.0}%)", progress * 100.0),
            Self::Error(e) => write!(f, "error: {}", e),
            other => f.write_str(other.name()),
        }
    }
}
