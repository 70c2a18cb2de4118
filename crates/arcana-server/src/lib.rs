//! Arcana Server - HTTP API for on-device tarot readings

pub mod api;
pub mod config;
pub mod error;
pub mod state;

pub use api::create_router;
pub use config::{load_config, AppConfig};
pub use state::AppState;
