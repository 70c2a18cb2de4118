//! Layered server configuration

use arcana_core::config::ServerConfig;
use arcana_core::EngineConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `arcana.toml` in the working directory (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables such as `ARCANA__SERVER__PORT`
pub fn load_config(config_file: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(File::with_name("arcana").required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("ARCANA")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
