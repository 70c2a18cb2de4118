//! Arcana Server - HTTP API for on-device tarot readings

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arcana_core::backend::llama::LlamaCppBackend;
use arcana_core::capability::SystemProbe;
use arcana_core::{ChatMlAssembler, ModelLifecycleManager};
use arcana_server::{create_router, load_config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "arcana_server=debug,arcana_core=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Arcana Server");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path.as_deref())?;
    let [bundled, fallback] = config.engine.artifact_candidates();
    info!("Model artifact: {:?} (fallback {:?})", bundled, fallback);

    // Create model manager on the llama.cpp backend
    let backend = LlamaCppBackend::new()?;
    let manager = Arc::new(ModelLifecycleManager::new(
        config.engine.clone(),
        Arc::new(backend),
        Arc::new(SystemProbe),
    )?);

    if !manager.check_availability() {
        warn!("Local readings unavailable: {}", manager.state());
    } else if config.server.preload {
        if let Err(e) = manager.load().await {
            warn!("Model preload failed: {}", e);
        }
    }

    let state = AppState::new(manager, Arc::new(ChatMlAssembler::default()));

    // Build router
    let app = create_router(state, &config.server);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
