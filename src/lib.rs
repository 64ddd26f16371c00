pub mod api;
pub mod config;
pub mod pipeline;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::api::{start_server, ApiContext, ServerError};
use crate::config::{AppConfig, ConfigError};
use crate::pipeline::extraction::ExtractionError;
use crate::pipeline::material::FsMaterialStore;
use crate::pipeline::processor::build_orchestrator;

/// Fatal errors before or while serving.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Extraction backend setup failed: {0}")]
    Backend(#[from] ExtractionError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the server until Ctrl-C.
pub fn run() -> Result<(), StartupError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let config = AppConfig::from_env()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))
}

async fn serve(config: AppConfig) -> Result<(), StartupError> {
    let materials_dir = config.materials_dir();
    tokio::fs::create_dir_all(&materials_dir).await?;
    tokio::fs::create_dir_all(&config.upload_root).await?;

    // Loading PDFium blocks
    let orchestrator = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || build_orchestrator(&config))
            .await
            .map_err(|e| ExtractionError::Worker(e.to_string()))??
    };
    tracing::info!(
        strategies = ?orchestrator.available_strategies(),
        data_dir = %config.data_dir.display(),
        "Extraction backends ready"
    );

    let bind_addr = config.bind_addr;
    let ctx = ApiContext::new(
        Arc::new(config),
        Arc::new(orchestrator),
        Arc::new(FsMaterialStore::new(materials_dir)),
    );
    let mut server = start_server(bind_addr, ctx).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C, shutting down: {e}");
    }
    server.shutdown();
    server.wait().await;

    tracing::info!("{} stopped", config::APP_NAME);
    Ok(())
}
