pub mod api;
pub mod config;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

use crate::api::{ApiContext, ServerError};
use crate::config::{ConfigError, Settings};
use crate::pipeline::{ConversionPipeline, SessionLog};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(std::io::Error),
}

pub async fn run() -> Result<(), StartupError> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("Instrument bridge starting v{}", config::APP_VERSION);

    let settings = Settings::from_env()?;
    config::check_log_root(&settings.log_dir)?;
    tracing::info!(log_dir = %settings.log_dir.display(), "Session log root ready");

    let pipeline = ConversionPipeline::new(
        settings.engine_registry(),
        SessionLog::new(&settings.log_dir),
    );
    let ctx = ApiContext::new(pipeline, settings.max_upload_bytes);
    let mut server = api::start_server(settings.bind, ctx).await?;

    let signal = tokio::signal::ctrl_c().await;
    server.shutdown();
    server.stopped().await;
    signal.map_err(StartupError::Signal)
}
