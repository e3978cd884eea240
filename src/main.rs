use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use nai_relay::config::Config;
use nai_relay::image_processor::ImageScrubber;
use nai_relay::nai::NaiClient;
use nai_relay::pipeline::{Pipeline, PipelineConfig};
use nai_relay::routes::AppState;
use nai_relay::store::{
    JsonFileStore, PresetBook, SettingsBook, PRESETS_FILE, SETTINGS_FILE,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    tracing::info!(
        api_key = %config.masked_api_key(),
        api_base = %config.api_base,
        data_dir = %config.data_dir.display(),
        timeout_secs = config.request_timeout.as_secs(),
        job_retention_secs = config.job_retention.as_secs(),
        "Configuration loaded"
    );

    let pipeline = Pipeline::new(
        Arc::new(NaiClient::new(config.api_key.clone(), config.api_base.clone())),
        Arc::new(ImageScrubber),
        PipelineConfig { request_timeout: config.request_timeout, ..PipelineConfig::default() },
    );
    let state = AppState::new(
        pipeline,
        PresetBook::new(Arc::new(JsonFileStore::new(config.data_dir.join(PRESETS_FILE)))),
        SettingsBook::new(Arc::new(JsonFileStore::new(config.data_dir.join(SETTINGS_FILE)))),
    )
    .with_job_retention(config.job_retention);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, nai_relay::router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
