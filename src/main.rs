//! OCR Gateway - authenticated HTTP front door for document OCR.

mod auth;
mod clock;
mod config;
mod envelope;
mod errors;
mod ocr;
mod resilience;
mod routes;
mod validation;

use anyhow::Context;
use clock::SystemClock;
use config::Settings;
use ocr::OcrEngine;
use routes::AppState;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Per-request ceiling for calls to the OCR sidecar.
const OCR_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "ocr_gateway=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    info!(
        "Loaded settings: auth_mode={}, langs={:?}, max_file_mb={}",
        settings.auth_mode, settings.allowed_langs, settings.max_file_mb
    );

    let http_client = reqwest::Client::builder()
        .timeout(OCR_HTTP_TIMEOUT)
        .build()
        .context("Failed to build OCR HTTP client")?;
    let engine = OcrEngine::from_settings(&settings, http_client);

    let state = AppState::new(&settings, engine, Arc::new(SystemClock))
        .context("Invalid authentication configuration")?;
    let app = routes::app(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
