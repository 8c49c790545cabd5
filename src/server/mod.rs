//! HTTP surface for the OCR service.
//!
//! A deliberately small API: one upload endpoint and one health endpoint.
//! Everything interesting happens in the worker pool; this module only
//! validates uploads, shapes JSON, and maps pool failures onto HTTP statuses.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::{config::Config, pool::OcrBackend, prelude::*};

/// Shared application state.
pub struct AppState {
    /// The worker pool (or a scripted stand-in under test).
    pub backend: Arc<dyn OcrBackend>,
}

/// Build the API router.
pub fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/ocr", post(handlers::ocr))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listener and serve until interrupted.
pub async fn run_server(config: &Config, backend: Arc<dyn OcrBackend>) -> Result<()> {
    let state = Arc::new(AppState { backend });
    let app = build_router(state, config.max_body_bytes());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;
    info!(%addr, "OCR service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}
