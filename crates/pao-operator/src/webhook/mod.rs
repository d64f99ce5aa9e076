//! HTTPS webhooks for PerformanceProfile
//!
//! - `POST /convert`: CRD conversion between the served versions
//! - `POST /validate`: validating admission, rejecting profiles the
//!   controller could not render
//!
//! Both endpoints run the version gate and never touch the cluster, so they
//! are served by every replica regardless of leadership.

pub mod conversion;
pub mod validation;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::{
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pao_profile::VersionRegistry;

use crate::config::{CERT_FILE, KEY_FILE};

/// Time in-flight reviews get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Served versions of the PerformanceProfile kind
    pub registry: Arc<VersionRegistry>,
}

impl WebhookState {
    /// Create webhook state around a registry
    pub fn new(registry: Arc<VersionRegistry>) -> Self {
        Self { registry }
    }
}

/// Router with the conversion and validation endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/convert", post(conversion::convert_handler))
        .route("/validate", post(validation::validate_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve the webhooks over TLS until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    cert_dir: &Path,
    state: Arc<WebhookState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert_dir.join(CERT_FILE), cert_dir.join(KEY_FILE))
        .await
        .with_context(|| format!("failed to load webhook certificate from {}", cert_dir.display()))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %addr, "Starting webhook server");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(webhook_router(state).into_make_service())
        .await
        .context("webhook server failed")?;

    info!("Webhook server stopped");
    Ok(())
}
