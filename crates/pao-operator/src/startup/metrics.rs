//! Prometheus exporter

use std::net::SocketAddr;

use anyhow::Context as _;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Install the global recorder and serve `/metrics` on `addr`
///
/// Must be called from within the Tokio runtime.
pub fn start_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    info!(address = %addr, "Starting metrics exporter");
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")
}
