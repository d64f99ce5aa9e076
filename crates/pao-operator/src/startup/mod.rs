//! Startup utilities for the operator
//!
//! Everything that runs once before the controller starts.

mod crds;
mod metrics;
mod signals;

pub use crds::{ensure_crds_installed, profile_crd, ConversionWebhook};
pub use metrics::start_metrics_exporter;
pub use signals::shutdown_on_signal;
