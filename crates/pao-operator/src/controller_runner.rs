//! Controller runner - builds the PerformanceProfile controller future
//!
//! The controller watches profiles and every kind of child they own, so a
//! drifted or deleted child re-triggers its profile. Namespaced children are
//! only watched inside the watch scope.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::node::v1::RuntimeClass;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use pao_common::crd::profile::v2;
use pao_common::crd::{KubeletConfig, MachineConfig, Tuned};
use pao_common::WatchScope;
use pao_profile::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the profile controller future
///
/// The future ends on SIGTERM/Ctrl+C once in-flight reconciliations finish.
pub fn build_profile_controller(
    client: Client,
    ctx: Arc<Context>,
    scope: &WatchScope,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let profiles: Api<v2::PerformanceProfile> = Api::all(client.clone());

    let mut controller = Controller::new(profiles, watcher_config())
        .owns(Api::<MachineConfig>::all(client.clone()), watcher_config())
        .owns(Api::<KubeletConfig>::all(client.clone()), watcher_config())
        .owns(Api::<RuntimeClass>::all(client.clone()), watcher_config());
    for tuned in scope.namespaced_apis::<Tuned>(&client) {
        controller = controller.owns(tuned, watcher_config());
    }

    tracing::info!(
        namespaces = ?scope.namespaces().collect::<Vec<_>>(),
        "- PerformanceProfile controller"
    );

    Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("PerformanceProfile")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
