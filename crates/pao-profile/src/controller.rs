//! PerformanceProfile reconciliation controller
//!
//! Each pass validates the profile, renders its children, applies them and
//! publishes status. Only the elected leader writes: a follower leaves the
//! profile queued, and every write is preceded by a leadership check so a
//! demotion mid-pass stops further writes. Writes are idempotent, so the
//! next leader converges to the same state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use pao_common::crd::profile::v2;
use pao_common::crd::{set_condition, Condition, ConditionStatus, PerformanceProfileStatus};
use pao_common::retry::capped_backoff;
use pao_common::{
    Error, LeaseConfig, LeadershipStatus, WatchScope, FIELD_MANAGER, NODE_TUNING_NAMESPACE,
    PROFILE_OWNER_LABEL,
};
use pao_rollout::{KubePoolClient, RolloutSnapshot, RolloutVerifier, VerifierConfig};

use crate::components::{needs_update, render, Child, ChildKey, ChildKind, DesiredChildren};
use crate::conversion::canonicalize;

/// Attempts per child when replacement hits a resourceVersion conflict
pub const MAX_CONFLICT_RETRIES: u32 = 3;

/// Periodic resync of a converged profile
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// First requeue delay after a failure
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Longest requeue delay after repeated failures
pub const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Profile condition: children applied
pub const CONDITION_AVAILABLE: &str = "Available";
/// Profile condition: target pool still rolling out
pub const CONDITION_PROGRESSING: &str = "Progressing";
/// Profile condition: profile or rollout failed
pub const CONDITION_DEGRADED: &str = "Degraded";

const REASON_AS_EXPECTED: &str = "AsExpected";
const REASON_NOT_OBSERVED: &str = "RolloutNotObserved";

/// Kubernetes operations of the reconciler
///
/// Allows mocking the API server in tests while using the real client in
/// production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProfileClient: Send + Sync {
    /// Fetch a child, `None` if absent
    async fn get_child(&self, key: &ChildKey) -> Result<Option<DynamicObject>, Error>;

    /// Create a child; an existing object yields a 409
    async fn create_child(&self, child: &Child) -> Result<(), Error>;

    /// Replace a child, conditional on `resource_version`
    async fn replace_child(&self, child: &Child, resource_version: &str) -> Result<(), Error>;

    /// Keys of objects of `kind` labelled as owned by `profile`
    async fn list_owned(&self, kind: ChildKind, profile: &str) -> Result<Vec<ChildKey>, Error>;

    /// Delete a child; absent objects are not an error
    async fn delete_child(&self, key: &ChildKey) -> Result<(), Error>;

    /// Merge-patch the profile status
    async fn patch_status(&self, name: &str, status: &PerformanceProfileStatus)
        -> Result<(), Error>;
}

/// [`ProfileClient`] backed by the Kubernetes API
pub struct KubeProfileClient {
    client: Client,
    scope: WatchScope,
}

impl KubeProfileClient {
    /// Create a client; namespaced children are listed only inside `scope`
    pub fn new(client: Client, scope: WatchScope) -> Self {
        Self { client, scope }
    }

    fn api(&self, kind: ChildKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ProfileClient for KubeProfileClient {
    async fn get_child(&self, key: &ChildKey) -> Result<Option<DynamicObject>, Error> {
        let api = self.api(key.kind, key.namespace.as_deref());
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_child(&self, child: &Child) -> Result<(), Error> {
        let key = child.key();
        let api = self.api(key.kind, key.namespace.as_deref());
        api.create(&Self::post_params(), &child.object).await?;
        Ok(())
    }

    async fn replace_child(&self, child: &Child, resource_version: &str) -> Result<(), Error> {
        let key = child.key();
        let api = self.api(key.kind, key.namespace.as_deref());
        let mut object = child.object.clone();
        object.metadata.resource_version = Some(resource_version.to_string());
        api.replace(&key.name, &Self::post_params(), &object).await?;
        Ok(())
    }

    async fn list_owned(&self, kind: ChildKind, profile: &str) -> Result<Vec<ChildKey>, Error> {
        let params = ListParams::default().labels(&format!("{PROFILE_OWNER_LABEL}={profile}"));
        let apis: Vec<Api<DynamicObject>> = if kind.namespaced() {
            self.scope
                .namespaces()
                .map(|ns| self.api(kind, Some(ns)))
                .collect()
        } else {
            vec![self.api(kind, None)]
        };

        let mut keys = Vec::new();
        for api in apis {
            for object in api.list_metadata(&params).await?.items {
                keys.push(ChildKey {
                    kind,
                    namespace: object.metadata.namespace.clone(),
                    name: object.name_any(),
                });
            }
        }
        Ok(keys)
    }

    async fn delete_child(&self, key: &ChildKey) -> Result<(), Error> {
        let api = self.api(key.kind, key.namespace.as_deref());
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        name: &str,
        status: &PerformanceProfileStatus,
    ) -> Result<(), Error> {
        let api: Api<v2::PerformanceProfile> = Api::all(self.client.clone());
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Reconciliation metrics
pub struct ControllerMetrics {
    /// Total reconciliations performed by the leader
    pub reconciliations: metrics::Counter,
    /// Failed reconciliations
    pub errors: metrics::Counter,
    /// Reconciliation duration in seconds
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Register the reconciler metrics with the global recorder
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("performance_profile_reconciliations_total"),
            errors: metrics::counter!("performance_profile_reconciliation_errors_total"),
            duration: metrics::histogram!("performance_profile_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the profile controller
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .leadership(elector.status())
///     .scope(scope)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn ProfileClient>,
    /// Single-shot rollout observation for status, disabled when `None`
    pub verifier: Option<Arc<RolloutVerifier>>,
    /// Whether this instance may write
    pub leadership: LeadershipStatus,
    /// Namespaces children may be written to
    pub scope: WatchScope,
    /// Requeue delay used by followers
    pub retry_period: Duration,
    /// Requeue delay of a converged profile
    pub resync_period: Duration,
    /// Reconciliation metrics
    pub metrics: Option<ControllerMetrics>,
    /// Consecutive failures per profile, reset on success
    error_counts: DashMap<String, u32>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context with custom clients, for unit tests
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ProfileClient>,
        leadership: LeadershipStatus,
        verifier: Option<Arc<RolloutVerifier>>,
    ) -> Self {
        Self {
            kube,
            verifier,
            leadership,
            scope: WatchScope::new([NODE_TUNING_NAMESPACE]),
            retry_period: LeaseConfig::default().retry_period,
            resync_period: DEFAULT_RESYNC_PERIOD,
            metrics: None,
            error_counts: DashMap::new(),
        }
    }

    /// Record a failure of `profile`, returning the consecutive count
    pub fn record_failure(&self, profile: &str) -> u32 {
        let mut count = self.error_counts.entry(profile.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget failures of `profile`
    pub fn reset_failures(&self, profile: &str) {
        self.error_counts.remove(profile);
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn ProfileClient>>,
    verifier: Option<Option<Arc<RolloutVerifier>>>,
    leadership: LeadershipStatus,
    scope: WatchScope,
    retry_period: Duration,
    resync_period: Duration,
    metrics: bool,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            verifier: None,
            leadership: LeadershipStatus::always(),
            scope: WatchScope::new([NODE_TUNING_NAMESPACE]),
            retry_period: LeaseConfig::default().retry_period,
            resync_period: DEFAULT_RESYNC_PERIOD,
            metrics: false,
        }
    }

    /// Override the Kubernetes operations (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn ProfileClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Use a specific verifier, or `None` to disable rollout observation
    pub fn verifier(mut self, verifier: Option<Arc<RolloutVerifier>>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Leadership view from the elector
    pub fn leadership(mut self, leadership: LeadershipStatus) -> Self {
        self.leadership = leadership;
        self
    }

    /// Watched namespaces
    pub fn scope(mut self, scope: WatchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Requeue delay for followers
    pub fn retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Resync period of converged profiles
    pub fn resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Record reconciliation metrics
    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let scope = self.scope;
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeProfileClient::new(client.clone(), scope.clone()))),
            verifier: self.verifier.unwrap_or_else(|| {
                Some(Arc::new(RolloutVerifier::new(
                    Arc::new(KubePoolClient::new(client.clone())),
                    VerifierConfig::default(),
                )))
            }),
            leadership: self.leadership,
            scope,
            retry_period: self.retry_period,
            resync_period: self.resync_period,
            metrics: self.metrics.then(ControllerMetrics::new),
            error_counts: DashMap::new(),
        }
    }
}

/// Reconcile a PerformanceProfile
#[instrument(skip(profile, ctx), fields(profile = %profile.name_any()))]
pub async fn reconcile(
    profile: Arc<v2::PerformanceProfile>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    if !ctx.leadership.is_leader() {
        debug!("Not the leader, leaving profile queued");
        return Ok(Action::requeue(ctx.retry_period));
    }

    let name = profile.name_any();
    let start = Instant::now();
    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let result = reconcile_profile(&profile, &ctx).await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics.errors.increment(1);
        }
    }
    if result.is_ok() {
        ctx.reset_failures(&name);
    }
    result
}

async fn reconcile_profile(profile: &v2::PerformanceProfile, ctx: &Context) -> Result<Action, Error> {
    let canonical = match canonicalize(profile) {
        Ok(canonical) => canonical,
        Err(e @ Error::Validation { .. }) => {
            warn!(error = %e, "Profile failed validation");
            publish_status(profile, ctx, &Outcome::Invalid(&e)).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    info!(generation = ?profile.metadata.generation, "Reconciling PerformanceProfile");
    let desired = render(&canonical)?;

    let applied = match apply_children(ctx, &desired).await {
        Ok(()) => prune_children(ctx, &desired).await,
        Err(e) => Err(e),
    };
    if let Err(e) = applied {
        if !matches!(e, Error::LeadershipLost) {
            if let Err(status_err) = publish_status(profile, ctx, &Outcome::Failed(&e)).await {
                warn!(error = %status_err, "Failed to record degraded status");
            }
        }
        return Err(e);
    }

    let rollout = observe_rollout(ctx, &canonical, &desired).await;
    let in_progress = matches!(&rollout, Some(Ok(snapshot)) if !snapshot.complete());
    publish_status(
        profile,
        ctx,
        &Outcome::Applied {
            desired: &desired,
            rollout: rollout.as_ref(),
        },
    )
    .await?;

    match (&ctx.verifier, in_progress) {
        (Some(verifier), true) => Ok(Action::requeue(verifier.config().poll_interval)),
        _ => Ok(Action::requeue(ctx.resync_period)),
    }
}

/// Apply every desired child, in order
async fn apply_children(ctx: &Context, desired: &DesiredChildren) -> Result<(), Error> {
    for child in &desired.children {
        let key = child.key();
        if !ctx.scope.in_scope(key.namespace.as_deref()) {
            return Err(Error::configuration(format!(
                "{key} is outside the watched namespaces"
            )));
        }
        apply_child(ctx, child).await?;
    }
    Ok(())
}

/// Create-if-absent or replace-if-different, re-reading on conflicts
async fn apply_child(ctx: &Context, child: &Child) -> Result<(), Error> {
    let key = child.key();

    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let result = match ctx.kube.get_child(&key).await? {
            None => {
                ctx.leadership.ensure_leader()?;
                ctx.kube.create_child(child).await
            }
            Some(existing) if !needs_update(&child.object, &existing) => {
                debug!(child = %key, "Child up to date");
                return Ok(());
            }
            Some(existing) => {
                let resource_version = existing.metadata.resource_version.ok_or_else(|| {
                    Error::internal_with_context("apply", format!("{key} has no resourceVersion"))
                })?;
                ctx.leadership.ensure_leader()?;
                ctx.kube.replace_child(child, &resource_version).await
            }
        };

        match result {
            Ok(()) => {
                info!(child = %key, "Applied child");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {
                debug!(child = %key, attempt, "Conflict applying child, re-reading");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::conflict(key.kind.as_str(), key.name, MAX_CONFLICT_RETRIES))
}

/// Delete owned children that are no longer desired
async fn prune_children(ctx: &Context, desired: &DesiredChildren) -> Result<(), Error> {
    let keep = desired.keys();
    for kind in ChildKind::ALL {
        for key in ctx.kube.list_owned(kind, &desired.profile).await? {
            if keep.contains(&key) {
                continue;
            }
            ctx.leadership.ensure_leader()?;
            info!(child = %key, "Deleting child no longer desired");
            ctx.kube.delete_child(&key).await?;
        }
    }
    Ok(())
}

async fn observe_rollout(
    ctx: &Context,
    canonical: &v2::PerformanceProfile,
    desired: &DesiredChildren,
) -> Option<Result<RolloutSnapshot, Error>> {
    let verifier = ctx.verifier.as_ref()?;
    let selector = canonical
        .spec
        .machine_config_pool_selector
        .clone()
        .unwrap_or_default();
    let machine_config = desired.machine_config_name().unwrap_or_default();
    Some(verifier.observe(&selector, &machine_config).await)
}

/// What a reconcile pass ended with
enum Outcome<'a> {
    Invalid(&'a Error),
    Failed(&'a Error),
    Applied {
        desired: &'a DesiredChildren,
        rollout: Option<&'a Result<RolloutSnapshot, Error>>,
    },
}

/// Status after a pass, starting from the current one
fn compute_status(
    current: Option<&PerformanceProfileStatus>,
    generation: Option<i64>,
    outcome: &Outcome<'_>,
) -> PerformanceProfileStatus {
    let mut status = current.cloned().unwrap_or_default();
    status.observed_generation = generation;
    let mut set = |type_: &str, value: ConditionStatus, reason: &str, message: String| {
        set_condition(
            &mut status.conditions,
            Condition::new(type_, value, reason, message),
        );
    };

    match outcome {
        Outcome::Invalid(e) => {
            set(CONDITION_AVAILABLE, ConditionStatus::False, e.reason(), String::new());
            set(CONDITION_PROGRESSING, ConditionStatus::False, e.reason(), String::new());
            set(CONDITION_DEGRADED, ConditionStatus::True, e.reason(), e.to_string());
        }
        Outcome::Failed(e) => {
            set(CONDITION_AVAILABLE, ConditionStatus::False, e.reason(), String::new());
            set(
                CONDITION_PROGRESSING,
                ConditionStatus::Unknown,
                e.reason(),
                "children of this generation were not applied".to_string(),
            );
            set(CONDITION_DEGRADED, ConditionStatus::True, e.reason(), e.to_string());
        }
        Outcome::Applied { desired, rollout } => {
            set(CONDITION_AVAILABLE, ConditionStatus::True, REASON_AS_EXPECTED, String::new());
            match rollout {
                None => {
                    set(
                        CONDITION_PROGRESSING,
                        ConditionStatus::Unknown,
                        REASON_NOT_OBSERVED,
                        "rollout observation disabled".to_string(),
                    );
                    set(CONDITION_DEGRADED, ConditionStatus::False, REASON_AS_EXPECTED, String::new());
                }
                Some(Err(e)) => {
                    set(
                        CONDITION_PROGRESSING,
                        ConditionStatus::Unknown,
                        REASON_NOT_OBSERVED,
                        e.to_string(),
                    );
                    set(CONDITION_DEGRADED, ConditionStatus::False, REASON_AS_EXPECTED, String::new());
                }
                Some(Ok(snapshot)) => {
                    if !snapshot.picked_up {
                        set(
                            CONDITION_PROGRESSING,
                            ConditionStatus::True,
                            "WaitingForPickUp",
                            format!("pool {} has not picked up the configuration yet", snapshot.pool),
                        );
                    } else if !snapshot.complete() {
                        set(
                            CONDITION_PROGRESSING,
                            ConditionStatus::True,
                            "Updating",
                            format!("pool {} is rolling out the configuration", snapshot.pool),
                        );
                    } else {
                        set(CONDITION_PROGRESSING, ConditionStatus::False, REASON_AS_EXPECTED, String::new());
                    }

                    if snapshot.degraded {
                        set(
                            CONDITION_DEGRADED,
                            ConditionStatus::True,
                            "PoolDegraded",
                            format!("pool {} reports Degraded", snapshot.pool),
                        );
                    } else {
                        set(CONDITION_DEGRADED, ConditionStatus::False, REASON_AS_EXPECTED, String::new());
                    }
                }
            }
            status.runtime_class = desired.runtime_class_name();
            status.tuned = desired.tuned_ref();
        }
    }
    status
}

/// Patch status if it changed, leader only
async fn publish_status(
    profile: &v2::PerformanceProfile,
    ctx: &Context,
    outcome: &Outcome<'_>,
) -> Result<(), Error> {
    let status = compute_status(profile.status.as_ref(), profile.metadata.generation, outcome);
    if profile.status.as_ref() == Some(&status) {
        debug!("Status unchanged, skipping patch");
        return Ok(());
    }
    ctx.leadership.ensure_leader()?;
    ctx.kube.patch_status(&profile.name_any(), &status).await
}

/// Requeue policy after a failed reconcile
///
/// Lost leadership requeues at the retry period. Other failures back off
/// exponentially per profile; errors that need a spec change wait the
/// maximum delay.
pub fn error_policy(profile: Arc<v2::PerformanceProfile>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = profile.name_any();
    if matches!(error, Error::LeadershipLost) {
        debug!(profile = %name, "Leadership lost mid-pass, requeueing");
        return Action::requeue(ctx.retry_period);
    }

    let failures = ctx.record_failure(&name);
    let delay = if error.is_retryable() {
        capped_backoff(failures, BACKOFF_BASE, BACKOFF_MAX)
    } else {
        BACKOFF_MAX
    };
    error!(
        ?error,
        profile = %name,
        failures,
        delay_secs = delay.as_secs(),
        "Reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{normalize, SourceVersion, VersionRegistry};
    use pao_common::clock::{Clock, ManualClock};
    use pao_rollout::{PoolClient, RolloutRequest, CONDITION_UPDATED, CONDITION_UPDATING};
    use pao_common::crd::MachineConfigPool;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    fn raw_profile(name: &str, version: &str) -> serde_json::Value {
        json!({
            "apiVersion": format!("performance.openshift.io/{version}"),
            "kind": "PerformanceProfile",
            "metadata": {"name": name, "uid": format!("uid-{name}"), "generation": 1},
            "spec": {
                "cpu": {"reserved": "0-1", "isolated": "2-7"},
                "hugepages": {"defaultHugepagesSize": "1G", "pages": [{"size": "1G", "count": 2}]},
                "nodeSelector": {"node-role.kubernetes.io/worker-cnf": ""}
            }
        })
    }

    fn profile(name: &str) -> v2::PerformanceProfile {
        normalize(raw_profile(name, "v2"), SourceVersion::V2).unwrap()
    }

    fn leader() -> LeadershipStatus {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let status = LeadershipStatus::new(clock.clone());
        status.promote_until(clock.now() + chrono::Duration::days(1));
        status
    }

    fn follower() -> LeadershipStatus {
        LeadershipStatus::new(Arc::new(ManualClock::new(chrono::Utc::now())))
    }

    fn condition_of<'a>(status: &'a PerformanceProfileStatus, type_: &str) -> &'a Condition {
        status
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .unwrap_or_else(|| panic!("missing condition {type_}"))
    }

    /// In-memory API server for children and profile status
    #[derive(Default)]
    struct FakeCluster {
        objects: Mutex<BTreeMap<ChildKey, DynamicObject>>,
        status: Mutex<Option<PerformanceProfileStatus>>,
        writes: Mutex<Vec<String>>,
        next_rv: AtomicUsize,
        demote_after: Mutex<Option<(usize, LeadershipStatus)>>,
    }

    impl FakeCluster {
        fn record_write(&self, what: String) {
            let mut writes = self.writes.lock().unwrap();
            writes.push(what);
            if let Some((after, leadership)) = self.demote_after.lock().unwrap().as_ref() {
                if writes.len() >= *after {
                    leadership.demote();
                }
            }
        }

        fn store(&self, child: &Child) {
            let mut object = child.object.clone();
            let rv = self.next_rv.fetch_add(1, Ordering::SeqCst) + 1;
            object.metadata.resource_version = Some(rv.to_string());
            self.objects.lock().unwrap().insert(child.key(), object);
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        /// Stored objects without server-assigned fields
        fn snapshot(&self) -> BTreeMap<ChildKey, serde_json::Value> {
            self.objects
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| {
                    let mut v = v.clone();
                    v.metadata.resource_version = None;
                    (k.clone(), serde_json::to_value(v).unwrap())
                })
                .collect()
        }
    }

    #[async_trait]
    impl ProfileClient for FakeCluster {
        async fn get_child(&self, key: &ChildKey) -> Result<Option<DynamicObject>, Error> {
            Ok(self.objects.lock().unwrap().get(key).cloned())
        }

        async fn create_child(&self, child: &Child) -> Result<(), Error> {
            if self.objects.lock().unwrap().contains_key(&child.key()) {
                return Err(api_error(409));
            }
            self.store(child);
            self.record_write(format!("create {}", child.key()));
            Ok(())
        }

        async fn replace_child(&self, child: &Child, resource_version: &str) -> Result<(), Error> {
            let current = self
                .objects
                .lock()
                .unwrap()
                .get(&child.key())
                .and_then(|o| o.metadata.resource_version.clone());
            if current.as_deref() != Some(resource_version) {
                return Err(api_error(409));
            }
            self.store(child);
            self.record_write(format!("replace {}", child.key()));
            Ok(())
        }

        async fn list_owned(&self, kind: ChildKind, profile: &str) -> Result<Vec<ChildKey>, Error> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, o)| {
                    k.kind == kind
                        && o.labels().get(PROFILE_OWNER_LABEL).map(String::as_str) == Some(profile)
                })
                .map(|(k, _)| k.clone())
                .collect())
        }

        async fn delete_child(&self, key: &ChildKey) -> Result<(), Error> {
            self.objects.lock().unwrap().remove(key);
            self.record_write(format!("delete {key}"));
            Ok(())
        }

        async fn patch_status(
            &self,
            _name: &str,
            status: &PerformanceProfileStatus,
        ) -> Result<(), Error> {
            *self.status.lock().unwrap() = Some(status.clone());
            self.record_write("status".to_string());
            Ok(())
        }
    }

    /// Pool that picks up `performance-<profile>` once it exists in the
    /// cluster, then rolls it out over a few polls
    struct FakePool {
        cluster: Arc<FakeCluster>,
        machine_config: String,
        nodes: usize,
        rollout_polls: AtomicUsize,
    }

    impl FakePool {
        const POLLS_TO_UPDATE: usize = 3;

        fn state(&self, polls: usize) -> MachineConfigPool {
            let key = ChildKey {
                kind: ChildKind::MachineConfig,
                namespace: None,
                name: self.machine_config.clone(),
            };
            let picked_up = self.cluster.objects.lock().unwrap().contains_key(&key);
            let (sources, updated, updating) = if !picked_up {
                (vec!["00-worker"], "True", "False")
            } else if polls < Self::POLLS_TO_UPDATE {
                (vec!["00-worker", self.machine_config.as_str()], "False", "True")
            } else {
                (vec!["00-worker", self.machine_config.as_str()], "True", "False")
            };
            let source: Vec<_> = sources
                .iter()
                .map(|name| json!({"kind": "MachineConfig", "name": name}))
                .collect();
            serde_json::from_value(json!({
                "apiVersion": "machineconfiguration.openshift.io/v1",
                "kind": "MachineConfigPool",
                "metadata": {"name": "worker-cnf"},
                "spec": {
                    "nodeSelector": {"matchLabels": {"node-role.kubernetes.io/worker-cnf": ""}},
                    "configuration": {"name": "rendered-worker-cnf", "source": source}
                },
                "status": {"conditions": [
                    {"type": "Updated", "status": updated},
                    {"type": "Updating", "status": updating},
                    {"type": "Degraded", "status": "False"}
                ]}
            }))
            .unwrap()
        }

        fn picked_up(&self) -> bool {
            self.state(0).has_config_source(&self.machine_config)
        }
    }

    #[async_trait]
    impl PoolClient for FakePool {
        async fn list_pools(
            &self,
            _selector: &BTreeMap<String, String>,
        ) -> Result<Vec<MachineConfigPool>, Error> {
            Ok(vec![self.state(self.rollout_polls.load(Ordering::SeqCst))])
        }

        async fn get_pool(&self, _name: &str) -> Result<Option<MachineConfigPool>, Error> {
            let polls = if self.picked_up() {
                self.rollout_polls.fetch_add(1, Ordering::SeqCst) + 1
            } else {
                0
            };
            Ok(Some(self.state(polls)))
        }

        async fn count_nodes(&self, _labels: &BTreeMap<String, String>) -> Result<usize, Error> {
            Ok(self.nodes)
        }
    }

    // =========================================================================
    // Leadership gating
    // =========================================================================

    #[tokio::test]
    async fn follower_requeues_without_touching_storage() {
        // Any call on the mock would panic
        let kube = MockProfileClient::new();
        let ctx = Arc::new(Context::for_testing(Arc::new(kube), follower(), None));

        let action = reconcile(Arc::new(profile("p1")), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(ctx.retry_period));
    }

    #[tokio::test]
    async fn demotion_mid_apply_stops_writes_and_next_leader_converges() {
        let cluster = Arc::new(FakeCluster::default());
        let old_leader = leader();
        *cluster.demote_after.lock().unwrap() = Some((2, old_leader.clone()));
        let p2 = Arc::new(profile("p2"));

        let ctx = Arc::new(Context::for_testing(cluster.clone(), old_leader, None));
        let err = reconcile(p2.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::LeadershipLost));
        assert_eq!(cluster.write_count(), 2, "no writes after demotion");
        assert!(cluster.status.lock().unwrap().is_none());
        assert_eq!(error_policy(p2.clone(), &err, ctx.clone()), Action::requeue(ctx.retry_period));

        // A new leader picks up where the old one stopped
        *cluster.demote_after.lock().unwrap() = None;
        let new_ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), None));
        reconcile(p2.clone(), new_ctx).await.unwrap();

        // Same end state as a single uninterrupted pass
        let reference = Arc::new(FakeCluster::default());
        let ref_ctx = Arc::new(Context::for_testing(reference.clone(), leader(), None));
        reconcile(p2, ref_ctx).await.unwrap();
        assert_eq!(cluster.snapshot(), reference.snapshot());
        assert_eq!(cluster.snapshot().len(), 4);
    }

    // =========================================================================
    // Apply
    // =========================================================================

    #[tokio::test]
    async fn creates_all_children_and_publishes_status() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), None));

        let action = reconcile(Arc::new(profile("p1")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_PERIOD));

        let names: Vec<String> = cluster
            .objects
            .lock()
            .unwrap()
            .keys()
            .map(|k| k.name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "performance-p1",
                "performance-p1",
                "performance-p1",
                "openshift-node-performance-p1"
            ]
        );

        let status = cluster.status.lock().unwrap().clone().unwrap();
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.runtime_class.as_deref(), Some("performance-p1"));
        assert_eq!(
            status.tuned.as_deref(),
            Some("openshift-cluster-node-tuning-operator/openshift-node-performance-p1")
        );
        assert_eq!(condition_of(&status, CONDITION_AVAILABLE).status, ConditionStatus::True);
        assert_eq!(condition_of(&status, CONDITION_DEGRADED).status, ConditionStatus::False);
        assert_eq!(condition_of(&status, CONDITION_PROGRESSING).status, ConditionStatus::Unknown);
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), None));
        let mut p1 = profile("p1");

        reconcile(Arc::new(p1.clone()), ctx.clone()).await.unwrap();
        let writes = cluster.write_count();
        assert_eq!(writes, 5);

        p1.status = cluster.status.lock().unwrap().clone();
        reconcile(Arc::new(p1), ctx).await.unwrap();
        assert_eq!(cluster.write_count(), writes);
    }

    #[tokio::test]
    async fn drifted_child_is_replaced() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), None));
        reconcile(Arc::new(profile("p1")), ctx.clone()).await.unwrap();

        let key = ChildKey {
            kind: ChildKind::RuntimeClass,
            namespace: None,
            name: "performance-p1".to_string(),
        };
        cluster.objects.lock().unwrap().get_mut(&key).unwrap().data["handler"] = json!("runc");

        reconcile(Arc::new(profile("p1")), ctx).await.unwrap();
        let stored = cluster.objects.lock().unwrap().get(&key).cloned().unwrap();
        assert_eq!(stored.data["handler"], "high-performance");
        assert!(cluster
            .writes
            .lock()
            .unwrap()
            .contains(&format!("replace {key}")));
    }

    #[tokio::test]
    async fn stale_owned_child_is_deleted() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), None));
        reconcile(Arc::new(profile("p1")), ctx.clone()).await.unwrap();

        let mut leftover = render(&profile("p1")).unwrap().get(ChildKind::RuntimeClass).unwrap().clone();
        leftover.object.metadata.name = Some("performance-p1-old".to_string());
        cluster.store(&leftover);

        reconcile(Arc::new(profile("p1")), ctx).await.unwrap();
        assert!(!cluster.objects.lock().unwrap().contains_key(&leftover.key()));
    }

    #[tokio::test]
    async fn conflicts_exhaust_after_three_attempts() {
        let desired = render(&profile("p1")).unwrap();
        let mut existing = desired.get(ChildKind::MachineConfig).unwrap().object.clone();
        existing.metadata.resource_version = Some("7".to_string());
        existing.data["spec"]["kernelArguments"] = json!(["stale"]);

        let mut kube = MockProfileClient::new();
        kube.expect_get_child()
            .times(3)
            .returning(move |_| Ok(Some(existing.clone())));
        kube.expect_replace_child()
            .times(3)
            .returning(|_, _| Err(api_error(409)));
        kube.expect_patch_status()
            .times(1)
            .withf(|_, status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == CONDITION_DEGRADED && c.reason == "ConflictRetriesExhausted")
            })
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(kube), leader(), None));
        let err = reconcile(Arc::new(profile("p1")), ctx).await.unwrap_err();
        match err {
            Error::Conflict { kind, name, attempts } => {
                assert_eq!(kind, "MachineConfig");
                assert_eq!(name, "performance-p1");
                assert_eq!(attempts, MAX_CONFLICT_RETRIES);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_then_success_is_absorbed() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Context::for_testing(cluster.clone(), leader(), None);
        let child = render(&profile("p1")).unwrap().children[0].clone();

        // Someone else created it first; create hits 409, re-read sees it up to date
        cluster.store(&child);
        let mut kube = MockProfileClient::new();
        let stored = cluster.objects.lock().unwrap().get(&child.key()).cloned();
        kube.expect_get_child().times(1).returning(|_| Ok(None));
        kube.expect_create_child().times(1).returning(|_| Err(api_error(409)));
        kube.expect_get_child()
            .times(1)
            .returning(move |_| Ok(stored.clone()));

        let ctx = Context { kube: Arc::new(kube), ..ctx };
        apply_child(&ctx, &child).await.unwrap();
    }

    // =========================================================================
    // Validation failures
    // =========================================================================

    #[tokio::test]
    async fn invalid_profile_is_degraded_and_not_requeued() {
        let mut p = profile("bad");
        p.spec.node_selector = None;

        let mut kube = MockProfileClient::new();
        kube.expect_patch_status()
            .times(1)
            .withf(|name, status| {
                let degraded = status.conditions.iter().find(|c| c.type_ == CONDITION_DEGRADED);
                name == "bad"
                    && degraded.is_some_and(|c| {
                        c.status == ConditionStatus::True
                            && c.reason == "ValidationFailed"
                            && c.message.contains("spec.nodeSelector")
                    })
            })
            .returning(|_, _| Ok(()));

        let ctx = Arc::new(Context::for_testing(Arc::new(kube), leader(), None));
        let action = reconcile(Arc::new(p), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Error policy
    // =========================================================================

    #[tokio::test]
    async fn backoff_grows_per_profile_and_resets_on_success() {
        let cluster = Arc::new(FakeCluster::default());
        let ctx = Arc::new(Context::for_testing(cluster, leader(), None));
        let p1 = Arc::new(profile("p1"));
        let transient = api_error(500);

        assert_eq!(error_policy(p1.clone(), &transient, ctx.clone()), Action::requeue(Duration::from_secs(5)));
        assert_eq!(error_policy(p1.clone(), &transient, ctx.clone()), Action::requeue(Duration::from_secs(10)));
        assert_eq!(error_policy(p1.clone(), &transient, ctx.clone()), Action::requeue(Duration::from_secs(20)));

        // Other profiles keep their own counter
        let p3 = Arc::new(profile("p3"));
        assert_eq!(error_policy(p3, &transient, ctx.clone()), Action::requeue(Duration::from_secs(5)));

        reconcile(p1.clone(), ctx.clone()).await.unwrap();
        assert_eq!(error_policy(p1, &transient, ctx), Action::requeue(Duration::from_secs(5)));
    }

    #[test]
    fn non_retryable_errors_wait_the_maximum() {
        let ctx = Arc::new(Context::for_testing(Arc::new(MockProfileClient::new()), leader(), None));
        let action = error_policy(
            Arc::new(profile("p1")),
            &Error::configuration("outside scope"),
            ctx,
        );
        assert_eq!(action, Action::requeue(BACKOFF_MAX));
    }

    // =========================================================================
    // Status computation
    // =========================================================================

    #[test]
    fn failed_apply_withdraws_availability() {
        let desired = render(&profile("p1")).unwrap();
        let ok = Ok(RolloutSnapshot {
            pool: "worker-cnf".to_string(),
            picked_up: true,
            updated: true,
            updating: false,
            degraded: false,
        });
        let applied = compute_status(
            None,
            Some(1),
            &Outcome::Applied { desired: &desired, rollout: Some(&ok) },
        );
        assert_eq!(condition_of(&applied, CONDITION_PROGRESSING).status, ConditionStatus::False);

        let err = Error::conflict("Tuned", "openshift-node-performance-p1", 3);
        let failed = compute_status(Some(&applied), Some(2), &Outcome::Failed(&err));
        assert_eq!(failed.observed_generation, Some(2));
        let available = condition_of(&failed, CONDITION_AVAILABLE);
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason, err.reason());
        assert_eq!(condition_of(&failed, CONDITION_PROGRESSING).status, ConditionStatus::Unknown);
        assert_eq!(condition_of(&failed, CONDITION_DEGRADED).status, ConditionStatus::True);
        assert_eq!(failed.runtime_class.as_deref(), Some("performance-p1"));
    }

    #[test]
    fn degraded_pool_marks_profile_degraded() {
        let desired = render(&profile("p1")).unwrap();
        let snapshot = Ok(RolloutSnapshot {
            pool: "worker-cnf".to_string(),
            picked_up: true,
            updated: false,
            updating: true,
            degraded: true,
        });
        let status = compute_status(
            None,
            Some(1),
            &Outcome::Applied { desired: &desired, rollout: Some(&snapshot) },
        );
        assert_eq!(condition_of(&status, CONDITION_DEGRADED).reason, "PoolDegraded");
        assert_eq!(condition_of(&status, CONDITION_PROGRESSING).reason, "Updating");
    }

    // =========================================================================
    // End to end: v1alpha1 profile rolled out to a three node pool
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn v1alpha1_profile_rolls_out_to_pool() {
        let canonical = VersionRegistry::new()
            .normalize(raw_profile("p1", "v1alpha1"))
            .unwrap();
        assert_eq!(canonical.spec.globally_disable_irq_load_balancing, Some(false));

        let cluster = Arc::new(FakeCluster::default());
        let pool = Arc::new(FakePool {
            cluster: cluster.clone(),
            machine_config: "performance-p1".to_string(),
            nodes: 3,
            rollout_polls: AtomicUsize::new(0),
        });
        let verifier = Arc::new(RolloutVerifier::new(pool.clone(), VerifierConfig::default()));
        let ctx = Arc::new(Context::for_testing(cluster.clone(), leader(), Some(verifier.clone())));

        let action = reconcile(Arc::new(canonical.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        assert!(cluster.objects.lock().unwrap().contains_key(&ChildKey {
            kind: ChildKind::MachineConfig,
            namespace: None,
            name: "performance-p1".to_string(),
        }));
        let status = cluster.status.lock().unwrap().clone().unwrap();
        assert_eq!(condition_of(&status, CONDITION_PROGRESSING).status, ConditionStatus::True);

        let selector = canonical.spec.machine_config_pool_selector.clone().unwrap();
        let cancel = CancellationToken::new();
        let updating = verifier
            .await_rollout(
                &RolloutRequest {
                    pool_selector: selector.clone(),
                    machine_config: "performance-p1".to_string(),
                    condition_type: CONDITION_UPDATING.to_string(),
                    desired: ConditionStatus::True,
                    skip_pickup: false,
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(updating.timeout, Duration::from_secs(60 * 60));

        let updated = verifier
            .await_condition(&selector, CONDITION_UPDATED, ConditionStatus::True, &cancel)
            .await
            .unwrap();
        assert_eq!(updated.pool, "worker-cnf");
        assert_eq!(updated.node_count, 3);
        assert_eq!(updated.timeout, Duration::from_secs(60 * 60));

        // Once rolled out, the next pass settles Progressing and resyncs slowly
        let mut settled = canonical;
        settled.status = cluster.status.lock().unwrap().clone();
        let action = reconcile(Arc::new(settled), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_RESYNC_PERIOD));
        let status = cluster.status.lock().unwrap().clone().unwrap();
        assert_eq!(condition_of(&status, CONDITION_PROGRESSING).status, ConditionStatus::False);
    }
}
