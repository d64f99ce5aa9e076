//! Leader election using Kubernetes Leases
//!
//! Elects a single active operator instance among replicas using the
//! coordination.k8s.io/v1 Lease API. Only the leader mutates cluster state;
//! followers keep their watches and queues warm so that nothing is lost on
//! promotion.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and the
//! attempt counts as "someone else holds it".
//!
//! # Fail-safe demotion
//!
//! Every successful acquire/renew extends the local validity window to
//! `now + renew_deadline`. [`LeadershipStatus::is_leader`] checks that window
//! on every call, so an instance that cannot renew stops writing once the
//! renew deadline passes, even if its renewal task is stuck. Other instances
//! only take over after `renew_time + lease_duration`, and the renew deadline
//! is shorter than the lease duration, so two instances never both report
//! leadership while clock skew stays below that margin.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::clock::Clock;
use crate::Error;

/// Lease name for the operator leader election
pub const LEADER_LEASE_NAME: &str = "performance-addon-operators";

/// Timing parameters of the election
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    /// How long a lease stays valid after its last renewal
    pub lease_duration: Duration,
    /// The leader demotes itself if it could not renew within this window
    pub renew_deadline: Duration,
    /// Interval between acquire attempts and between renewals
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(137),
            renew_deadline: Duration::from_secs(107),
            retry_period: Duration::from_secs(26),
        }
    }
}

impl LeaseConfig {
    /// Check `retry_period < renew_deadline < lease_duration`
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry_period.is_zero() {
            return Err(Error::configuration("retry period must be positive"));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::configuration(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::configuration(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Outcome of a single acquire/renew attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    /// This instance holds the lease
    Leader,
    /// Another instance holds the lease
    Follower,
}

/// Storage of the lease record
///
/// Writes are conditional: `create` returns `false` when the lease already
/// exists and `replace` returns `false` when the resourceVersion is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` if it does not exist
    async fn get(&self) -> Result<Option<Lease>, Error>;

    /// Create the lease
    async fn create(&self, lease: &Lease) -> Result<bool, Error>;

    /// Replace the lease, conditional on `lease.metadata.resource_version`
    async fn replace(&self, lease: &Lease) -> Result<bool, Error>;
}

/// Lease store backed by the Kubernetes API
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    /// Create a store for the named lease in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<Lease>, Error> {
        match self.api.get(&self.name).await {
            Ok(lease) => Ok(Some(lease)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, lease: &Lease) -> Result<bool, Error> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, Error> {
        match self
            .api
            .replace(&self.name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared view of whether this instance may write
///
/// Cheap to clone; every write path calls [`LeadershipStatus::ensure_leader`]
/// right before mutating cluster state.
#[derive(Clone)]
pub struct LeadershipStatus {
    inner: Arc<LeadershipInner>,
}

struct LeadershipInner {
    always: bool,
    valid_until: Mutex<Option<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl LeadershipStatus {
    /// Status that starts as follower and follows an elector
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(LeadershipInner {
                always: false,
                valid_until: Mutex::new(None),
                clock,
            }),
        }
    }

    /// Status for deployments with leader election disabled
    ///
    /// Every instance acts as the sole leader. Only safe with one replica.
    pub fn always() -> Self {
        Self {
            inner: Arc::new(LeadershipInner {
                always: true,
                valid_until: Mutex::new(None),
                clock: Arc::new(crate::clock::SystemClock),
            }),
        }
    }

    /// Whether this instance currently holds valid leadership
    pub fn is_leader(&self) -> bool {
        if self.inner.always {
            return true;
        }
        let valid_until = *self
            .inner
            .valid_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        matches!(valid_until, Some(deadline) if self.inner.clock.now() < deadline)
    }

    /// Return [`Error::LeadershipLost`] unless this instance is the leader
    pub fn ensure_leader(&self) -> Result<(), Error> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::LeadershipLost)
        }
    }

    /// Mark this instance leader until `deadline`
    pub fn promote_until(&self, deadline: DateTime<Utc>) {
        *self
            .inner
            .valid_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    /// Drop leadership immediately
    pub fn demote(&self) {
        *self
            .inner
            .valid_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl std::fmt::Debug for LeadershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipStatus")
            .field("always", &self.inner.always)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    lease_name: String,
    namespace: String,
    identity: String,
    config: LeaseConfig,
    clock: Arc<dyn Clock>,
    status: LeadershipStatus,
}

impl LeaderElector {
    /// Create a new leader elector
    pub fn new(
        store: Arc<dyn LeaseStore>,
        lease_name: &str,
        namespace: &str,
        identity: &str,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            config,
            status: LeadershipStatus::new(clock.clone()),
            clock,
        }
    }

    /// Leadership view to hand to write paths
    pub fn status(&self) -> LeadershipStatus {
        self.status.clone()
    }

    /// Try to acquire or renew the lease once
    ///
    /// `Leader` extends the local validity window, `Follower` demotes
    /// immediately. On error the status is left alone: the validity window
    /// lapses on its own once the renew deadline passes.
    pub async fn try_acquire_or_renew(&self) -> Result<LeaseState, Error> {
        let now = self.clock.now();

        let state = match self.store.get().await? {
            None => self.create_lease(now).await?,
            Some(lease) => {
                let spec = lease.spec.as_ref();
                let holder = spec.and_then(|s| s.holder_identity.as_deref());

                if holder == Some(self.identity.as_str()) {
                    self.renew_lease(&lease, now).await?
                } else if holder.is_none() || self.is_expired(&lease, now) {
                    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                    self.take_over_lease(&lease, now, transitions).await?
                } else {
                    LeaseState::Follower
                }
            }
        };

        match state {
            LeaseState::Leader => self.status.promote_until(now + chrono_duration(self.config.renew_deadline)),
            LeaseState::Follower => self.status.demote(),
        }
        Ok(state)
    }

    fn is_expired(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        let spec = lease.spec.as_ref();
        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        match (renew_time, duration_secs) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
            _ => true,
        }
    }

    fn lease_for(&self, resource_version: Option<String>, now: DateTime<Utc>, acquire_time: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(acquire_time)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, now: DateTime<Utc>) -> Result<LeaseState, Error> {
        let lease = self.lease_for(None, now, now, 0);
        if self.store.create(&lease).await? {
            info!(identity = %self.identity, lease = %self.lease_name, "Created new lease");
            Ok(LeaseState::Leader)
        } else {
            debug!(identity = %self.identity, "Lease creation conflict, will retry");
            Ok(LeaseState::Follower)
        }
    }

    /// Renew a lease we hold
    async fn renew_lease(&self, existing: &Lease, now: DateTime<Utc>) -> Result<LeaseState, Error> {
        let resource_version = existing.metadata.resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("lease", "lease missing resourceVersion")
        })?;

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
            spec.lease_duration_seconds = Some(self.config.lease_duration.as_secs() as i32);
        }
        updated.metadata.resource_version = Some(resource_version);

        if self.store.replace(&updated).await? {
            debug!(identity = %self.identity, "Lease renewed");
            Ok(LeaseState::Leader)
        } else {
            warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
            Ok(LeaseState::Follower)
        }
    }

    /// Take over an expired or released lease
    async fn take_over_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<LeaseState, Error> {
        let resource_version = existing.metadata.resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("lease", "lease missing resourceVersion")
        })?;

        let lease = self.lease_for(Some(resource_version), now, now, transitions + 1);
        if self.store.replace(&lease).await? {
            info!(
                identity = %self.identity,
                transitions = transitions + 1,
                "Took over expired lease"
            );
            Ok(LeaseState::Leader)
        } else {
            debug!(identity = %self.identity, "Lease takeover conflict, will retry");
            Ok(LeaseState::Follower)
        }
    }

    /// Election loop: acquire, renew, demote, until `shutdown` fires
    ///
    /// Releases the lease on shutdown so a standby can take over without
    /// waiting for expiry.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Starting leader election"
        );

        loop {
            let was_leader = self.status.is_leader();
            match self.try_acquire_or_renew().await {
                Ok(LeaseState::Leader) if !was_leader => {
                    info!(identity = %self.identity, "Leadership acquired");
                }
                Ok(LeaseState::Leader) => {}
                Ok(LeaseState::Follower) if was_leader => {
                    warn!(identity = %self.identity, "Leadership lost to another holder");
                }
                Ok(LeaseState::Follower) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.config.retry_period.as_secs(),
                        "Failed to acquire or renew lease"
                    );
                    if was_leader && !self.status.is_leader() {
                        warn!(identity = %self.identity, "Renew deadline exceeded, demoting");
                        self.status.demote();
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }

        if self.status.is_leader() {
            if let Err(e) = self.release().await {
                warn!(identity = %self.identity, error = %e, "Failed to release lease");
            }
        }
        self.status.demote();
    }

    /// Release the lease by clearing the holder identity
    async fn release(&self) -> Result<(), Error> {
        let Some(mut lease) = self.store.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        if let Some(ref mut spec) = lease.spec {
            spec.holder_identity = None;
        }
        self.status.demote();
        if self.store.replace(&lease).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
