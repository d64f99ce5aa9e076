//! Poll-based rollout verification
//!
//! Completion is a two step protocol. First the pool must reference the
//! generated MachineConfig in `spec.configuration.source` (pick-up), then the
//! awaited condition must reach the desired status. A pool reporting
//! `Updated=True` before pick-up is describing the previous configuration
//! and says nothing about ours.
//!
//! Every poll reads fresh objects. Time goes through `tokio::time` so waits
//! can be driven by a paused runtime clock.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pao_common::crd::{ConditionStatus, MachineConfigPool};
use pao_common::error::RolloutStage;
use pao_common::Error;

use crate::client::{label_selector, PoolClient};

/// Pool condition set once every node runs the target configuration
pub const CONDITION_UPDATED: &str = "Updated";
/// Pool condition set while nodes are being updated
pub const CONDITION_UPDATING: &str = "Updating";
/// Pool condition set when a node failed to apply the configuration
pub const CONDITION_DEGRADED: &str = "Degraded";

const PICKUP_CONDITION: &str = "spec.configuration.source";

/// Timing of the verifier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifierConfig {
    /// Time allowed per node in the pool
    pub per_node_budget: Duration,
    /// Interval between polls
    pub poll_interval: Duration,
    /// Time allowed for the pool to reference the generated configuration
    pub pickup_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            per_node_budget: Duration::from_secs(20 * 60),
            poll_interval: Duration::from_secs(30),
            pickup_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Successful wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reached {
    /// Pool that reached the desired state
    pub pool: String,
    /// Nodes in the pool when the wait started
    pub node_count: usize,
    /// Timeout the wait ran under
    pub timeout: Duration,
    /// Time spent waiting
    pub elapsed: Duration,
}

/// Single observation of a pool, used for status reporting
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RolloutSnapshot {
    /// Pool name
    pub pool: String,
    /// The pool references the generated configuration
    pub picked_up: bool,
    /// `Updated=True`
    pub updated: bool,
    /// `Updating=True`
    pub updating: bool,
    /// `Degraded=True`
    pub degraded: bool,
}

impl RolloutSnapshot {
    /// Picked up and fully rolled out
    pub fn complete(&self) -> bool {
        self.picked_up && self.updated && !self.updating
    }
}

/// Parameters of a full rollout wait
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutRequest {
    /// Labels selecting exactly one pool
    pub pool_selector: BTreeMap<String, String>,
    /// Generated MachineConfig the pool has to pick up
    pub machine_config: String,
    /// Condition to await once picked up
    pub condition_type: String,
    /// Desired condition status
    pub desired: ConditionStatus,
    /// Skip the pick-up stage
    pub skip_pickup: bool,
}

/// Timeout for a pool of `node_count` nodes
///
/// A pool with no nodes is a misconfiguration, never a trivially complete
/// rollout.
pub fn compute_timeout(node_count: usize, per_node_budget: Duration) -> Result<Duration, Error> {
    if node_count == 0 {
        return Err(Error::configuration(
            "pool selects zero nodes, a rollout can never be observed",
        ));
    }
    let nodes = u32::try_from(node_count).unwrap_or(u32::MAX);
    Ok(per_node_budget.saturating_mul(nodes))
}

enum Probe<T> {
    Ready(T),
    Pending(Option<String>),
}

/// Waits for pools to pick up and apply generated configuration
pub struct RolloutVerifier {
    client: Arc<dyn PoolClient>,
    config: VerifierConfig,
}

impl RolloutVerifier {
    /// Create a verifier
    pub fn new(client: Arc<dyn PoolClient>, config: VerifierConfig) -> Self {
        Self { client, config }
    }

    /// Timing in use
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Resolve the single pool matching `selector`
    pub async fn resolve_pool(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<MachineConfigPool, Error> {
        if selector.is_empty() {
            return Err(Error::configuration("empty pool selector"));
        }
        let mut pools = self.client.list_pools(selector).await?;
        match pools.len() {
            0 => Err(Error::configuration(format!(
                "no machine config pool matches selector {}",
                label_selector(selector)
            ))),
            1 => Ok(pools.remove(0)),
            n => Err(Error::configuration(format!(
                "{n} machine config pools match selector {}, expected exactly one",
                label_selector(selector)
            ))),
        }
    }

    /// Count the nodes of `pool`
    ///
    /// A selector without `matchLabels` would match every node in the
    /// cluster, so it is rejected like a pool with no nodes.
    async fn node_count(&self, pool: &MachineConfigPool) -> Result<usize, Error> {
        let labels = pool.node_match_labels();
        if labels.is_empty() {
            return Err(Error::configuration(format!(
                "machine config pool {} has no nodeSelector.matchLabels",
                pool.metadata.name.as_deref().unwrap_or_default()
            )));
        }
        self.client.count_nodes(&labels).await
    }

    /// Wait until the selected pool's condition reaches `desired`
    ///
    /// The timeout is `node_count * per_node_budget`, counted over the nodes
    /// matching the pool's node selector when the wait starts.
    pub async fn await_condition(
        &self,
        pool_selector: &BTreeMap<String, String>,
        condition_type: &str,
        desired: ConditionStatus,
        cancel: &CancellationToken,
    ) -> Result<Reached, Error> {
        let pool = self.resolve_pool(pool_selector).await?;
        let pool_name = pool.metadata.name.clone().unwrap_or_default();
        let node_count = self.node_count(&pool).await?;
        let timeout = compute_timeout(node_count, self.config.per_node_budget)?;

        info!(
            pool = %pool_name,
            condition = %condition_type,
            desired = %desired,
            node_count,
            timeout_secs = timeout.as_secs(),
            "Waiting for pool condition"
        );

        let desired_str = desired.to_string();
        let client = &self.client;
        let (pool_ref, desired_ref) = (pool_name.as_str(), desired_str.as_str());
        let (_, elapsed) = self
            .poll(
                timeout,
                cancel,
                "await_condition",
                || async move {
                    let Some(pool) = client.get_pool(pool_ref).await? else {
                        return Ok(Probe::Pending(Some("pool not found".to_string())));
                    };
                    // An unreported condition counts as Unknown
                    let observed = pool
                        .condition_status(condition_type)
                        .map(str::to_string)
                        .unwrap_or_else(|| ConditionStatus::Unknown.to_string());
                    if observed == desired_ref {
                        Ok(Probe::Ready(()))
                    } else {
                        Ok(Probe::Pending(Some(observed)))
                    }
                },
                |elapsed, last_observed| Error::RolloutTimeout {
                    pool: pool_name.clone(),
                    stage: RolloutStage::Condition,
                    condition_type: condition_type.to_string(),
                    desired: desired_str.clone(),
                    last_observed,
                    elapsed,
                },
            )
            .await?;

        info!(
            pool = %pool_name,
            condition = %condition_type,
            elapsed_secs = elapsed.as_secs(),
            "Pool condition reached"
        );
        Ok(Reached {
            pool: pool_name,
            node_count,
            timeout,
            elapsed,
        })
    }

    /// Wait until the pool references `machine_config` in its configuration sources
    pub async fn await_config_picked_up(
        &self,
        pool_name: &str,
        machine_config: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration, Error> {
        info!(
            pool = %pool_name,
            machine_config = %machine_config,
            timeout_secs = self.config.pickup_timeout.as_secs(),
            "Waiting for pool to pick up configuration"
        );

        let client = &self.client;
        let (_, elapsed) = self
            .poll(
                self.config.pickup_timeout,
                cancel,
                "await_config_picked_up",
                || async move {
                    match client.get_pool(pool_name).await? {
                        Some(pool) if pool.has_config_source(machine_config) => {
                            Ok(Probe::Ready(()))
                        }
                        Some(pool) => Ok(Probe::Pending(
                            pool.spec.configuration.and_then(|c| c.name),
                        )),
                        None => Ok(Probe::Pending(Some("pool not found".to_string()))),
                    }
                },
                |elapsed, last_observed| Error::RolloutTimeout {
                    pool: pool_name.to_string(),
                    stage: RolloutStage::PickUp,
                    condition_type: PICKUP_CONDITION.to_string(),
                    desired: machine_config.to_string(),
                    last_observed,
                    elapsed,
                },
            )
            .await?;

        Ok(elapsed)
    }

    /// Pick-up followed by the condition wait
    pub async fn await_rollout(
        &self,
        request: &RolloutRequest,
        cancel: &CancellationToken,
    ) -> Result<Reached, Error> {
        if request.skip_pickup {
            debug!(machine_config = %request.machine_config, "Skipping pick-up stage");
        } else {
            let pool = self.resolve_pool(&request.pool_selector).await?;
            let pool_name = pool.metadata.name.unwrap_or_default();
            self.await_config_picked_up(&pool_name, &request.machine_config, cancel)
                .await?;
        }

        self.await_condition(
            &request.pool_selector,
            &request.condition_type,
            request.desired,
            cancel,
        )
        .await
    }

    /// Non-blocking snapshot of the selected pool
    pub async fn observe(
        &self,
        pool_selector: &BTreeMap<String, String>,
        machine_config: &str,
    ) -> Result<RolloutSnapshot, Error> {
        let pool = self.resolve_pool(pool_selector).await?;
        compute_timeout(self.node_count(&pool).await?, self.config.per_node_budget)?;
        let is_true = |type_: &str| pool.condition_status(type_) == Some("True");
        Ok(RolloutSnapshot {
            pool: pool.metadata.name.clone().unwrap_or_default(),
            picked_up: pool.has_config_source(machine_config),
            updated: is_true(CONDITION_UPDATED),
            updating: is_true(CONDITION_UPDATING),
            degraded: is_true(CONDITION_DEGRADED),
        })
    }

    /// Poll `probe` until ready, timeout or cancellation
    ///
    /// The probe runs once more at the deadline before giving up. Probe
    /// errors are logged and polling continues.
    async fn poll<T, F, Fut>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        operation: &str,
        mut probe: F,
        on_timeout: impl FnOnce(Duration, Option<String>) -> Error,
    ) -> Result<(T, Duration), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Probe<T>, Error>>,
    {
        let start = Instant::now();
        let mut last_observed = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(operation));
            }

            match probe().await {
                Ok(Probe::Ready(value)) => return Ok((value, start.elapsed())),
                Ok(Probe::Pending(observed)) => {
                    debug!(operation, observed = ?observed, "Not reached yet");
                    last_observed = observed;
                }
                Err(e) => {
                    warn!(operation, error = %e, "Poll failed, retrying");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(on_timeout(elapsed, last_observed));
            }

            let wait = self.config.poll_interval.min(timeout - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
