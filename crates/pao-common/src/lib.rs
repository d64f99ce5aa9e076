//! Common types for the performance profile operator: CRDs, errors, leader
//! election and the watch scope.

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod retry;
pub mod watch_scope;

pub use clock::{Clock, SystemClock};
pub use error::Error;
pub use leader_election::{LeaseConfig, LeadershipStatus};
pub use watch_scope::WatchScope;

/// API group of the PerformanceProfile CRD
pub const PERFORMANCE_GROUP: &str = "performance.openshift.io";

/// Prefix of every generated child object name (`performance-<profile>`)
pub const COMPONENT_NAME_PREFIX: &str = "performance";

/// Namespace of the node tuning operator, where Tuned objects live
pub const NODE_TUNING_NAMESPACE: &str = "openshift-cluster-node-tuning-operator";

/// Label put on every generated child, value is the owning profile name
pub const PROFILE_OWNER_LABEL: &str = "performance.openshift.io/profile";

/// Role label used by MachineConfig and MachineConfigPool selectors
pub const MACHINE_CONFIG_ROLE_LABEL: &str = "machineconfiguration.openshift.io/role";

/// Prefix of node role labels (`node-role.kubernetes.io/<role>`)
pub const NODE_ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";

/// Prefix of the per-role pool label (`pools.operator.machineconfiguration.openshift.io/<role>`)
pub const POOL_ROLE_LABEL_PREFIX: &str = "pools.operator.machineconfiguration.openshift.io/";

/// Field manager used for all writes performed by the operator
pub const FIELD_MANAGER: &str = "performance-operator";

/// Build the deterministic child name for a profile
pub fn component_name(profile_name: &str) -> String {
    format!("{}-{}", COMPONENT_NAME_PREFIX, profile_name)
}
