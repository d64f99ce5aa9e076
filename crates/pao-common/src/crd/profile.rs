//! PerformanceProfile CRD
//!
//! Served as `v1alpha1`, `v1` and `v2`; `v2` is the storage version and the
//! only in-memory representation the reconciler works with. Required fields
//! are optional in the Rust types so that an incomplete object still
//! deserializes and validation can name the missing field.
//!
//! ```yaml
//! apiVersion: performance.openshift.io/v2
//! kind: PerformanceProfile
//! metadata:
//!   name: p1
//! spec:
//!   cpu:
//!     reserved: "0-1"
//!     isolated: "2-7"
//!   hugepages:
//!     defaultHugepagesSize: 1G
//!     pages:
//!       - size: 1G
//!         count: 4
//!   nodeSelector:
//!     node-role.kubernetes.io/worker-cnf: ""
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Hugepage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HugePages {
    /// Default hugepage size (`2M` or `1G`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_hugepages_size: Option<String>,

    /// Pages to allocate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<HugePage>,
}

/// A block of hugepages of one size
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HugePage {
    /// Page size (`2M` or `1G`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Number of pages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    /// NUMA node to allocate on, all nodes when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<i32>,
}

/// Real-time kernel switch
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeKernel {
    /// Install the real-time kernel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// NUMA settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Numa {
    /// Kubelet topology manager policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_policy: Option<String>,
}

/// Kubelet topology manager policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TopologyPolicy {
    /// No alignment
    None,
    /// Prefer aligned allocations
    #[default]
    BestEffort,
    /// Reject pods that cannot be aligned
    Restricted,
    /// All resources from one NUMA node
    SingleNumaNode,
}

impl TopologyPolicy {
    /// Value as written in the profile and the kubelet config
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BestEffort => "best-effort",
            Self::Restricted => "restricted",
            Self::SingleNumaNode => "single-numa-node",
        }
    }
}

impl std::fmt::Display for TopologyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TopologyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "best-effort" => Ok(Self::BestEffort),
            "restricted" => Ok(Self::Restricted),
            "single-numa-node" => Ok(Self::SingleNumaNode),
            other => Err(format!(
                "unknown topology policy {other:?}, expected one of none, best-effort, restricted, single-numa-node"
            )),
        }
    }
}

/// Status shared by every served version
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceProfileStatus {
    /// Available, Progressing and Degraded conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the generated RuntimeClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class: Option<String>,

    /// `namespace/name` of the generated Tuned object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuned: Option<String>,
}

/// CPU partitioning as served by `v1alpha1` and `v1`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCpu {
    /// CPUs reserved for housekeeping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<String>,

    /// CPUs isolated for workloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolated: Option<String>,

    /// Allow IRQs on isolated CPUs, `true` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance_isolated: Option<bool>,
}

/// PerformanceProfile `v1alpha1`
pub mod v1alpha1 {
    use std::collections::BTreeMap;

    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    use super::{HugePages, LegacyCpu, Numa, PerformanceProfileStatus, RealTimeKernel};

    /// Profile spec of the first API version
    #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
    #[kube(
        group = "performance.openshift.io",
        version = "v1alpha1",
        kind = "PerformanceProfile",
        status = "PerformanceProfileStatus",
        derive = "PartialEq"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct PerformanceProfileSpec {
        /// CPU partitioning
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cpu: Option<LegacyCpu>,
        /// Hugepages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub hugepages: Option<HugePages>,
        /// Labels for the generated MachineConfig
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_label: Option<BTreeMap<String, String>>,
        /// Labels selecting the target MachineConfigPool
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_pool_selector: Option<BTreeMap<String, String>>,
        /// Nodes the profile applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub node_selector: Option<BTreeMap<String, String>>,
        /// Real-time kernel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub real_time_kernel: Option<RealTimeKernel>,
        /// Extra kernel command line arguments
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub additional_kernel_args: Option<Vec<String>>,
        /// NUMA settings
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub numa: Option<Numa>,
    }
}

/// PerformanceProfile `v1`, field-compatible with `v1alpha1`
pub mod v1 {
    use std::collections::BTreeMap;

    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    use super::{HugePages, LegacyCpu, Numa, PerformanceProfileStatus, RealTimeKernel};

    /// Profile spec of the `v1` API
    #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
    #[kube(
        group = "performance.openshift.io",
        version = "v1",
        kind = "PerformanceProfile",
        status = "PerformanceProfileStatus",
        derive = "PartialEq"
    )]
    #[serde(rename_all = "camelCase")]
    pub struct PerformanceProfileSpec {
        /// CPU partitioning
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cpu: Option<LegacyCpu>,
        /// Hugepages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub hugepages: Option<HugePages>,
        /// Labels for the generated MachineConfig
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_label: Option<BTreeMap<String, String>>,
        /// Labels selecting the target MachineConfigPool
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_pool_selector: Option<BTreeMap<String, String>>,
        /// Nodes the profile applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub node_selector: Option<BTreeMap<String, String>>,
        /// Real-time kernel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub real_time_kernel: Option<RealTimeKernel>,
        /// Extra kernel command line arguments
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub additional_kernel_args: Option<Vec<String>>,
        /// NUMA settings
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub numa: Option<Numa>,
    }
}

/// PerformanceProfile `v2`, the storage and canonical version
pub mod v2 {
    use std::collections::BTreeMap;

    use kube::CustomResource;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    use super::{HugePages, Numa, PerformanceProfileStatus, RealTimeKernel};

    /// CPU partitioning
    #[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
    #[serde(rename_all = "camelCase")]
    pub struct Cpu {
        /// CPUs reserved for housekeeping
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reserved: Option<String>,

        /// CPUs isolated for workloads
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub isolated: Option<String>,

        /// CPUs taken offline
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub offlined: Option<String>,

        /// Deprecated in favour of `globallyDisableIrqLoadBalancing`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub balance_isolated: Option<bool>,
    }

    /// Canonical profile spec
    #[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
    #[kube(
        group = "performance.openshift.io",
        version = "v2",
        kind = "PerformanceProfile",
        status = "PerformanceProfileStatus",
        derive = "PartialEq",
        printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
    )]
    #[serde(rename_all = "camelCase")]
    pub struct PerformanceProfileSpec {
        /// CPU partitioning
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cpu: Option<Cpu>,
        /// Hugepages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub hugepages: Option<HugePages>,
        /// Labels for the generated MachineConfig
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_label: Option<BTreeMap<String, String>>,
        /// Labels selecting the target MachineConfigPool
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub machine_config_pool_selector: Option<BTreeMap<String, String>>,
        /// Nodes the profile applies to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub node_selector: Option<BTreeMap<String, String>>,
        /// Real-time kernel
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub real_time_kernel: Option<RealTimeKernel>,
        /// Extra kernel command line arguments
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub additional_kernel_args: Option<Vec<String>>,
        /// NUMA settings
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub numa: Option<Numa>,
        /// Keep IRQs off every isolated CPU
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub globally_disable_irq_load_balancing: Option<bool>,
    }
}
