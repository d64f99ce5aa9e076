//! Machine config operator types
//!
//! MachineConfig, KubeletConfig and MachineConfigPool belong to the machine
//! config operator. Schema generation is disabled since these CRDs are never
//! installed by this operator; the types carry only what is read or written
//! here and keep unknown fields out of the way.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// API group of the machine config operator
pub const MACHINE_CONFIG_GROUP: &str = "machineconfiguration.openshift.io";

/// Node-level configuration rendered by the machine config operator
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfig",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigSpec {
    /// Ignition config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    /// Kernel command line arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_arguments: Vec<String>,

    /// `realtime` to install the real-time kernel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_type: Option<String>,
}

/// Kubelet configuration targeted at a pool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "KubeletConfig",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfigSpec {
    /// Pools this configuration applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_config_pool_selector: Option<LabelSelector>,

    /// Raw kubelet configuration fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet_config: Option<serde_json::Value>,
}

/// Group of nodes that share a rendered configuration
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "MachineConfigPool",
    status = "MachineConfigPoolStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolSpec {
    /// MachineConfigs that belong to this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_config_selector: Option<LabelSelector>,

    /// Nodes that belong to this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    /// Whether rollouts are paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,

    /// Target rendered configuration and its sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PoolConfiguration>,
}

/// Rendered configuration of a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfiguration {
    /// Name of the rendered MachineConfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// MachineConfigs merged into the rendered configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<ObjectReference>,
}

/// Observed state of a pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigPoolStatus {
    /// Pool conditions (`Updated`, `Updating`, `Degraded`, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PoolCondition>,

    /// Nodes in the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_count: Option<i32>,

    /// Nodes running the target configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_machine_count: Option<i32>,

    /// Nodes that failed to apply the configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_machine_count: Option<i32>,

    /// Current rendered configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<PoolConfiguration>,
}

/// One pool condition, status as the raw Kubernetes string
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// `True`, `False` or `Unknown`
    pub status: String,

    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MachineConfigPool {
    /// Status of the named condition, if the pool reports it
    pub fn condition_status(&self, type_: &str) -> Option<&str> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
            .map(|c| c.status.as_str())
    }

    /// Whether `spec.configuration.source` references the named MachineConfig
    pub fn has_config_source(&self, machine_config: &str) -> bool {
        self.spec
            .configuration
            .as_ref()
            .map(|c| {
                c.source
                    .iter()
                    .any(|s| s.name.as_deref() == Some(machine_config))
            })
            .unwrap_or(false)
    }

    /// `matchLabels` of the pool's node selector
    pub fn node_match_labels(&self) -> BTreeMap<String, String> {
        self.spec
            .node_selector
            .as_ref()
            .and_then(|s| s.match_labels.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool() -> MachineConfigPool {
        serde_json::from_value(json!({
            "apiVersion": "machineconfiguration.openshift.io/v1",
            "kind": "MachineConfigPool",
            "metadata": {"name": "worker-cnf"},
            "spec": {
                "nodeSelector": {"matchLabels": {"node-role.kubernetes.io/worker-cnf": ""}},
                "configuration": {
                    "name": "rendered-worker-cnf-abc",
                    "source": [
                        {"kind": "MachineConfig", "name": "00-worker"},
                        {"kind": "MachineConfig", "name": "performance-p1"}
                    ]
                }
            },
            "status": {
                "conditions": [
                    {"type": "Updated", "status": "False"},
                    {"type": "Updating", "status": "True"}
                ],
                "machineCount": 3
            }
        }))
        .unwrap()
    }

    #[test]
    fn reads_condition_status() {
        let pool = pool();
        assert_eq!(pool.condition_status("Updated"), Some("False"));
        assert_eq!(pool.condition_status("Updating"), Some("True"));
        assert_eq!(pool.condition_status("Degraded"), None);
    }

    #[test]
    fn finds_config_source() {
        let pool = pool();
        assert!(pool.has_config_source("performance-p1"));
        assert!(!pool.has_config_source("performance-p2"));
    }

    #[test]
    fn node_labels_from_selector() {
        let labels = pool().node_match_labels();
        assert_eq!(labels.len(), 1);
        assert!(labels.contains_key("node-role.kubernetes.io/worker-cnf"));
    }
}
