//! Tuned type of the node tuning operator
//!
//! Tuned objects live in the node tuning namespace and select nodes through
//! MachineConfig labels.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Tuned profiles and the recommendation rules that select them
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "tuned.openshift.io",
    version = "v1",
    kind = "Tuned",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct TunedSpec {
    /// Named tuned profiles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profile: Vec<TunedProfile>,

    /// Rules selecting a profile for matching nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommend: Vec<TunedRecommend>,
}

/// A tuned profile in ini format
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunedProfile {
    /// Profile name
    pub name: String,
    /// Profile body
    pub data: String,
}

/// Selects a profile for nodes in pools carrying the given labels
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TunedRecommend {
    /// MachineConfig labels of the target pool
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_config_labels: BTreeMap<String, String>,
    /// Lower wins
    pub priority: u64,
    /// Profile to apply
    pub profile: String,
}
