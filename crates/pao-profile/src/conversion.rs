//! Version gate for PerformanceProfile objects
//!
//! Objects arrive in any served version. They are deserialized into a closed
//! [`VersionedProfile`], converted with one explicit function per version
//! pair, defaulted and validated. The reconciler only ever sees the
//! canonical `v2` type.
//!
//! Defaulting rules applied on the way to `v2`:
//! - legacy `cpu.balanceIsolated` (`true` when unset) becomes
//!   `globallyDisableIrqLoadBalancing = !balanceIsolated`
//! - a single `node-role.kubernetes.io/<role>` node selector derives
//!   `machineConfigLabel` and `machineConfigPoolSelector` for `<role>`
//! - a missing NUMA topology policy becomes `best-effort`

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::crd::merge_crds;
use kube::{CustomResourceExt, ResourceExt};
use serde_json::Value;

use pao_common::crd::profile::{v1, v1alpha1, v2, LegacyCpu};
use pao_common::crd::{Numa, TopologyPolicy};
use pao_common::{
    Error, MACHINE_CONFIG_ROLE_LABEL, NODE_ROLE_LABEL_PREFIX, PERFORMANCE_GROUP,
    POOL_ROLE_LABEL_PREFIX,
};

use crate::cpuset::CpuSet;

/// Hugepage sizes the nodes can allocate
pub const SUPPORTED_HUGEPAGE_SIZES: [&str; 2] = ["2M", "1G"];

/// Served API versions of the PerformanceProfile CRD
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceVersion {
    /// `performance.openshift.io/v1alpha1`
    V1Alpha1,
    /// `performance.openshift.io/v1`
    V1,
    /// `performance.openshift.io/v2`, storage version
    V2,
}

impl SourceVersion {
    /// Every served version, oldest first
    pub const ALL: [SourceVersion; 3] = [Self::V1Alpha1, Self::V1, Self::V2];

    /// Bare version name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1Alpha1 => "v1alpha1",
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    /// Full `group/version`
    pub fn api_version(&self) -> String {
        format!("{}/{}", PERFORMANCE_GROUP, self.as_str())
    }
}

impl std::fmt::Display for SourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `v1` as well as `performance.openshift.io/v1`
impl FromStr for SourceVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let version = match s.split_once('/') {
            Some((group, version)) if group == PERFORMANCE_GROUP => version,
            Some((group, _)) => {
                return Err(Error::validation(format!(
                    "unexpected API group {group:?}, expected {PERFORMANCE_GROUP}"
                )))
            }
            None => s,
        };
        match version {
            "v1alpha1" => Ok(Self::V1Alpha1),
            "v1" => Ok(Self::V1),
            "v2" => Ok(Self::V2),
            other => Err(Error::validation(format!(
                "unsupported PerformanceProfile version {other:?}"
            ))),
        }
    }
}

/// A profile in the version it was submitted in
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedProfile {
    /// `v1alpha1` object
    V1Alpha1(v1alpha1::PerformanceProfile),
    /// `v1` object
    V1(v1::PerformanceProfile),
    /// `v2` object
    V2(v2::PerformanceProfile),
}

impl VersionedProfile {
    /// Deserialize `raw` as `version`
    ///
    /// An `apiVersion` in the object must agree with `version`.
    pub fn from_value(raw: Value, version: SourceVersion) -> Result<Self, Error> {
        let name = object_name(&raw);
        if let Some(api_version) = raw.get("apiVersion").and_then(Value::as_str) {
            let declared: SourceVersion = api_version.parse()?;
            if declared != version {
                return Err(Error::validation_for_field(
                    name,
                    "apiVersion",
                    format!("object declares {declared}, expected {version}"),
                ));
            }
        }

        let malformed =
            |e: serde_json::Error| Error::validation_for_field(&name, "spec", format!("malformed object: {e}"));
        Ok(match version {
            SourceVersion::V1Alpha1 => Self::V1Alpha1(serde_json::from_value(raw).map_err(malformed)?),
            SourceVersion::V1 => Self::V1(serde_json::from_value(raw).map_err(malformed)?),
            SourceVersion::V2 => Self::V2(serde_json::from_value(raw).map_err(malformed)?),
        })
    }

    /// Deserialize `raw`, taking the version from its `apiVersion`
    pub fn from_object(raw: Value) -> Result<Self, Error> {
        let version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::validation_for_field(object_name(&raw), "apiVersion", "apiVersion is required")
            })?
            .parse()?;
        Self::from_value(raw, version)
    }

    /// Version of the wrapped object
    pub fn version(&self) -> SourceVersion {
        match self {
            Self::V1Alpha1(_) => SourceVersion::V1Alpha1,
            Self::V1(_) => SourceVersion::V1,
            Self::V2(_) => SourceVersion::V2,
        }
    }

    /// Checks that only make sense against the submitted version
    fn check_exclusive_options(&self) -> Result<(), Error> {
        if let Self::V2(profile) = self {
            let legacy = profile
                .spec
                .cpu
                .as_ref()
                .and_then(|c| c.balance_isolated)
                .is_some();
            if legacy && profile.spec.globally_disable_irq_load_balancing.is_some() {
                return Err(Error::validation_for_field(
                    profile.name_any(),
                    "spec.cpu.balanceIsolated",
                    "balanceIsolated and globallyDisableIrqLoadBalancing are mutually exclusive",
                ));
            }
        }
        Ok(())
    }

    /// Convert to the canonical `v2` representation with defaults applied
    pub fn into_canonical(self) -> v2::PerformanceProfile {
        let mut profile = match self {
            Self::V1Alpha1(p) => v1_to_v2(v1alpha1_to_v1(p)),
            Self::V1(p) => v1_to_v2(p),
            Self::V2(p) => migrate_legacy_irq_balancing(p),
        };
        apply_defaults(&mut profile.spec);
        profile
    }

    /// Express a canonical profile in `target`
    pub fn from_canonical(profile: v2::PerformanceProfile, target: SourceVersion) -> Self {
        match target {
            SourceVersion::V1Alpha1 => Self::V1Alpha1(v1_to_v1alpha1(v2_to_v1(profile))),
            SourceVersion::V1 => Self::V1(v2_to_v1(profile)),
            SourceVersion::V2 => Self::V2(profile),
        }
    }

    /// Serialize, including `apiVersion` and `kind`
    pub fn to_value(&self) -> Result<Value, Error> {
        let value = match self {
            Self::V1Alpha1(p) => serde_json::to_value(p),
            Self::V1(p) => serde_json::to_value(p),
            Self::V2(p) => serde_json::to_value(p),
        };
        value.map_err(|e| Error::serialization_for_kind("PerformanceProfile", e.to_string()))
    }
}

fn object_name(raw: &Value) -> String {
    raw.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or(pao_common::error::UNKNOWN_CONTEXT)
        .to_string()
}

fn v1alpha1_to_v1(p: v1alpha1::PerformanceProfile) -> v1::PerformanceProfile {
    let spec = p.spec;
    v1::PerformanceProfile {
        metadata: p.metadata,
        spec: v1::PerformanceProfileSpec {
            cpu: spec.cpu,
            hugepages: spec.hugepages,
            machine_config_label: spec.machine_config_label,
            machine_config_pool_selector: spec.machine_config_pool_selector,
            node_selector: spec.node_selector,
            real_time_kernel: spec.real_time_kernel,
            additional_kernel_args: spec.additional_kernel_args,
            numa: spec.numa,
        },
        status: p.status,
    }
}

fn v1_to_v1alpha1(p: v1::PerformanceProfile) -> v1alpha1::PerformanceProfile {
    let spec = p.spec;
    v1alpha1::PerformanceProfile {
        metadata: p.metadata,
        spec: v1alpha1::PerformanceProfileSpec {
            cpu: spec.cpu,
            hugepages: spec.hugepages,
            machine_config_label: spec.machine_config_label,
            machine_config_pool_selector: spec.machine_config_pool_selector,
            node_selector: spec.node_selector,
            real_time_kernel: spec.real_time_kernel,
            additional_kernel_args: spec.additional_kernel_args,
            numa: spec.numa,
        },
        status: p.status,
    }
}

fn v1_to_v2(p: v1::PerformanceProfile) -> v2::PerformanceProfile {
    let spec = p.spec;
    let balance_isolated = spec
        .cpu
        .as_ref()
        .and_then(|c| c.balance_isolated)
        .unwrap_or(true);
    v2::PerformanceProfile {
        metadata: p.metadata,
        spec: v2::PerformanceProfileSpec {
            cpu: spec.cpu.map(|c| v2::Cpu {
                reserved: c.reserved,
                isolated: c.isolated,
                offlined: None,
                balance_isolated: None,
            }),
            hugepages: spec.hugepages,
            machine_config_label: spec.machine_config_label,
            machine_config_pool_selector: spec.machine_config_pool_selector,
            node_selector: spec.node_selector,
            real_time_kernel: spec.real_time_kernel,
            additional_kernel_args: spec.additional_kernel_args,
            numa: spec.numa,
            globally_disable_irq_load_balancing: Some(!balance_isolated),
        },
        status: p.status,
    }
}

/// `offlined` has no counterpart below `v2` and is dropped
fn v2_to_v1(p: v2::PerformanceProfile) -> v1::PerformanceProfile {
    let p = migrate_legacy_irq_balancing(p);
    let spec = p.spec;
    let globally_disable = spec.globally_disable_irq_load_balancing.unwrap_or(false);
    v1::PerformanceProfile {
        metadata: p.metadata,
        spec: v1::PerformanceProfileSpec {
            cpu: spec.cpu.map(|c| LegacyCpu {
                reserved: c.reserved,
                isolated: c.isolated,
                balance_isolated: Some(!globally_disable),
            }),
            hugepages: spec.hugepages,
            machine_config_label: spec.machine_config_label,
            machine_config_pool_selector: spec.machine_config_pool_selector,
            node_selector: spec.node_selector,
            real_time_kernel: spec.real_time_kernel,
            additional_kernel_args: spec.additional_kernel_args,
            numa: spec.numa,
        },
        status: p.status,
    }
}

/// Fold a `v2` object's legacy `balanceIsolated` into the global switch
///
/// An explicit `globallyDisableIrqLoadBalancing` wins.
fn migrate_legacy_irq_balancing(mut p: v2::PerformanceProfile) -> v2::PerformanceProfile {
    let legacy = p.spec.cpu.as_mut().and_then(|c| c.balance_isolated.take());
    if p.spec.globally_disable_irq_load_balancing.is_none() {
        p.spec.globally_disable_irq_load_balancing = Some(!legacy.unwrap_or(true));
    }
    p
}

/// Role of a node selector made of exactly one `node-role.kubernetes.io/<role>` label
fn single_node_role(node_selector: Option<&BTreeMap<String, String>>) -> Option<&str> {
    let selector = node_selector?;
    if selector.len() != 1 {
        return None;
    }
    selector
        .keys()
        .next()?
        .strip_prefix(NODE_ROLE_LABEL_PREFIX)
        .filter(|role| !role.is_empty())
}

fn apply_defaults(spec: &mut v2::PerformanceProfileSpec) {
    if let Some(role) = single_node_role(spec.node_selector.as_ref()).map(str::to_string) {
        spec.machine_config_label.get_or_insert_with(|| {
            BTreeMap::from([(MACHINE_CONFIG_ROLE_LABEL.to_string(), role.clone())])
        });
        spec.machine_config_pool_selector.get_or_insert_with(|| {
            BTreeMap::from([(format!("{POOL_ROLE_LABEL_PREFIX}{role}"), String::new())])
        });
    }

    let numa = spec.numa.get_or_insert_with(Numa::default);
    numa.topology_policy
        .get_or_insert_with(|| TopologyPolicy::default().to_string());
}

/// Convert, default and validate a raw object submitted as `source`
pub fn normalize(raw: Value, source: SourceVersion) -> Result<v2::PerformanceProfile, Error> {
    let versioned = VersionedProfile::from_value(raw, source)?;
    canonicalize_versioned(versioned)
}

/// Default and validate a profile already in `v2`
pub fn canonicalize(profile: &v2::PerformanceProfile) -> Result<v2::PerformanceProfile, Error> {
    canonicalize_versioned(VersionedProfile::V2(profile.clone()))
}

fn canonicalize_versioned(versioned: VersionedProfile) -> Result<v2::PerformanceProfile, Error> {
    versioned.check_exclusive_options()?;
    let canonical = versioned.into_canonical();
    validate(&canonical)?;
    Ok(canonical)
}

/// Convert a stored object to `desired`, without validation
///
/// Used by the CRD conversion webhook, which must be able to serve objects
/// admitted before a validation rule existed.
pub fn convert(raw: Value, desired: SourceVersion) -> Result<Value, Error> {
    let canonical = VersionedProfile::from_object(raw)?.into_canonical();
    VersionedProfile::from_canonical(canonical, desired).to_value()
}

fn required_cpuset(name: &str, field: &str, value: Option<&str>) -> Result<CpuSet, Error> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::validation_for_field(name, field, "must be set to a non-empty cpu list"))?;
    value
        .parse()
        .map_err(|e: String| Error::validation_for_field(name, field, e))
}

/// Validate a canonical profile
pub fn validate(profile: &v2::PerformanceProfile) -> Result<(), Error> {
    let name = profile.name_any();
    let spec = &profile.spec;
    let invalid = |field: &str, message: String| Error::validation_for_field(&name, field, message);

    let cpu = spec
        .cpu
        .as_ref()
        .ok_or_else(|| invalid("spec.cpu", "cpu section is required".to_string()))?;
    let reserved = required_cpuset(&name, "spec.cpu.reserved", cpu.reserved.as_deref())?;
    let isolated = required_cpuset(&name, "spec.cpu.isolated", cpu.isolated.as_deref())?;
    if reserved.intersects(&isolated) {
        return Err(invalid(
            "spec.cpu",
            format!(
                "reserved and isolated cpus overlap: {}",
                reserved.intersection(&isolated)
            ),
        ));
    }
    if let Some(offlined) = cpu.offlined.as_deref() {
        let offlined: CpuSet = offlined
            .parse()
            .map_err(|e: String| invalid("spec.cpu.offlined", e))?;
        for (other, label) in [(&reserved, "reserved"), (&isolated, "isolated")] {
            if offlined.intersects(other) {
                return Err(invalid(
                    "spec.cpu.offlined",
                    format!(
                        "offlined and {label} cpus overlap: {}",
                        offlined.intersection(other)
                    ),
                ));
            }
        }
    }

    let node_selector = spec
        .node_selector
        .as_ref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("spec.nodeSelector", "nodeSelector is required".to_string()))?;
    if node_selector.keys().any(|k| k.trim().is_empty()) {
        return Err(invalid(
            "spec.nodeSelector",
            "node selector label keys must not be empty".to_string(),
        ));
    }

    let labels = [
        ("spec.machineConfigLabel", spec.machine_config_label.as_ref()),
        (
            "spec.machineConfigPoolSelector",
            spec.machine_config_pool_selector.as_ref(),
        ),
    ];
    for (field, value) in labels {
        match value {
            None if node_selector.len() > 1 => {
                return Err(invalid(
                    "spec.nodeSelector",
                    "multiple node selector labels require explicit machineConfigLabel and machineConfigPoolSelector"
                        .to_string(),
                ))
            }
            None => {
                return Err(invalid(
                    field,
                    format!("cannot be derived, nodeSelector has no {NODE_ROLE_LABEL_PREFIX}<role> label"),
                ))
            }
            Some(map) if map.len() != 1 => {
                return Err(invalid(
                    field,
                    format!("must contain exactly one label, found {}", map.len()),
                ))
            }
            Some(_) => {}
        }
    }

    if let Some(hugepages) = &spec.hugepages {
        if let Some(size) = hugepages.default_hugepages_size.as_deref() {
            if !SUPPORTED_HUGEPAGE_SIZES.contains(&size) {
                return Err(invalid(
                    "spec.hugepages.defaultHugepagesSize",
                    format!("unsupported hugepage size {size:?}, expected 2M or 1G"),
                ));
            }
        }
        for (i, page) in hugepages.pages.iter().enumerate() {
            let field = |f: &str| format!("spec.hugepages.pages[{i}].{f}");
            match page.size.as_deref() {
                Some(size) if SUPPORTED_HUGEPAGE_SIZES.contains(&size) => {}
                Some(size) => {
                    return Err(invalid(
                        &field("size"),
                        format!("unsupported hugepage size {size:?}, expected 2M or 1G"),
                    ))
                }
                None => return Err(invalid(&field("size"), "size is required".to_string())),
            }
            if page.count.unwrap_or(0) <= 0 {
                return Err(invalid(&field("count"), "count must be positive".to_string()));
            }
            if page.node.is_some_and(|n| n < 0) {
                return Err(invalid(&field("node"), "node must not be negative".to_string()));
            }
        }
    }

    if let Some(policy) = spec.numa.as_ref().and_then(|n| n.topology_policy.as_deref()) {
        policy
            .parse::<TopologyPolicy>()
            .map_err(|e| invalid("spec.numa.topologyPolicy", e))?;
    }

    Ok(())
}

/// Versions, storage version and CRD of the PerformanceProfile API
///
/// Built once at startup and passed by reference to the webhook and the CLI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRegistry {
    versions: Vec<SourceVersion>,
    canonical: SourceVersion,
}

impl Default for VersionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionRegistry {
    /// Registry of every served PerformanceProfile version
    pub fn new() -> Self {
        Self {
            versions: SourceVersion::ALL.to_vec(),
            canonical: SourceVersion::V2,
        }
    }

    /// Served versions
    pub fn versions(&self) -> &[SourceVersion] {
        &self.versions
    }

    /// Storage and in-memory version
    pub fn canonical(&self) -> SourceVersion {
        self.canonical
    }

    /// Resolve an `apiVersion` (or bare version) to a served version
    pub fn resolve(&self, api_version: &str) -> Result<SourceVersion, Error> {
        let version: SourceVersion = api_version.parse()?;
        if self.versions.contains(&version) {
            Ok(version)
        } else {
            Err(Error::validation(format!("{version} is not served")))
        }
    }

    /// Normalize a raw object, version taken from its `apiVersion`
    pub fn normalize(&self, raw: Value) -> Result<v2::PerformanceProfile, Error> {
        let api_version = raw
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation_for_field(object_name(&raw), "apiVersion", "apiVersion is required"))?;
        let version = self.resolve(api_version)?;
        normalize(raw, version)
    }

    /// Convert a raw object to `desired_api_version`
    pub fn convert(&self, raw: Value, desired_api_version: &str) -> Result<Value, Error> {
        let desired = self.resolve(desired_api_version)?;
        convert(raw, desired)
    }

    /// Multi-version CRD with the canonical version as storage
    pub fn crd(&self) -> Result<CustomResourceDefinition, Error> {
        let crds = self
            .versions
            .iter()
            .map(|v| match v {
                SourceVersion::V1Alpha1 => v1alpha1::PerformanceProfile::crd(),
                SourceVersion::V1 => v1::PerformanceProfile::crd(),
                SourceVersion::V2 => v2::PerformanceProfile::crd(),
            })
            .collect();
        merge_crds(crds, self.canonical.as_str())
            .map_err(|e| Error::internal_with_context("crd", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_object(version: &str) -> Value {
        json!({
            "apiVersion": format!("performance.openshift.io/{version}"),
            "kind": "PerformanceProfile",
            "metadata": {"name": "p1", "uid": "uid-p1", "generation": 3},
            "spec": {
                "cpu": {"reserved": "0-1", "isolated": "2-7"},
                "hugepages": {
                    "defaultHugepagesSize": "1G",
                    "pages": [{"size": "1G", "count": 4}]
                },
                "nodeSelector": {"node-role.kubernetes.io/worker-cnf": ""},
                "realTimeKernel": {"enabled": true}
            }
        })
    }

    fn v2_object() -> Value {
        json!({
            "apiVersion": "performance.openshift.io/v2",
            "kind": "PerformanceProfile",
            "metadata": {"name": "p1"},
            "spec": {
                "cpu": {"reserved": "0-1", "isolated": "2-5", "offlined": "6-7"},
                "nodeSelector": {"node-role.kubernetes.io/worker-cnf": ""},
                "globallyDisableIrqLoadBalancing": true
            }
        })
    }

    fn field_of(err: Error) -> Option<String> {
        match err {
            Error::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    // =========================================================================
    // Source versions
    // =========================================================================

    #[test]
    fn parses_bare_and_qualified_versions() {
        assert_eq!("v1".parse::<SourceVersion>().unwrap(), SourceVersion::V1);
        assert_eq!(
            "performance.openshift.io/v1alpha1".parse::<SourceVersion>().unwrap(),
            SourceVersion::V1Alpha1
        );
        assert!("v3".parse::<SourceVersion>().is_err());
        assert!("apps/v1".parse::<SourceVersion>().is_err());
    }

    #[test]
    fn declared_version_must_match() {
        let err = VersionedProfile::from_value(legacy_object("v1"), SourceVersion::V2).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("apiVersion"));
    }

    // =========================================================================
    // Normalization
    // =========================================================================

    #[test]
    fn legacy_versions_normalize_to_same_canonical() {
        let from_alpha = normalize(legacy_object("v1alpha1"), SourceVersion::V1Alpha1).unwrap();
        let from_v1 = normalize(legacy_object("v1"), SourceVersion::V1).unwrap();
        assert_eq!(from_alpha, from_v1);
        assert_eq!(from_alpha.metadata.uid.as_deref(), Some("uid-p1"));
        assert_eq!(from_alpha.metadata.generation, Some(3));
    }

    #[test]
    fn unset_balance_isolated_keeps_irq_balancing() {
        let p = normalize(legacy_object("v1"), SourceVersion::V1).unwrap();
        assert_eq!(p.spec.globally_disable_irq_load_balancing, Some(false));
        assert!(p.spec.cpu.unwrap().offlined.is_none());
    }

    #[test]
    fn balance_isolated_false_disables_irq_balancing() {
        let mut raw = legacy_object("v1alpha1");
        raw["spec"]["cpu"]["balanceIsolated"] = json!(false);
        let p = normalize(raw, SourceVersion::V1Alpha1).unwrap();
        assert_eq!(p.spec.globally_disable_irq_load_balancing, Some(true));
        assert!(p.spec.cpu.unwrap().balance_isolated.is_none());
    }

    #[test]
    fn derives_labels_from_node_role() {
        let p = normalize(legacy_object("v1"), SourceVersion::V1).unwrap();
        assert_eq!(
            p.spec.machine_config_label.unwrap(),
            BTreeMap::from([(
                "machineconfiguration.openshift.io/role".to_string(),
                "worker-cnf".to_string()
            )])
        );
        assert_eq!(
            p.spec.machine_config_pool_selector.unwrap(),
            BTreeMap::from([(
                "pools.operator.machineconfiguration.openshift.io/worker-cnf".to_string(),
                String::new()
            )])
        );
    }

    #[test]
    fn explicit_labels_are_kept() {
        let mut raw = legacy_object("v1");
        raw["spec"]["machineConfigLabel"] = json!({"custom/role": "rt"});
        let p = normalize(raw, SourceVersion::V1).unwrap();
        assert_eq!(
            p.spec.machine_config_label.unwrap().get("custom/role").map(String::as_str),
            Some("rt")
        );
    }

    #[test]
    fn numa_defaults_to_best_effort() {
        let p = normalize(legacy_object("v1"), SourceVersion::V1).unwrap();
        assert_eq!(
            p.spec.numa.unwrap().topology_policy.as_deref(),
            Some("best-effort")
        );
    }

    #[test]
    fn v2_is_accepted_as_is() {
        let p = normalize(v2_object(), SourceVersion::V2).unwrap();
        assert_eq!(p.spec.cpu.unwrap().offlined.as_deref(), Some("6-7"));
        assert_eq!(p.spec.globally_disable_irq_load_balancing, Some(true));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn missing_node_selector_is_rejected() {
        let mut raw = legacy_object("v1alpha1");
        raw["spec"].as_object_mut().unwrap().remove("nodeSelector");
        let err = normalize(raw, SourceVersion::V1Alpha1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.nodeSelector"));
    }

    #[test]
    fn missing_cpu_fields_are_rejected() {
        let mut raw = legacy_object("v1");
        raw["spec"]["cpu"].as_object_mut().unwrap().remove("isolated");
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.cpu.isolated"));

        let mut raw = legacy_object("v1");
        raw["spec"].as_object_mut().unwrap().remove("cpu");
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.cpu"));
    }

    #[test]
    fn overlapping_cpus_are_rejected() {
        let mut raw = legacy_object("v1");
        raw["spec"]["cpu"]["isolated"] = json!("1-7");
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert!(err.to_string().contains("overlap: 1"));

        let mut raw = v2_object();
        raw["spec"]["cpu"]["offlined"] = json!("5-7");
        let err = normalize(raw, SourceVersion::V2).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.cpu.offlined"));
    }

    #[test]
    fn unparsable_cpuset_is_rejected() {
        let mut raw = legacy_object("v1");
        raw["spec"]["cpu"]["reserved"] = json!("zero");
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.cpu.reserved"));
    }

    #[test]
    fn legacy_and_global_irq_options_are_exclusive() {
        let mut raw = v2_object();
        raw["spec"]["cpu"]["balanceIsolated"] = json!(false);
        let err = normalize(raw, SourceVersion::V2).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.cpu.balanceIsolated"));
    }

    #[test]
    fn multiple_selector_labels_need_explicit_labels() {
        let mut raw = legacy_object("v1");
        raw["spec"]["nodeSelector"] = json!({
            "node-role.kubernetes.io/worker-cnf": "",
            "zone": "a"
        });
        let err = normalize(raw.clone(), SourceVersion::V1).unwrap_err();
        assert!(err.to_string().contains("multiple node selector labels"));

        raw["spec"]["machineConfigLabel"] = json!({"machineconfiguration.openshift.io/role": "worker-cnf"});
        raw["spec"]["machineConfigPoolSelector"] = json!({"pools.operator.machineconfiguration.openshift.io/worker-cnf": ""});
        assert!(normalize(raw, SourceVersion::V1).is_ok());
    }

    #[test]
    fn selector_without_role_needs_explicit_labels() {
        let mut raw = legacy_object("v1");
        raw["spec"]["nodeSelector"] = json!({"zone": "a"});
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.machineConfigLabel"));
    }

    #[test]
    fn labels_with_several_entries_are_rejected() {
        let mut raw = legacy_object("v1");
        raw["spec"]["machineConfigPoolSelector"] = json!({"a": "1", "b": "2"});
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.machineConfigPoolSelector"));
    }

    #[test]
    fn hugepage_rules() {
        let mut raw = legacy_object("v1");
        raw["spec"]["hugepages"]["pages"][0]["size"] = json!("4M");
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.hugepages.pages[0].size"));

        let mut raw = legacy_object("v1");
        raw["spec"]["hugepages"]["pages"][0]["count"] = json!(0);
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.hugepages.pages[0].count"));

        let mut raw = legacy_object("v1");
        raw["spec"]["hugepages"]["defaultHugepagesSize"] = json!("1M");
        assert!(normalize(raw, SourceVersion::V1).is_err());
    }

    #[test]
    fn unknown_topology_policy_is_rejected() {
        let mut raw = legacy_object("v1");
        raw["spec"]["numa"] = json!({"topologyPolicy": "strict"});
        let err = normalize(raw, SourceVersion::V1).unwrap_err();
        assert_eq!(field_of(err).as_deref(), Some("spec.numa.topologyPolicy"));
    }

    #[test]
    fn canonicalize_typed_profile() {
        let typed: v2::PerformanceProfile = serde_json::from_value(v2_object()).unwrap();
        let canonical = canonicalize(&typed).unwrap();
        assert!(canonical.spec.machine_config_label.is_some());
    }

    // =========================================================================
    // Conversion round trips
    // =========================================================================

    #[test]
    fn round_trip_through_each_version() {
        for source in SourceVersion::ALL {
            let raw = match source {
                SourceVersion::V2 => v2_object(),
                v => legacy_object(v.as_str()),
            };
            let canonical = normalize(raw, source).unwrap();
            let back = VersionedProfile::from_canonical(canonical.clone(), source)
                .to_value()
                .unwrap();
            assert_eq!(back["apiVersion"], source.api_version());
            let again = normalize(back, source).unwrap();
            assert_eq!(again.spec, canonical.spec, "round trip through {source}");
        }
    }

    #[test]
    fn down_conversion_drops_offlined_and_inverts_irq_switch() {
        let converted = convert(v2_object(), SourceVersion::V1).unwrap();
        assert_eq!(converted["apiVersion"], "performance.openshift.io/v1");
        assert_eq!(converted["spec"]["cpu"]["balanceIsolated"], json!(false));
        assert!(converted["spec"]["cpu"].get("offlined").is_none());
    }

    #[test]
    fn conversion_does_not_validate() {
        let mut raw = legacy_object("v1");
        raw["spec"].as_object_mut().unwrap().remove("nodeSelector");
        let converted = convert(raw, SourceVersion::V2).unwrap();
        assert_eq!(converted["apiVersion"], "performance.openshift.io/v2");
    }

    // =========================================================================
    // Registry
    // =========================================================================

    #[test]
    fn registry_serves_all_versions_with_v2_storage() {
        let registry = VersionRegistry::new();
        assert_eq!(registry.versions().len(), 3);
        assert_eq!(registry.canonical(), SourceVersion::V2);

        let crd = registry.crd().unwrap();
        assert_eq!(crd.spec.group, "performance.openshift.io");
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.versions.len(), 3);
        let storage: Vec<_> = crd
            .spec
            .versions
            .iter()
            .filter(|v| v.storage)
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(storage, vec!["v2"]);
    }

    #[test]
    fn registry_normalizes_by_declared_version() {
        let registry = VersionRegistry::new();
        let p = registry.normalize(legacy_object("v1alpha1")).unwrap();
        assert_eq!(p.spec.globally_disable_irq_load_balancing, Some(false));

        let mut raw = legacy_object("v1");
        raw.as_object_mut().unwrap().remove("apiVersion");
        assert!(registry.normalize(raw).is_err());
    }
}
