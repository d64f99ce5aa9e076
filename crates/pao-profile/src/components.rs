//! Desired child objects of a profile
//!
//! [`render`] is a pure function of the canonical profile: the same spec,
//! name and uid always produce field-for-field equal children. Every child
//! carries the owner label and, when the profile has a uid, a controller
//! owner reference so the API server garbage collects it with the profile.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::api::node::v1::{RuntimeClass, Scheduling};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{ApiResource, DynamicObject};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::json;

use pao_common::crd::profile::v2;
use pao_common::crd::{
    HugePage, KubeletConfig, KubeletConfigSpec, MachineConfig, MachineConfigSpec, TopologyPolicy,
    Tuned, TunedProfile, TunedRecommend, TunedSpec,
};
use pao_common::{component_name, Error, NODE_TUNING_NAMESPACE, PROFILE_OWNER_LABEL};

use crate::cpuset::CpuSet;

/// Container runtime handler of the generated RuntimeClass
pub const RUNTIME_HANDLER: &str = "high-performance";

/// Priority of the generated Tuned recommendation
const TUNED_PRIORITY: u64 = 20;

const IGNITION_VERSION: &str = "3.2.0";

/// Kinds of objects generated for a profile
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    /// machineconfiguration.openshift.io/v1 MachineConfig
    MachineConfig,
    /// machineconfiguration.openshift.io/v1 KubeletConfig
    KubeletConfig,
    /// node.k8s.io/v1 RuntimeClass
    RuntimeClass,
    /// tuned.openshift.io/v1 Tuned
    Tuned,
}

impl ChildKind {
    /// Every generated kind, in apply order
    pub const ALL: [ChildKind; 4] = [
        Self::MachineConfig,
        Self::KubeletConfig,
        Self::RuntimeClass,
        Self::Tuned,
    ];

    /// Kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MachineConfig => "MachineConfig",
            Self::KubeletConfig => "KubeletConfig",
            Self::RuntimeClass => "RuntimeClass",
            Self::Tuned => "Tuned",
        }
    }

    /// API resource for dynamic API access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::MachineConfig => ApiResource::erase::<MachineConfig>(&()),
            Self::KubeletConfig => ApiResource::erase::<KubeletConfig>(&()),
            Self::RuntimeClass => ApiResource::erase::<RuntimeClass>(&()),
            Self::Tuned => ApiResource::erase::<Tuned>(&()),
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn namespaced(&self) -> bool {
        matches!(self, Self::Tuned)
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a generated object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildKey {
    /// Kind
    pub kind: ChildKind,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A generated object
#[derive(Clone, Debug)]
pub struct Child {
    /// Kind of the object
    pub kind: ChildKind,
    /// The object itself
    pub object: DynamicObject,
}

impl Child {
    /// Key of this child
    pub fn key(&self) -> ChildKey {
        ChildKey {
            kind: self.kind,
            namespace: self.object.metadata.namespace.clone(),
            name: self.object.name_any(),
        }
    }
}

/// Everything a profile should own
#[derive(Clone, Debug)]
pub struct DesiredChildren {
    /// Owning profile
    pub profile: String,
    /// One child per kind, in apply order
    pub children: Vec<Child>,
}

impl DesiredChildren {
    /// Child of the given kind
    pub fn get(&self, kind: ChildKind) -> Option<&Child> {
        self.children.iter().find(|c| c.kind == kind)
    }

    /// Keys of every child
    pub fn keys(&self) -> BTreeSet<ChildKey> {
        self.children.iter().map(Child::key).collect()
    }

    /// Name of the generated MachineConfig
    pub fn machine_config_name(&self) -> Option<String> {
        self.get(ChildKind::MachineConfig).map(|c| c.object.name_any())
    }

    /// Name of the generated RuntimeClass
    pub fn runtime_class_name(&self) -> Option<String> {
        self.get(ChildKind::RuntimeClass).map(|c| c.object.name_any())
    }

    /// `namespace/name` of the generated Tuned
    pub fn tuned_ref(&self) -> Option<String> {
        self.get(ChildKind::Tuned).map(|c| c.key()).map(|k| {
            format!("{}/{}", k.namespace.unwrap_or_default(), k.name)
        })
    }
}

/// Name of the Tuned object and tuned profile for a profile
pub fn tuned_name(profile_name: &str) -> String {
    format!("openshift-node-performance-{profile_name}")
}

/// Compute the children of a canonical profile
pub fn render(profile: &v2::PerformanceProfile) -> Result<DesiredChildren, Error> {
    let name = profile.name_any();
    let spec = &profile.spec;
    let missing = |field: &str| Error::validation_for_field(&name, field, "required for rendering");

    let cpu = spec.cpu.as_ref().ok_or_else(|| missing("spec.cpu"))?;
    let parse = |field: &str, value: Option<&str>| -> Result<CpuSet, Error> {
        value
            .unwrap_or_default()
            .parse()
            .map_err(|e: String| Error::validation_for_field(&name, field, e))
    };
    let reserved = parse("spec.cpu.reserved", cpu.reserved.as_deref())?;
    let isolated = parse("spec.cpu.isolated", cpu.isolated.as_deref())?;
    let node_selector = spec
        .node_selector
        .clone()
        .ok_or_else(|| missing("spec.nodeSelector"))?;
    let machine_config_label = spec
        .machine_config_label
        .clone()
        .ok_or_else(|| missing("spec.machineConfigLabel"))?;
    let pool_selector = spec
        .machine_config_pool_selector
        .clone()
        .ok_or_else(|| missing("spec.machineConfigPoolSelector"))?;
    let topology_policy: TopologyPolicy = spec
        .numa
        .as_ref()
        .and_then(|n| n.topology_policy.as_deref())
        .map(str::parse::<TopologyPolicy>)
        .transpose()
        .map_err(|e: String| Error::validation_for_field(&name, "spec.numa.topologyPolicy", e))?
        .unwrap_or_default();

    let owner = profile.controller_owner_ref(&());
    let component = component_name(&name);
    let meta = |name: &str, namespace: Option<&str>, labels: BTreeMap<String, String>| {
        child_metadata(name, namespace, labels, owner.as_ref(), profile)
    };

    let mut mc_labels = machine_config_label.clone();
    mc_labels.insert(PROFILE_OWNER_LABEL.to_string(), name.clone());
    let real_time = spec
        .real_time_kernel
        .as_ref()
        .and_then(|rt| rt.enabled)
        .unwrap_or(false);
    let hugepages = spec
        .hugepages
        .as_ref()
        .map(|h| h.pages.as_slice())
        .unwrap_or_default();

    let machine_config = MachineConfig {
        metadata: meta(&component, None, mc_labels),
        spec: MachineConfigSpec {
            config: Some(ignition_config(hugepages)),
            kernel_arguments: spec.additional_kernel_args.clone().unwrap_or_default(),
            kernel_type: real_time.then(|| "realtime".to_string()),
        },
    };

    let kubelet_config = KubeletConfig {
        metadata: meta(&component, None, BTreeMap::new()),
        spec: KubeletConfigSpec {
            machine_config_pool_selector: Some(LabelSelector {
                match_labels: Some(pool_selector),
                match_expressions: None,
            }),
            kubelet_config: Some(json!({
                "apiVersion": "kubelet.config.k8s.io/v1beta1",
                "kind": "KubeletConfiguration",
                "cpuManagerPolicy": "static",
                "cpuManagerReconcilePeriod": "5s",
                "topologyManagerPolicy": topology_policy.as_str(),
                "reservedSystemCPUs": reserved.to_string(),
                "kubeReserved": {"memory": "500Mi"},
                "systemReserved": {"memory": "500Mi"},
            })),
        },
    };

    let runtime_class = RuntimeClass {
        metadata: meta(&component, None, BTreeMap::new()),
        handler: RUNTIME_HANDLER.to_string(),
        overhead: None,
        scheduling: Some(Scheduling {
            node_selector: Some(node_selector),
            tolerations: None,
        }),
    };

    let tuned_profile = tuned_name(&name);
    let globally_disable = spec.globally_disable_irq_load_balancing.unwrap_or(false);
    let tuned = Tuned {
        metadata: meta(&tuned_profile, Some(NODE_TUNING_NAMESPACE), BTreeMap::new()),
        spec: TunedSpec {
            profile: vec![TunedProfile {
                name: tuned_profile.clone(),
                data: tuned_data(&reserved, &isolated, globally_disable, spec.hugepages.as_ref()),
            }],
            recommend: vec![TunedRecommend {
                machine_config_labels: machine_config_label,
                priority: TUNED_PRIORITY,
                profile: tuned_profile,
            }],
        },
    };

    Ok(DesiredChildren {
        profile: name,
        children: vec![
            child(ChildKind::MachineConfig, &machine_config)?,
            child(ChildKind::KubeletConfig, &kubelet_config)?,
            child(ChildKind::RuntimeClass, &runtime_class)?,
            child(ChildKind::Tuned, &tuned)?,
        ],
    })
}

fn child_metadata(
    name: &str,
    namespace: Option<&str>,
    mut labels: BTreeMap<String, String>,
    owner: Option<&OwnerReference>,
    profile: &v2::PerformanceProfile,
) -> ObjectMeta {
    labels.insert(PROFILE_OWNER_LABEL.to_string(), profile.name_any());
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o.clone()]),
        ..Default::default()
    }
}

fn child<K: Serialize>(kind: ChildKind, object: &K) -> Result<Child, Error> {
    let value = serde_json::to_value(object)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
    let mut object: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
    let resource = kind.api_resource();
    object.types.get_or_insert_with(|| kube::core::TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    Ok(Child { kind, object })
}

/// Size in kB of a validated hugepage size
fn hugepage_size_kb(size: &str) -> u64 {
    match size {
        "1G" => 1024 * 1024,
        _ => 2048,
    }
}

/// Ignition config with one allocation unit per NUMA-pinned hugepage block
fn ignition_config(pages: &[HugePage]) -> serde_json::Value {
    let units: Vec<_> = pages
        .iter()
        .filter_map(|page| {
            let node = page.node?;
            let size = page.size.as_deref()?;
            let count = page.count.unwrap_or(0);
            let size_kb = hugepage_size_kb(size);
            Some(json!({
                "name": format!("hugepages-allocation-{size_kb}kB-NUMA{node}.service"),
                "enabled": true,
                "contents": format!(
                    "[Unit]\n\
                     Description=Hugepages-{size_kb}kB allocation on the node {node}\n\
                     Before=kubelet.service\n\
                     \n\
                     [Service]\n\
                     Environment=HUGEPAGES_COUNT={count}\n\
                     Environment=HUGEPAGES_SIZE={size_kb}\n\
                     Environment=NUMA_NODE={node}\n\
                     Type=oneshot\n\
                     RemainAfterExit=true\n\
                     ExecStart=/usr/local/bin/hugepages-allocation.sh\n\
                     \n\
                     [Install]\n\
                     WantedBy=multi-user.target\n"
                ),
            }))
        })
        .collect();

    json!({
        "ignition": {"version": IGNITION_VERSION},
        "systemd": {"units": units},
    })
}

/// Tuned profile body
///
/// Hugepages without a NUMA node go on the kernel command line; pinned
/// blocks are allocated by the MachineConfig units instead.
fn tuned_data(
    reserved: &CpuSet,
    isolated: &CpuSet,
    globally_disable_irq_load_balancing: bool,
    hugepages: Option<&pao_common::crd::HugePages>,
) -> String {
    let isolation = if globally_disable_irq_load_balancing {
        "+isolcpus=domain,managed_irq,${isolated_cores}"
    } else {
        "+isolcpus=managed_irq,${isolated_cores}"
    };

    let mut hugepage_args = Vec::new();
    if let Some(hugepages) = hugepages {
        if let Some(default) = hugepages.default_hugepages_size.as_deref() {
            hugepage_args.push(format!("default_hugepagesz={default}"));
        }
        for page in hugepages.pages.iter().filter(|p| p.node.is_none()) {
            if let (Some(size), Some(count)) = (page.size.as_deref(), page.count) {
                hugepage_args.push(format!("hugepagesz={size}"));
                hugepage_args.push(format!("hugepages={count}"));
            }
        }
    }

    let mut data = format!(
        "[main]\n\
         summary=Openshift node optimized for deterministic performance\n\
         include=openshift-node,cpu-partitioning\n\
         \n\
         [variables]\n\
         isolated_cores={isolated}\n\
         not_isolated_cores_expanded={reserved}\n\
         \n\
         [cpu]\n\
         force_latency=cstate.id:1|3\n\
         governor=performance\n\
         energy_perf_bias=performance\n\
         min_perf_pct=100\n\
         \n\
         [bootloader]\n\
         cmdline_cpu_part=+nohz=on rcu_nocbs=${{isolated_cores}} tuned.non_isolcpus=${{not_isolated_cpumask}} intel_pstate=disable nosoftlockup\n\
         cmdline_isolation={isolation}\n"
    );
    if !hugepage_args.is_empty() {
        data.push_str(&format!("cmdline_hugepages=+{}\n", hugepage_args.join(" ")));
    }
    data
}

/// Whether `existing` differs from `desired` in a way a replace would fix
///
/// Compares the desired top-level fields, labels and owner references;
/// fields the server adds (status, defaults, extra labels) are ignored.
pub fn needs_update(desired: &DynamicObject, existing: &DynamicObject) -> bool {
    let existing_labels = existing.labels();
    let labels_match = desired
        .labels()
        .iter()
        .all(|(k, v)| existing_labels.get(k) == Some(v));

    let existing_owners = existing.owner_references();
    let owners_match = desired.owner_references().iter().all(|o| {
        existing_owners
            .iter()
            .any(|e| e.uid == o.uid && e.controller == o.controller)
    });

    let data_matches = match desired.data.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(k, v)| existing.data.get(k) == Some(v)),
        None => desired.data == existing.data,
    };

    !(labels_match && owners_match && data_matches)
}

/// Serialized children, keyed for output
pub fn manifests(children: &DesiredChildren) -> Result<Vec<(ChildKey, serde_json::Value)>, Error> {
    children
        .children
        .iter()
        .map(|c| {
            serde_json::to_value(&c.object)
                .map(|v| (c.key(), v))
                .map_err(|e| Error::serialization_for_kind(c.kind.as_str(), e.to_string()))
        })
        .collect()
}
