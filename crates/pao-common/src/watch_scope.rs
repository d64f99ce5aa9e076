//! Namespaces the operator observes
//!
//! The operator manages cluster-scoped objects (profiles, pools, machine
//! configs) plus Tuned objects in the node tuning namespace. Watching only
//! those namespaces keeps the informer caches and event volume bounded.

use std::collections::BTreeSet;

use kube::{Api, Client, Resource};

/// Namespace sentinel for cluster-scoped objects
pub const CLUSTER_SCOPE: &str = "";

/// Immutable set of watched namespaces, fixed at process start
///
/// The cluster-scoped sentinel is always a member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchScope {
    namespaces: BTreeSet<String>,
}

impl WatchScope {
    /// Build a scope from the configured namespaces
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut namespaces: BTreeSet<String> = namespaces.into_iter().map(Into::into).collect();
        namespaces.insert(CLUSTER_SCOPE.to_string());
        Self { namespaces }
    }

    /// Whether an object in `namespace` is observed
    ///
    /// `None` means the object is cluster-scoped, which is always in scope.
    pub fn in_scope(&self, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => self.namespaces.contains(ns),
        }
    }

    /// Named namespaces in scope, without the cluster-scoped sentinel
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces
            .iter()
            .map(String::as_str)
            .filter(|ns| !ns.is_empty())
    }

    /// One namespaced `Api` per watched namespace
    pub fn namespaced_apis<K>(&self, client: &Client) -> Vec<Api<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        self.namespaces()
            .map(|ns| Api::namespaced(client.clone(), ns))
            .collect()
    }
}
