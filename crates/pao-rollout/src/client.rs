//! Read-only Kubernetes access for the verifier

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use pao_common::crd::MachineConfigPool;
use pao_common::Error;

/// Pool and node reads used by the verifier
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PoolClient: Send + Sync {
    /// Pools whose labels match every entry of `selector`
    async fn list_pools(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<MachineConfigPool>, Error>;

    /// Fetch a pool by name, `None` if it does not exist
    async fn get_pool(&self, name: &str) -> Result<Option<MachineConfigPool>, Error>;

    /// Number of nodes carrying every label in `labels`
    async fn count_nodes(&self, labels: &BTreeMap<String, String>) -> Result<usize, Error>;
}

/// [`PoolClient`] backed by the Kubernetes API
pub struct KubePoolClient {
    client: Client,
}

impl KubePoolClient {
    /// Create a new client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Render a label map as an equality-based selector string
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PoolClient for KubePoolClient {
    async fn list_pools(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<MachineConfigPool>, Error> {
        let api: Api<MachineConfigPool> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn get_pool(&self, name: &str) -> Result<Option<MachineConfigPool>, Error> {
        let api: Api<MachineConfigPool> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn count_nodes(&self, labels: &BTreeMap<String, String>) -> Result<usize, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list_metadata(&params).await?.items.len())
    }
}
