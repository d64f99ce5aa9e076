//! CRD installation
//!
//! The operator installs the multi-version PerformanceProfile CRD on start
//! using server-side apply, so the served versions always match the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceConversion, CustomResourceDefinition, ServiceReference, WebhookClientConfig,
    WebhookConversion,
};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::info;

use pao_common::retry::{retry_with_backoff, RetryConfig};
use pao_common::FIELD_MANAGER;
use pao_profile::VersionRegistry;

/// Attempts at installing the CRD before startup fails
const CRD_INSTALL_ATTEMPTS: u32 = 5;

/// Where the API server reaches the conversion webhook
#[derive(Clone, Debug)]
pub struct ConversionWebhook {
    /// Service name
    pub service: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: i32,
    /// PEM CA bundle used to verify the serving certificate
    pub ca_bundle: Option<Vec<u8>>,
}

/// The merged PerformanceProfile CRD, optionally wired to the conversion webhook
pub fn profile_crd(
    registry: &VersionRegistry,
    webhook: Option<&ConversionWebhook>,
) -> anyhow::Result<CustomResourceDefinition> {
    let mut crd = registry.crd()?;
    if let Some(webhook) = webhook {
        crd.spec.conversion = Some(CustomResourceConversion {
            strategy: "Webhook".to_string(),
            webhook: Some(WebhookConversion {
                client_config: Some(WebhookClientConfig {
                    service: Some(ServiceReference {
                        name: webhook.service.clone(),
                        namespace: webhook.namespace.clone(),
                        path: Some("/convert".to_string()),
                        port: Some(webhook.port),
                    }),
                    ca_bundle: webhook.ca_bundle.clone().map(ByteString),
                    url: None,
                }),
                conversion_review_versions: vec!["v1".to_string()],
            }),
        });
    }
    Ok(crd)
}

/// Install or update the PerformanceProfile CRD
pub async fn ensure_crds_installed(
    client: &Client,
    registry: &VersionRegistry,
    webhook: Option<&ConversionWebhook>,
) -> anyhow::Result<()> {
    let crd = profile_crd(registry, webhook)?;
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!(crd = %name, conversion_webhook = webhook.is_some(), "Installing CRD");
    let (crds, crd_name, params, crd) = (&crds, name.as_str(), &params, &crd);
    retry_with_backoff(
        &RetryConfig::with_max_attempts(CRD_INSTALL_ATTEMPTS),
        "install_crd",
        || async move { crds.patch(crd_name, params, &Patch::Apply(crd)).await },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;

    info!(crd = %name, "CRD installed/updated");
    Ok(())
}
