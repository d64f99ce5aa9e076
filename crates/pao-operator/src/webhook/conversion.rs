//! CRD conversion webhook
//!
//! The API server stores profiles at the canonical version and calls this
//! endpoint whenever a client reads or writes another served version.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::core::conversion::{ConversionRequest, ConversionResponse, ConversionReview};
use kube::core::Status;
use tracing::{debug, error, warn};

use pao_common::Error;
use pao_profile::VersionRegistry;

use super::WebhookState;

/// Handle a `ConversionReview`
pub async fn convert_handler(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<ConversionReview>,
) -> Json<ConversionReview> {
    let request = match ConversionRequest::from_review(review) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse conversion review");
            return Json(
                ConversionResponse::invalid(Status::failure(&e.to_string(), "InvalidRequest"))
                    .into_review(),
            );
        }
    };

    Json(convert_request(&state.registry, request).into_review())
}

fn convert_request(registry: &VersionRegistry, mut request: ConversionRequest) -> ConversionResponse {
    let desired = request.desired_api_version.clone();
    let objects = std::mem::take(&mut request.objects);
    let uid = request.uid.clone();
    let response = ConversionResponse::for_request(request);

    match convert_objects(registry, objects, &desired) {
        Ok(converted) => {
            debug!(uid = %uid, desired = %desired, count = converted.len(), "Converted objects");
            response.success(converted)
        }
        Err(e) => {
            warn!(uid = %uid, desired = %desired, error = %e, "Conversion failed");
            response.failure(Status::failure(&e.to_string(), e.reason()))
        }
    }
}

/// Convert every object, failing the whole review on the first error
fn convert_objects(
    registry: &VersionRegistry,
    objects: Vec<serde_json::Value>,
    desired: &str,
) -> Result<Vec<serde_json::Value>, Error> {
    objects
        .into_iter()
        .map(|object| registry.convert(object, desired))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> Arc<WebhookState> {
        Arc::new(WebhookState::new(Arc::new(VersionRegistry::new())))
    }

    fn review(desired: &str, objects: Vec<serde_json::Value>) -> ConversionReview {
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "desiredAPIVersion": desired,
                "objects": objects
            }
        }))
        .unwrap()
    }

    fn stored_v2(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "performance.openshift.io/v2",
            "kind": "PerformanceProfile",
            "metadata": {"name": name},
            "spec": {
                "cpu": {"reserved": "0-1", "isolated": "2-7", "offlined": "8-9"},
                "nodeSelector": {"node-role.kubernetes.io/worker-cnf": ""},
                "globallyDisableIrqLoadBalancing": true
            }
        })
    }

    async fn call(review: ConversionReview) -> serde_json::Value {
        let Json(out) = convert_handler(State(state()), Json(review)).await;
        serde_json::to_value(out).unwrap()
    }

    #[tokio::test]
    async fn converts_down_to_v1() {
        let out = call(review(
            "performance.openshift.io/v1",
            vec![stored_v2("a"), stored_v2("b")],
        ))
        .await;

        let response = &out["response"];
        assert_eq!(response["uid"], "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(response["result"]["status"], "Success");
        let converted = response["convertedObjects"].as_array().unwrap();
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0]["apiVersion"], "performance.openshift.io/v1");
        assert_eq!(converted[0]["metadata"]["name"], "a");
        assert_eq!(converted[0]["spec"]["cpu"]["balanceIsolated"], false);
        assert!(converted[0]["spec"]["cpu"].get("offlined").is_none());
    }

    #[tokio::test]
    async fn converts_stored_objects_without_validating() {
        let mut legacy = stored_v2("old");
        legacy["spec"]["cpu"]["isolated"] = json!("0-3");

        let out = call(review("performance.openshift.io/v1alpha1", vec![legacy])).await;
        assert_eq!(out["response"]["result"]["status"], "Success");
        assert_eq!(
            out["response"]["convertedObjects"][0]["apiVersion"],
            "performance.openshift.io/v1alpha1"
        );
    }

    #[tokio::test]
    async fn unsupported_version_fails_the_review() {
        let out = call(review("performance.openshift.io/v3", vec![stored_v2("a")])).await;
        assert_eq!(out["response"]["result"]["status"], "Failure");
        assert!(out["response"]["convertedObjects"]
            .as_array()
            .map_or(true, |objects| objects.is_empty()));
    }
}
