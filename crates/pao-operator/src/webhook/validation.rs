//! Validating admission webhook for PerformanceProfile
//!
//! Runs the submitted object through the version gate at the version it was
//! submitted in. Invalid profiles are denied with the validation message,
//! so the submitter sees the field at fault immediately.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{debug, error, info};

use pao_profile::VersionRegistry;

use super::WebhookState;

/// Handle a validating `AdmissionReview`
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(validate_profile(&state.registry, &request).into_review())
}

fn validate_profile(
    registry: &VersionRegistry,
    request: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if matches!(request.operation, Operation::Delete | Operation::Connect) {
        return response;
    }
    let Some(object) = &request.object else {
        debug!(uid = %request.uid, "No object in request, allowing");
        return response;
    };

    let raw = match serde_json::to_value(object) {
        Ok(raw) => raw,
        Err(e) => return response.deny(format!("unreadable object: {e}")),
    };

    match registry.normalize(raw) {
        Ok(_) => {
            debug!(uid = %request.uid, profile = %request.name, "Profile admitted");
            response
        }
        Err(e) => {
            info!(uid = %request.uid, profile = %request.name, error = %e, "Profile denied");
            response.deny(e.to_string())
        }
    }
}
