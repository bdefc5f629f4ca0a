//! Validating admission webhook for Tenants
//!
//! Create and update requests are checked by the [`AdmissionValidator`]
//! before they are persisted; every accepted transition then runs the
//! tenant's lifecycle hooks, so a failing blocking hook turns into an
//! API-level rejection. Updates that leave the declared state untouched
//! (finalizer and metadata patches, or the operator clearing the key-update
//! request) are allowed without validation or hooks.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionValidator;
use crate::crd::{EventType, Tenant};
use crate::hooks::HookDispatcher;
use crate::Result;

/// Shared state for webhook handlers
pub struct WebhookState {
    /// Hardware eligibility and exclusivity checks
    pub validator: AdmissionValidator,
    /// Lifecycle hooks run on each accepted transition
    pub hooks: HookDispatcher,
}

impl WebhookState {
    /// Create webhook state
    pub fn new(validator: AdmissionValidator, hooks: HookDispatcher) -> Self {
        Self { validator, hooks }
    }
}

/// Create the webhook router
///
/// - POST /validate/tenants - validate Tenant create/update/delete
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/validate/tenants", post(validate_handler))
        .with_state(state)
}

/// Handle a validating admission review for a Tenant
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Tenant>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Tenant> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match review(&state, &req).await {
        Ok(()) => AdmissionResponse::from(&req),
        Err(e) => {
            warn!(uid = %req.uid, tenant = %req.name, error = %e, "denying tenant change");
            AdmissionResponse::from(&req).deny(e.to_string())
        }
    };
    Json(response.into_review())
}

async fn review(state: &WebhookState, req: &AdmissionRequest<Tenant>) -> Result<()> {
    match (&req.operation, &req.object, &req.old_object) {
        (Operation::Create, Some(tenant), _) => {
            info!(tenant = %tenant.name_any(), "validating create");
            state.validator.validate_create(tenant).await?;
            state.hooks.dispatch(&tenant.spec, EventType::Create).await
        }
        (Operation::Update, Some(tenant), Some(old)) => {
            if tenant.spec.same_declaration(&old.spec) {
                debug!(tenant = %tenant.name_any(), "declared state unchanged, allowing");
                return Ok(());
            }
            info!(tenant = %tenant.name_any(), "validating update");
            state.validator.validate_update(old, tenant).await?;
            state.hooks.dispatch(&tenant.spec, EventType::Update).await
        }
        (Operation::Delete, _, Some(old)) => {
            info!(tenant = %old.name_any(), "validating delete");
            state.hooks.dispatch(&old.spec, EventType::Delete).await
        }
        _ => {
            debug!(uid = %req.uid, operation = ?req.operation, "nothing to validate");
            Ok(())
        }
    }
}
