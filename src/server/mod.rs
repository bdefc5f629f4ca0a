//! Read-only tenant status API
//!
//! Serves tenants from the controller's reflector cache, never from the API
//! server directly:
//!
//! - `GET /apis/tapms/v1/tenants` - every tenant, sorted by name
//! - `GET /apis/tapms/v1/tenant/{id}` - one tenant by name or UUID
//!
//! Unknown routes answer a JSON 404.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::crd::Tenant;

/// Read access to the current set of tenants
pub trait TenantCatalog: Send + Sync {
    /// Snapshot of every known tenant
    fn tenants(&self) -> Vec<Arc<Tenant>>;
}

impl TenantCatalog for Store<Tenant> {
    fn tenants(&self) -> Vec<Arc<Tenant>> {
        self.state()
    }
}

/// Error body returned by every failing route
#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Build the status router
pub fn status_router(catalog: Arc<dyn TenantCatalog>) -> Router {
    Router::new()
        .route("/apis/tapms/v1/tenants", get(list_tenants))
        .route("/apis/tapms/v1/tenant/{id}", get(get_tenant))
        .fallback(|| async { not_found("Page not found") })
        .with_state(catalog)
}

/// Serve the status API until the listener fails
pub async fn start_status_server(catalog: Arc<dyn TenantCatalog>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!(error = %e, %port, "failed to bind status API port");
        e
    })?;
    info!(%addr, "status API started");
    axum::serve(listener, status_router(catalog)).await
}

async fn list_tenants(State(catalog): State<Arc<dyn TenantCatalog>>) -> Response {
    let mut tenants = catalog.tenants();
    tenants.sort_by_key(|t| t.name_any());
    debug!(count = tenants.len(), "listing tenants");
    let items: Vec<&Tenant> = tenants.iter().map(Arc::as_ref).collect();

    Json(json!({
        "apiVersion": "tapms.hpe.com/v1alpha3",
        "kind": "TenantList",
        "items": items,
    }))
    .into_response()
}

async fn get_tenant(
    State(catalog): State<Arc<dyn TenantCatalog>>,
    Path(id): Path<String>,
) -> Response {
    let found = catalog
        .tenants()
        .into_iter()
        .find(|t| t.name_any() == id || t.uuid() == Some(id.as_str()));

    match found {
        Some(tenant) => Json(tenant.as_ref()).into_response(),
        None => not_found(format!("Tenant with name/uuid '{id}' not found.")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{TenantSpec, TenantState, TenantStatus};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FixedCatalog(Vec<Arc<Tenant>>);

    impl TenantCatalog for FixedCatalog {
        fn tenants(&self) -> Vec<Arc<Tenant>> {
            self.0.clone()
        }
    }

    fn tenant(name: &str, uuid: &str) -> Arc<Tenant> {
        let mut t = Tenant::new(
            name,
            TenantSpec {
                tenant_name: name.to_string(),
                ..Default::default()
            },
        );
        t.status = Some(TenantStatus {
            state: Some(TenantState::Deployed),
            uuid: Some(uuid.to_string()),
            ..Default::default()
        });
        Arc::new(t)
    }

    fn router() -> Router {
        status_router(Arc::new(FixedCatalog(vec![
            tenant("red", "uuid-red"),
            tenant("blue", "uuid-blue"),
        ])))
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let response = router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn lists_tenants_sorted_by_name() {
        let (status, body) = get_json("/apis/tapms/v1/tenants").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "TenantList");
        let names: Vec<&str> = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["blue", "red"]);
    }

    #[tokio::test]
    async fn finds_tenant_by_name_or_uuid() {
        let (status, by_name) = get_json("/apis/tapms/v1/tenant/blue").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_name["status"]["uuid"], "uuid-blue");

        let (status, by_uuid) = get_json("/apis/tapms/v1/tenant/uuid-red").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_uuid["spec"]["tenantname"], "red");
    }

    #[tokio::test]
    async fn unknown_tenant_is_404() {
        let (status, body) = get_json("/apis/tapms/v1/tenant/green").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Tenant with name/uuid 'green' not found.");
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let (status, body) = get_json("/apis/tapms/v2/whatever").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Page not found");
    }
}
