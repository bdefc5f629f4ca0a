//! Tenant persistence
//!
//! Every write is guarded by the resourceVersion of the object it was
//! computed from, so a stale write fails with 409 instead of clobbering a
//! concurrent change.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Tenant, TenantStatus};
use crate::{Result, FIELD_MANAGER};

/// Read and write Tenant resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Fetch the latest copy of a tenant
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Tenant>>;

    /// Replace the status of `tenant`, failing with 409 if it has changed since
    async fn replace_status(&self, tenant: &Tenant, status: &TenantStatus) -> Result<()>;

    /// Attach a finalizer
    async fn add_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()>;

    /// Detach a finalizer
    async fn remove_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()>;

    /// Reset the key-update request on the desired state
    async fn clear_key_update_flag(&self, tenant: &Tenant) -> Result<()>;
}

/// [`TenantStore`] backed by the Kubernetes API
pub struct KubeTenantStore {
    client: Client,
}

impl KubeTenantStore {
    /// Create a store
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, tenant: &Tenant) -> Api<Tenant> {
        let namespace = tenant.namespace().unwrap_or_default();
        Api::namespaced(self.client.clone(), &namespace)
    }

    async fn patch_finalizers(&self, tenant: &Tenant, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": tenant.resource_version(),
                "finalizers": finalizers,
            }
        });
        self.api(tenant)
            .patch(
                &tenant.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TenantStore for KubeTenantStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Tenant>> {
        let api: Api<Tenant> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(&self, tenant: &Tenant, status: &TenantStatus) -> Result<()> {
        let patch = json!({
            "metadata": { "resourceVersion": tenant.resource_version() },
            "status": status,
        });
        self.api(tenant)
            .patch_status(
                &tenant.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        debug!(tenant = %tenant.name_any(), state = ?status.state, "status written");
        Ok(())
    }

    async fn add_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()> {
        let mut finalizers = tenant.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(tenant, finalizers).await
    }

    async fn remove_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()> {
        let finalizers: Vec<String> = tenant
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(tenant, finalizers).await
    }

    async fn clear_key_update_flag(&self, tenant: &Tenant) -> Result<()> {
        let patch = json!({ "spec": { "requiresvaultkeyupdate": false } });
        self.api(tenant)
            .patch(
                &tenant.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
