//! Tenant controller
//!
//! [`reconcile`] drives one tenant toward its declared state; deletion is
//! handed to the finalizer-ordered teardown. Each pass for a tenant runs
//! start to finish on one task. Different tenants may reconcile concurrently.

mod reconcile;
mod store;
mod teardown;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, warn};

use crate::credentials::{KubeSecretReader, SecretReader};
use crate::crd::{Tenant, TenantStatus};
use crate::hooks::{GlobalHookSource, HookDispatcher, HookTransport, KubeGlobalHookSource};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::syncer::{
    EncryptionSyncer, HardwareStateClient, HardwareSyncer, IdentityClient, IdentitySyncer,
    KubeNamespaceClient, NamespaceClient, NamespaceSyncer, SecretEngineClient,
};
use crate::{Error, Result, DEFAULT_TENANT_NAMESPACE};

pub use reconcile::reconcile;
pub use store::{KubeTenantStore, TenantStore};

/// Requeue delay after a retryable failure
pub const RETRYABLE_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay after a failure that needs a spec change or operator attention
pub const TERMINAL_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for every reconciliation
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder()
///     .kube_client(client)
///     .namespace("tenants")
///     .hardware_client(hsm)
///     .identity_client(keycloak)
///     .secret_engine_client(vault)
///     .hook_transport(transport)
///     .build()?;
/// ```
pub struct Context {
    /// Tenant persistence
    pub store: Arc<dyn TenantStore>,
    /// Namespace anchors and secret propagation
    pub namespaces: NamespaceSyncer,
    /// Hardware partitions and groups
    pub hardware: HardwareSyncer,
    /// Tenant admin group
    pub identity: IdentitySyncer,
    /// Tenant encryption domain
    pub encryption: EncryptionSyncer,
    /// Lifecycle hooks
    pub hooks: HookDispatcher,
}

impl Context {
    /// Create a builder
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Read the latest tenant, apply `mutate` to its status and write it back
    ///
    /// Conflicts re-read and retry, so concurrent writers never lose updates.
    /// Returns the status as written.
    pub async fn update_status<F>(&self, tenant: &Tenant, mutate: F) -> Result<TenantStatus>
    where
        F: Fn(&mut TenantStatus) + Send + Sync,
    {
        let namespace = tenant.namespace().unwrap_or_default();
        let name = tenant.name_any();
        let (namespace, name, mutate) = (namespace.as_str(), name.as_str(), &mutate);

        retry_on_conflict(
            &RetryConfig::with_max_attempts(5),
            "update_status",
            || async move {
                let latest = self.store.get(namespace, name).await?.ok_or_else(|| {
                    Error::internal_with_context(
                        "update_status",
                        format!("tenant {namespace}/{name} no longer exists"),
                    )
                })?;
                let mut status = latest.status.clone().unwrap_or_default();
                mutate(&mut status);
                self.store.replace_status(&latest, &status).await?;
                Ok(status)
            },
        )
        .await
    }

    /// Detach `finalizer` from the latest copy of the tenant
    ///
    /// The status writes of the same pass bump the resourceVersion, so the
    /// caller's snapshot is never used for the write.
    pub async fn release_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()> {
        let namespace = tenant.namespace().unwrap_or_default();
        let name = tenant.name_any();
        let (namespace, name) = (namespace.as_str(), name.as_str());

        retry_on_conflict(
            &RetryConfig::with_max_attempts(5),
            "release_finalizer",
            || async move {
                match self.store.get(namespace, name).await? {
                    Some(latest) if latest.has_finalizer(finalizer) => {
                        self.store.remove_finalizer(&latest, finalizer).await
                    }
                    _ => Ok(()),
                }
            },
        )
        .await
    }
}

/// Builder for [`Context`]
///
/// Kubernetes-backed collaborators default from [`ContextBuilder::kube_client`];
/// the remote backing-system clients must always be supplied.
#[derive(Default)]
pub struct ContextBuilder {
    client: Option<Client>,
    namespace: Option<String>,
    store: Option<Arc<dyn TenantStore>>,
    namespace_client: Option<Arc<dyn NamespaceClient>>,
    hardware: Option<Arc<dyn HardwareStateClient>>,
    identity: Option<Arc<dyn IdentityClient>>,
    secret_engine: Option<Arc<dyn SecretEngineClient>>,
    hook_transport: Option<Arc<dyn HookTransport>>,
    global_hooks: Option<Arc<dyn GlobalHookSource>>,
    secrets: Option<Arc<dyn SecretReader>>,
}

impl ContextBuilder {
    /// Kubernetes client for the default store, anchor, hook and secret collaborators
    pub fn kube_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Namespace holding tenants and parenting every root anchor
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Override the tenant store
    pub fn tenant_store(mut self, store: Arc<dyn TenantStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the namespace-hierarchy client
    pub fn namespace_client(mut self, client: Arc<dyn NamespaceClient>) -> Self {
        self.namespace_client = Some(client);
        self
    }

    /// Hardware-state service client
    pub fn hardware_client(mut self, client: Arc<dyn HardwareStateClient>) -> Self {
        self.hardware = Some(client);
        self
    }

    /// Identity-provider client
    pub fn identity_client(mut self, client: Arc<dyn IdentityClient>) -> Self {
        self.identity = Some(client);
        self
    }

    /// Secret-engine client
    pub fn secret_engine_client(mut self, client: Arc<dyn SecretEngineClient>) -> Self {
        self.secret_engine = Some(client);
        self
    }

    /// Hook transport
    pub fn hook_transport(mut self, transport: Arc<dyn HookTransport>) -> Self {
        self.hook_transport = Some(transport);
        self
    }

    /// Override the global hook source
    pub fn global_hooks(mut self, source: Arc<dyn GlobalHookSource>) -> Self {
        self.global_hooks = Some(source);
        self
    }

    /// Override the secret reader used for hook credentials
    pub fn secret_reader(mut self, secrets: Arc<dyn SecretReader>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context> {
        let client = self.client;
        let from_kube = |what: &str| {
            client.clone().ok_or_else(|| {
                Error::internal_with_context(
                    "context",
                    format!("{what} not set and no kubernetes client to default from"),
                )
            })
        };
        let required = |what: &str| {
            Error::internal_with_context("context", format!("{what} is required"))
        };

        let store: Arc<dyn TenantStore> = match self.store {
            Some(store) => store,
            None => Arc::new(KubeTenantStore::new(from_kube("tenant store")?)),
        };
        let namespace_client: Arc<dyn NamespaceClient> = match self.namespace_client {
            Some(c) => c,
            None => Arc::new(KubeNamespaceClient::new(from_kube("namespace client")?)),
        };
        let global_hooks: Arc<dyn GlobalHookSource> = match self.global_hooks {
            Some(g) => g,
            None => Arc::new(KubeGlobalHookSource::new(from_kube("global hook source")?)),
        };
        let secrets: Arc<dyn SecretReader> = match self.secrets {
            Some(s) => s,
            None => Arc::new(KubeSecretReader::new(from_kube("secret reader")?)),
        };

        Ok(Context {
            store,
            namespaces: NamespaceSyncer::new(
                namespace_client,
                self.namespace
                    .unwrap_or_else(|| DEFAULT_TENANT_NAMESPACE.to_string()),
            ),
            hardware: HardwareSyncer::new(
                self.hardware.ok_or_else(|| required("hardware client"))?,
            ),
            identity: IdentitySyncer::new(
                self.identity.ok_or_else(|| required("identity client"))?,
            ),
            encryption: EncryptionSyncer::new(
                self.secret_engine
                    .ok_or_else(|| required("secret engine client"))?,
            ),
            hooks: HookDispatcher::new(
                self.hook_transport
                    .ok_or_else(|| required("hook transport"))?,
                global_hooks,
                secrets,
            ),
        })
    }
}

/// Requeue policy for failed reconciliations
///
/// Retryable failures come back quickly; anything else waits for a spec
/// change or a slow retry.
pub fn error_policy(tenant: Arc<Tenant>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            %error,
            tenant = %tenant.name_any(),
            "reconciliation failed, retrying"
        );
        Action::requeue(RETRYABLE_REQUEUE)
    } else {
        error!(
            %error,
            tenant = %tenant.name_any(),
            "reconciliation failed, needs attention"
        );
        Action::requeue(TERMINAL_REQUEUE)
    }
}
