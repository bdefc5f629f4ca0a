//! Namespace-hierarchy syncer
//!
//! Tenant namespaces are requested by creating anchors: the root anchor
//! `{tenant}` in the operator namespace, and one anchor per child namespace
//! inside the tenant's namespace. The hierarchy controller materialises the
//! namespaces asynchronously, so a missing parent is a requeue, not a failure.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DeleteParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{DeleteOutcome, EnsureOutcome};
use crate::crd::{unqualify_child_namespace, SubnamespaceAnchor, SubnamespaceAnchorSpec};
use crate::Result;

/// Secrets copied into specific child namespaces: (child, secret, source namespace)
pub const PROPAGATED_SECRETS: &[(&str, &str, &str)] = &[("slurm", "wlm-s3-credentials", "default")];

/// Namespace-hierarchy and secret operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Whether anchor `name` exists in namespace `parent`
    async fn anchor_exists(&self, parent: &str, name: &str) -> Result<bool>;

    /// Create anchor `name` in namespace `parent`
    async fn create_anchor(&self, parent: &str, name: &str) -> Result<()>;

    /// Delete anchor `name` from namespace `parent`
    async fn delete_anchor(&self, parent: &str, name: &str) -> Result<()>;

    /// Read a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
}

/// Kubernetes-backed [`NamespaceClient`]
pub struct KubeNamespaceClient {
    client: Client,
}

impl KubeNamespaceClient {
    /// Create a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn anchor_exists(&self, parent: &str, name: &str) -> Result<bool> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_anchor(&self, parent: &str, name: &str) -> Result<()> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        let mut anchor = SubnamespaceAnchor::new(name, SubnamespaceAnchorSpec {});
        anchor.metadata.namespace = Some(parent.to_string());
        api.create(&PostParams::default(), &anchor).await?;
        Ok(())
    }

    async fn delete_anchor(&self, parent: &str, name: &str) -> Result<()> {
        let api: Api<SubnamespaceAnchor> = Api::namespaced(self.client.clone(), parent);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }
}

/// Drives the tenant namespace hierarchy
pub struct NamespaceSyncer {
    client: Arc<dyn NamespaceClient>,
    root_namespace: String,
}

impl NamespaceSyncer {
    /// Create a syncer; tenant root anchors live in `root_namespace`
    pub fn new(client: Arc<dyn NamespaceClient>, root_namespace: impl Into<String>) -> Self {
        Self {
            client,
            root_namespace: root_namespace.into(),
        }
    }

    /// Ensure the tenant's root namespace anchor exists
    pub async fn ensure_root(&self, tenant: &str) -> Result<EnsureOutcome> {
        self.ensure_anchor(&self.root_namespace, tenant).await
    }

    /// Ensure a child namespace anchor exists under the tenant namespace
    pub async fn ensure_child(&self, tenant: &str, qualified: &str) -> Result<EnsureOutcome> {
        self.ensure_anchor(tenant, qualified).await
    }

    /// Delete a child namespace anchor
    pub async fn delete_child(&self, tenant: &str, qualified: &str) -> Result<DeleteOutcome> {
        self.delete_anchor(tenant, qualified).await
    }

    /// Delete the tenant's root namespace anchor
    ///
    /// The hierarchy controller forbids this while children remain; that is
    /// reported as [`DeleteOutcome::Blocked`].
    pub async fn delete_root(&self, tenant: &str) -> Result<DeleteOutcome> {
        self.delete_anchor(&self.root_namespace, tenant).await
    }

    async fn ensure_anchor(&self, parent: &str, name: &str) -> Result<EnsureOutcome> {
        if self.client.anchor_exists(parent, name).await? {
            debug!(%parent, anchor = %name, "anchor exists");
            return Ok(EnsureOutcome::Ready);
        }

        match self.client.create_anchor(parent, name).await {
            Ok(()) => {
                info!(%parent, anchor = %name, "created namespace anchor");
                Ok(EnsureOutcome::Ready)
            }
            Err(e) if e.is_conflict() => {
                info!(%parent, anchor = %name, "anchor created concurrently");
                Ok(EnsureOutcome::Ready)
            }
            Err(e) if e.is_not_found() => {
                info!(%parent, anchor = %name, "parent namespace not visible yet");
                Ok(EnsureOutcome::Requeue)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_anchor(&self, parent: &str, name: &str) -> Result<DeleteOutcome> {
        match self.client.delete_anchor(parent, name).await {
            Ok(()) => {
                info!(%parent, anchor = %name, "deleted namespace anchor");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!(%parent, anchor = %name, "anchor already absent");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(e) if e.status() == Some(403) => {
                info!(%parent, anchor = %name, "anchor deletion forbidden for now");
                Ok(DeleteOutcome::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy the secrets a child namespace needs into it
    ///
    /// Existing copies are left alone. A missing source is logged and
    /// skipped; a target namespace that is not materialised yet is a requeue.
    pub async fn propagate_secrets(&self, tenant: &str, qualified: &str) -> Result<EnsureOutcome> {
        let Some(child) = unqualify_child_namespace(tenant, qualified) else {
            return Ok(EnsureOutcome::Ready);
        };

        for (_, secret_name, source_namespace) in
            PROPAGATED_SECRETS.iter().filter(|(c, _, _)| *c == child)
        {
            if self.client.get_secret(qualified, secret_name).await?.is_some() {
                debug!(namespace = %qualified, secret = %secret_name, "secret already present");
                continue;
            }

            let Some(source) = self
                .client
                .get_secret(source_namespace, secret_name)
                .await?
            else {
                warn!(
                    namespace = %source_namespace,
                    secret = %secret_name,
                    "source secret not found, skipping copy"
                );
                continue;
            };

            let copy = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.to_string()),
                    namespace: Some(qualified.to_string()),
                    labels: source.metadata.labels.clone(),
                    ..Default::default()
                },
                data: source.data.clone(),
                string_data: source.string_data.clone(),
                type_: source.type_.clone(),
                immutable: source.immutable,
            };

            match self.client.create_secret(qualified, &copy).await {
                Ok(()) => info!(namespace = %qualified, secret = %secret_name, "copied secret"),
                Err(e) if e.is_conflict() => {}
                Err(e) if e.is_not_found() => {
                    info!(namespace = %qualified, "namespace not visible yet for secret copy");
                    return Ok(EnsureOutcome::Requeue);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(EnsureOutcome::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use kube::error::ErrorResponse;
    use mockall::predicate::eq;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: reason.to_string(),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    #[tokio::test]
    async fn root_anchor_is_created_in_operator_namespace() {
        let mut client = MockNamespaceClient::new();
        client.expect_anchor_exists().returning(|_, _| Ok(false));
        client
            .expect_create_anchor()
            .with(eq("tenants"), eq("blue"))
            .times(1)
            .returning(|_, _| Ok(()));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(syncer.ensure_root("blue").await.unwrap(), EnsureOutcome::Ready);
    }

    #[tokio::test]
    async fn missing_parent_requeues() {
        let mut client = MockNamespaceClient::new();
        client.expect_anchor_exists().returning(|_, _| Ok(false));
        client
            .expect_create_anchor()
            .returning(|_, _| Err(api_error(404, "NotFound")));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(
            syncer.ensure_child("blue", "blue-slurm").await.unwrap(),
            EnsureOutcome::Requeue
        );
    }

    #[tokio::test]
    async fn already_exists_is_ready() {
        let mut client = MockNamespaceClient::new();
        client.expect_anchor_exists().returning(|_, _| Ok(false));
        client
            .expect_create_anchor()
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(syncer.ensure_root("blue").await.unwrap(), EnsureOutcome::Ready);
    }

    #[tokio::test]
    async fn forbidden_root_delete_is_blocked() {
        let mut client = MockNamespaceClient::new();
        client
            .expect_delete_anchor()
            .returning(|_, _| Err(api_error(403, "Forbidden")));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(syncer.delete_root("blue").await.unwrap(), DeleteOutcome::Blocked);
    }

    #[tokio::test]
    async fn deleting_missing_anchor_is_success() {
        let mut client = MockNamespaceClient::new();
        client
            .expect_delete_anchor()
            .returning(|_, _| Err(api_error(404, "NotFound")));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(
            syncer.delete_child("blue", "blue-user").await.unwrap(),
            DeleteOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn slurm_namespace_receives_credentials_copy() {
        let mut client = MockNamespaceClient::new();
        client
            .expect_get_secret()
            .with(eq("blue-slurm"), eq("wlm-s3-credentials"))
            .returning(|_, _| Ok(None));
        client
            .expect_get_secret()
            .with(eq("default"), eq("wlm-s3-credentials"))
            .returning(|_, name| {
                Ok(Some(Secret {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some("default".to_string()),
                        resource_version: Some("42".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                }))
            });
        client
            .expect_create_secret()
            .withf(|ns, s| {
                ns == "blue-slurm"
                    && s.metadata.namespace.as_deref() == Some("blue-slurm")
                    && s.metadata.resource_version.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        assert_eq!(
            syncer.propagate_secrets("blue", "blue-slurm").await.unwrap(),
            EnsureOutcome::Ready
        );
    }

    #[tokio::test]
    async fn other_children_receive_nothing() {
        let mut client = MockNamespaceClient::new();
        client.expect_get_secret().never();
        client.expect_create_secret().never();

        let syncer = NamespaceSyncer::new(Arc::new(client), "tenants");
        syncer.propagate_secrets("blue", "blue-user").await.unwrap();
    }
}
