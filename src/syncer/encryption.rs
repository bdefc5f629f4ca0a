//! Encryption-domain syncer
//!
//! A tenant encryption domain is three secret-engine resources that only make
//! sense together: a transit engine mounted at the domain name, a policy
//! `allow_{domain}` granting access to it, and a Kubernetes auth role
//! `{domain}` binding that policy to the tenant namespace. Provisioning is
//! all-or-nothing; a later step failing rolls back the earlier ones.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::DeleteOutcome;
use crate::crd::{TenantKms, TenantKmsStatus};
use crate::rest::RestClient;
use crate::{Result, ENCRYPTION_DOMAIN_PREFIX};

/// Raw secret-engine operations, addressed by logical path
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretEngineClient: Send + Sync {
    /// Read the `data` of a path, None when nothing is there
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    /// Write a path
    async fn write(&self, path: &str, body: &Value) -> Result<()>;

    /// Delete a path
    async fn delete(&self, path: &str) -> Result<()>;
}

/// [`SecretEngineClient`] over the secret engine's HTTP API
pub struct HttpSecretEngineClient {
    rest: RestClient,
}

impl HttpSecretEngineClient {
    /// Create a client; `rest` must be rooted at the `/v1` API
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl SecretEngineClient for HttpSecretEngineClient {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let response = self.rest.send(Method::GET, path, None).await?;
        // Unmounted engines answer 400 rather than 404
        if response.status == 404
            || (response.status == 400 && response.body.contains("No secret engine mount"))
        {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(self.rest.error_for(&Method::GET, path, &response));
        }
        let mut body: Value = response.json()?;
        Ok(Some(match body.get_mut("data") {
            Some(data) => data.take(),
            None => body,
        }))
    }

    async fn write(&self, path: &str, body: &Value) -> Result<()> {
        self.rest
            .expect_success(Method::POST, path, Some(body))
            .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.rest.expect_success(Method::DELETE, path, None).await?;
        Ok(())
    }
}

/// Domain name derived from the tenant UUID
pub fn domain_name(uuid: &str) -> String {
    format!("{ENCRYPTION_DOMAIN_PREFIX}{uuid}")
}

fn mount_path(domain: &str) -> String {
    format!("sys/mounts/{domain}")
}

fn policy_name(domain: &str) -> String {
    format!("allow_{domain}")
}

fn policy_path(domain: &str) -> String {
    format!("sys/policy/{}", policy_name(domain))
}

fn role_path(domain: &str) -> String {
    format!("auth/kubernetes/role/{domain}")
}

fn key_path(domain: &str, key: &str) -> String {
    format!("{domain}/keys/{key}")
}

fn public_key_of(key_data: &Value) -> Result<String> {
    Ok(serde_json::to_string(
        key_data.get("keys").unwrap_or(&Value::Null),
    )?)
}

/// Drives tenant encryption domains
pub struct EncryptionSyncer {
    client: Arc<dyn SecretEngineClient>,
}

impl EncryptionSyncer {
    /// Create a syncer
    pub fn new(client: Arc<dyn SecretEngineClient>) -> Self {
        Self { client }
    }

    /// Ensure the tenant's domain and key exist and mirror the key material
    ///
    /// The domain name is taken from `recorded` when present, otherwise
    /// derived from `uuid`. Key name and type follow `desired` only for a new
    /// domain or when `rotate` is set; otherwise the recorded key is kept.
    /// Returns the new observed key-management state.
    pub async fn ensure_domain(
        &self,
        tenant: &str,
        uuid: &str,
        desired: &TenantKms,
        recorded: &TenantKmsStatus,
        rotate: bool,
    ) -> Result<TenantKmsStatus> {
        let domain = recorded
            .domain
            .clone()
            .unwrap_or_else(|| domain_name(uuid));

        if self.client.read(&mount_path(&domain)).await?.is_none() {
            self.provision(tenant, &domain).await?;
        } else {
            debug!(%domain, "encryption domain exists");
        }

        let adopt_desired = rotate || recorded.key_name.is_none();
        let key_name = match (&recorded.key_name, adopt_desired) {
            (Some(name), false) => name.clone(),
            _ => desired.key_name.clone(),
        };
        let key_type = match (&recorded.key_type, adopt_desired) {
            (Some(kind), false) => kind.clone(),
            _ => desired.key_type.clone(),
        };

        let path = key_path(&domain, &key_name);
        let public_key = match self.client.read(&path).await? {
            Some(data) => {
                let current = public_key_of(&data)?;
                if recorded.public_key.as_deref() != Some(current.as_str()) {
                    info!(%domain, key = %key_name, "key material changed, updating");
                }
                current
            }
            None => {
                info!(%domain, key = %key_name, %key_type, "creating tenant key");
                self.client
                    .write(&path, &json!({ "type": key_type }))
                    .await
                    .map_err(|e| e.context(format!("creating key {path}")))?;
                let data = self.client.read(&path).await?.ok_or_else(|| {
                    crate::Error::internal_with_context(
                        "encryption",
                        format!("key {path} missing right after creation"),
                    )
                })?;
                public_key_of(&data)?
            }
        };

        Ok(TenantKmsStatus {
            domain: Some(domain),
            key_name: Some(key_name),
            key_type: Some(key_type),
            public_key: Some(public_key),
        })
    }

    /// Create engine, policy and role in order, undoing earlier steps on failure
    async fn provision(&self, tenant: &str, domain: &str) -> Result<()> {
        let steps = [
            (
                mount_path(domain),
                json!({ "type": "transit", "description": tenant }),
            ),
            (
                policy_path(domain),
                json!({
                    "policy": format!(
                        "path \"{domain}/*\" {{\n  capabilities = [\"read\", \"update\", \"list\"]\n}}"
                    )
                }),
            ),
            (
                role_path(domain),
                json!({
                    "bound_service_account_names": "default",
                    "bound_service_account_namespaces": tenant,
                    "policies": policy_name(domain),
                }),
            ),
        ];

        for (done, (path, body)) in steps.iter().enumerate() {
            if let Err(e) = self.client.write(path, body).await {
                warn!(%domain, %path, error = %e, "provisioning failed, rolling back");
                for (created, _) in steps[..done].iter().rev() {
                    if let Err(cleanup) = self.client.delete(created).await {
                        warn!(path = %created, error = %cleanup, "rollback step failed");
                    }
                }
                return Err(e.context(format!("provisioning {path}")));
            }
            info!(%domain, %path, "provisioned");
        }

        Ok(())
    }

    /// Delete engine, policy and role of a recorded domain
    pub async fn delete_domain(&self, recorded: &TenantKmsStatus) -> Result<DeleteOutcome> {
        let Some(domain) = recorded.domain.as_deref() else {
            return Ok(DeleteOutcome::AlreadyAbsent);
        };

        let outcome = if self.client.read(&mount_path(domain)).await?.is_some() {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyAbsent
        };

        for path in [mount_path(domain), policy_path(domain), role_path(domain)] {
            match self.client.delete(&path).await {
                Ok(()) => debug!(%path, "deleted"),
                Err(e) if e.is_not_found() => debug!(%path, "already absent"),
                Err(e) => return Err(e.context(format!("deleting {path}"))),
            }
        }

        info!(%domain, "encryption domain removed");
        Ok(outcome)
    }
}
