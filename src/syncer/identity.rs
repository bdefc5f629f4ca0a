//! Identity-provider group syncer
//!
//! Each tenant owns one admin group named `{tenant}-tenant-admin`. The group
//! is created once and only removed during teardown.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::DeleteOutcome;
use crate::rest::RestClient;
use crate::Result;

/// Group as stored by the identity provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IdentityGroup {
    /// Server-assigned identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Group name
    pub name: String,
    /// Group path, `/{name}` for top-level groups
    #[serde(default)]
    pub path: String,
}

/// Name of a tenant's admin group
pub fn admin_group_name(tenant: &str) -> String {
    format!("{tenant}-tenant-admin")
}

/// Identity-provider group operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Find a top-level group by exact name
    async fn find_group(&self, name: &str) -> Result<Option<IdentityGroup>>;

    /// Create a group
    async fn create_group(&self, group: &IdentityGroup) -> Result<()>;

    /// Delete a group by identifier
    async fn delete_group(&self, id: &str) -> Result<()>;
}

/// [`IdentityClient`] using the identity provider's admin REST API
pub struct HttpIdentityClient {
    rest: RestClient,
}

impl HttpIdentityClient {
    /// Create a client; `rest` must be rooted at the realm's admin API
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn find_group(&self, name: &str) -> Result<Option<IdentityGroup>> {
        let groups: Option<Vec<IdentityGroup>> = self
            .rest
            .get_json(&format!("groups?search={name}&exact=true"))
            .await?;
        Ok(groups.unwrap_or_default().into_iter().find(|g| g.name == name))
    }

    async fn create_group(&self, group: &IdentityGroup) -> Result<()> {
        let body = serde_json::to_value(group)?;
        self.rest
            .expect_success(Method::POST, "groups", Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_group(&self, id: &str) -> Result<()> {
        self.rest
            .expect_success(Method::DELETE, &format!("groups/{id}"), None)
            .await?;
        Ok(())
    }
}

/// Drives the tenant admin group
pub struct IdentitySyncer {
    client: Arc<dyn IdentityClient>,
}

impl IdentitySyncer {
    /// Create a syncer
    pub fn new(client: Arc<dyn IdentityClient>) -> Self {
        Self { client }
    }

    /// Create the tenant admin group when absent
    pub async fn ensure_exists(&self, tenant: &str) -> Result<()> {
        let name = admin_group_name(tenant);
        if self.client.find_group(&name).await?.is_some() {
            debug!(group = %name, "identity group exists");
            return Ok(());
        }

        let group = IdentityGroup {
            id: None,
            path: format!("/{name}"),
            name: name.clone(),
        };
        match self.client.create_group(&group).await {
            Ok(()) => {
                info!(group = %name, "created identity group");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!(group = %name, "identity group created concurrently");
                Ok(())
            }
            Err(e) => Err(e.context(format!("creating identity group {name}"))),
        }
    }

    /// Delete the tenant admin group; absence is success
    pub async fn delete(&self, tenant: &str) -> Result<DeleteOutcome> {
        let name = admin_group_name(tenant);
        let Some(group) = self.client.find_group(&name).await? else {
            debug!(group = %name, "identity group already absent");
            return Ok(DeleteOutcome::AlreadyAbsent);
        };
        let Some(id) = group.id else {
            debug!(group = %name, "identity group has no id, nothing to delete");
            return Ok(DeleteOutcome::AlreadyAbsent);
        };

        match self.client.delete_group(&id).await {
            Ok(()) => {
                info!(group = %name, "deleted identity group");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => Err(e.context(format!("deleting identity group {name}"))),
        }
    }
}
