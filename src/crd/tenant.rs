//! Tenant CRD
//!
//! A Tenant declares which hardware nodes, child namespaces, key-management
//! settings and lifecycle hooks belong to one slice of the cluster. The status
//! mirrors the spec's shape and records what was last applied successfully.

use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::hook::TenantHook;
use crate::diff::same_members;

/// Separator between the tenant name and a child namespace's relative name
pub const NAMESPACE_SEPARATOR: char = '-';

/// Tenant declares the desired state of a cluster tenant.
///
/// Example:
/// ```yaml
/// apiVersion: tapms.hpe.com/v1alpha3
/// kind: Tenant
/// metadata:
///   name: vcluster-blue
///   namespace: tenants
/// spec:
///   tenantname: vcluster-blue
///   childnamespaces: [slurm, user]
///   tenantresources:
///     - type: compute
///       xnames: [x1000c0s0b0n0, x1000c0s0b1n0]
///       hsmpartitionname: blue
///       hsmgrouplabel: blue
///       enforceexclusivehsmgroups: true
///   tenantkms:
///     enablekms: true
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tapms.hpe.com",
    version = "v1alpha3",
    kind = "Tenant",
    namespaced,
    status = "TenantStatus",
    shortname = "tenant",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"UUID","type":"string","jsonPath":".status.uuid"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TenantSpec {
    /// Stable tenant name, the primary key in every backing system
    #[serde(rename = "tenantname")]
    pub tenant_name: String,

    /// Child namespaces, relative to the tenant's root namespace
    #[serde(rename = "childnamespaces", default)]
    pub child_namespaces: Vec<String>,

    /// Hardware membership, at most one entry per class
    #[serde(rename = "tenantresources", default)]
    pub tenant_resources: Vec<TenantResource>,

    /// Key-management settings
    #[serde(rename = "tenantkms", default)]
    pub tenant_kms: TenantKms,

    /// Tenant-local lifecycle hooks, called in declaration order
    #[serde(rename = "tenanthooks", default)]
    pub tenant_hooks: Vec<TenantHook>,

    /// Request a re-read of the tenant key; cleared by the operator once applied
    #[serde(rename = "requiresvaultkeyupdate", default)]
    pub requires_key_update: bool,
}

impl TenantSpec {
    /// Equal once the key-update request is disregarded
    ///
    /// The operator clears that request itself, so a change to it alone
    /// never alters what the tenant declares.
    pub fn same_declaration(&self, other: &TenantSpec) -> bool {
        let mut other = other.clone();
        other.requires_key_update = self.requires_key_update;
        *self == other
    }
}

/// One class of hardware membership (e.g. "compute", "application")
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantResource {
    /// Class label
    #[serde(rename = "type")]
    pub class: String,

    /// Member node identifiers
    #[serde(default)]
    pub xnames: Vec<String>,

    /// Hardware partition the members are placed in
    #[serde(
        rename = "hsmpartitionname",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub partition: Option<String>,

    /// Hardware group the members are placed in
    #[serde(
        rename = "hsmgrouplabel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub group: Option<String>,

    /// Members may not belong to any other exclusive group; immutable once the group exists
    #[serde(rename = "enforceexclusivehsmgroups", default)]
    pub exclusive: bool,
}

impl TenantResource {
    /// Structural equality ignoring member order
    pub fn same_as(&self, other: &TenantResource) -> bool {
        self.class == other.class
            && self.partition == other.partition
            && self.group == other.group
            && self.exclusive == other.exclusive
            && same_members(&self.xnames, &other.xnames)
    }
}

/// Desired key-management settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantKms {
    /// Provision an encryption domain for the tenant
    #[serde(rename = "enablekms", default)]
    pub enabled: bool,

    /// Name of the tenant key
    #[serde(rename = "keyname", default = "default_key_name")]
    pub key_name: String,

    /// Key algorithm
    #[serde(rename = "keytype", default = "default_key_type")]
    pub key_type: String,
}

fn default_key_name() -> String {
    "key1".to_string()
}

fn default_key_type() -> String {
    "rsa-3072".to_string()
}

impl Default for TenantKms {
    fn default() -> Self {
        Self {
            enabled: false,
            key_name: default_key_name(),
            key_type: default_key_type(),
        }
    }
}

/// Observed key-management state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantKmsStatus {
    /// Encryption domain name; assigned once and never regenerated
    #[serde(rename = "transitname", default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Key name applied
    #[serde(rename = "keyname", default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,

    /// Key algorithm applied
    #[serde(rename = "keytype", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,

    /// Exported public key material, mirrored from the key-management system
    #[serde(rename = "publickey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Lifecycle state of a tenant
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TenantState {
    /// First observed, nothing applied yet
    #[default]
    New,
    /// A reconciliation pass is applying changes
    Deploying,
    /// Observed state matches desired state
    Deployed,
    /// Teardown in progress
    Deleting,
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantState::New => write!(f, "New"),
            TenantState::Deploying => write!(f, "Deploying"),
            TenantState::Deployed => write!(f, "Deployed"),
            TenantState::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Observed state of a Tenant
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantStatus {
    /// Lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TenantState>,

    /// Generated identifier, assigned once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Fully-qualified child namespaces last applied
    #[serde(rename = "childnamespaces", default)]
    pub child_namespaces: Vec<String>,

    /// Hardware membership last applied
    #[serde(rename = "tenantresources", default)]
    pub tenant_resources: Vec<TenantResource>,

    /// Hooks in effect at the last successful pass
    #[serde(rename = "tenanthooks", default)]
    pub tenant_hooks: Vec<TenantHook>,

    /// Key-management state
    #[serde(rename = "tenantkms", default)]
    pub tenant_kms: TenantKmsStatus,

    /// RFC 3339 time of the last successful pass
    #[serde(
        rename = "lastdeployed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_deployed: Option<String>,
}

/// Fully-qualified name of a tenant's child namespace
pub fn qualify_child_namespace(tenant: &str, child: &str) -> String {
    format!("{tenant}{NAMESPACE_SEPARATOR}{child}")
}

/// Relative name of a qualified child namespace, if it belongs to `tenant`
pub fn unqualify_child_namespace<'a>(tenant: &str, qualified: &'a str) -> Option<&'a str> {
    qualified
        .strip_prefix(tenant)?
        .strip_prefix(NAMESPACE_SEPARATOR)
}

impl Tenant {
    /// Stable tenant name
    pub fn tenant_name(&self) -> &str {
        &self.spec.tenant_name
    }

    /// Recorded lifecycle state, `New` when nothing is recorded
    pub fn state(&self) -> TenantState {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .unwrap_or_default()
    }

    /// Recorded UUID, if one was assigned
    pub fn uuid(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.uuid.as_deref())
    }

    /// Deletion has been requested by the API server
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the tenant carries the given finalizer
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Desired child namespaces in fully-qualified form
    pub fn desired_child_namespaces(&self) -> Vec<String> {
        self.spec
            .child_namespaces
            .iter()
            .map(|c| qualify_child_namespace(self.tenant_name(), c.trim()))
            .collect()
    }

    /// Observed child namespaces in fully-qualified form
    pub fn observed_child_namespaces(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.child_namespaces.as_slice())
            .unwrap_or_default()
    }

    /// Observed hardware membership
    pub fn observed_resources(&self) -> &[TenantResource] {
        self.status
            .as_ref()
            .map(|s| s.tenant_resources.as_slice())
            .unwrap_or_default()
    }

    /// Structural equality between desired and observed state
    ///
    /// Resources and namespaces compare as sets, hooks in order. Generated
    /// fields (state, uuid, key material, timestamps) are ignored.
    pub fn is_converged(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };

        let desired = &self.spec.tenant_resources;
        let observed = &status.tenant_resources;
        let resources_match = desired.len() == observed.len()
            && desired
                .iter()
                .all(|d| observed.iter().any(|o| d.same_as(o)));

        resources_match
            && same_members(&self.desired_child_namespaces(), &status.child_namespaces)
            && self.spec.tenant_hooks == status.tenant_hooks
    }
}
