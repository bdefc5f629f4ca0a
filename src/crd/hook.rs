//! Lifecycle hook types and the GlobalTenantHook CRD

use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tenant lifecycle event a hook can subscribe to
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Tenant created
    Create,
    /// Tenant updated
    Update,
    /// Tenant deleted
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Create => write!(f, "CREATE"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// Reference to a secret holding hook credentials
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HookCredentials {
    /// Secret name
    #[serde(rename = "secretname")]
    pub secret_name: String,
    /// Secret namespace
    #[serde(rename = "secretnamespace")]
    pub secret_namespace: String,
}

/// A registered callback invoked on tenant lifecycle events
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantHook {
    /// Hook name, used in logs and errors
    pub name: String,
    /// Target URL the payload is POSTed to
    pub url: String,
    /// Events this hook is called for
    #[serde(rename = "eventtypes", default)]
    pub event_types: Vec<EventType>,
    /// Failure aborts the transition
    #[serde(rename = "blockingcall", default)]
    pub blocking: bool,
    /// Optional credentials sent with the call
    #[serde(
        rename = "hookcredentials",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credentials: Option<HookCredentials>,
}

impl TenantHook {
    /// Whether this hook wants to hear about `event`
    pub fn subscribes_to(&self, event: EventType) -> bool {
        self.event_types.contains(&event)
    }
}

/// GlobalTenantHook registers a hook that applies to every tenant.
///
/// Example:
/// ```yaml
/// apiVersion: tapms.hpe.com/v1alpha1
/// kind: GlobalTenantHook
/// metadata:
///   name: slurm-sync
/// spec:
///   name: slurm-sync
///   url: http://slurm-operator.services/tenant-hook
///   eventtypes: [CREATE, UPDATE, DELETE]
///   blockingcall: true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tapms.hpe.com",
    version = "v1alpha1",
    kind = "GlobalTenantHook",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Blocking","type":"boolean","jsonPath":".spec.blockingcall"}"#
)]
pub struct GlobalTenantHookSpec {
    /// Hook name, used in logs and errors
    pub name: String,
    /// Target URL the payload is POSTed to
    pub url: String,
    /// Events this hook is called for
    #[serde(rename = "eventtypes", default)]
    pub event_types: Vec<EventType>,
    /// Failure aborts the transition
    #[serde(rename = "blockingcall", default)]
    pub blocking: bool,
    /// Optional credentials sent with the call
    #[serde(
        rename = "hookcredentials",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credentials: Option<HookCredentials>,
}

impl From<&GlobalTenantHook> for TenantHook {
    fn from(hook: &GlobalTenantHook) -> Self {
        TenantHook {
            name: hook.spec.name.clone(),
            url: hook.spec.url.clone(),
            event_types: hook.spec.event_types.clone(),
            blocking: hook.spec.blocking,
            credentials: hook.spec.credentials.clone(),
        }
    }
}
