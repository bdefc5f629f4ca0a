//! Lifecycle hook dispatch
//!
//! On each tenant event the dispatcher calls tenant-local hooks in declaration
//! order, then global hooks in listing order. A blocking hook that fails
//! aborts the transition; a non-blocking hook is fire-and-log and is never
//! retried.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ListParams;
use kube::{Api, Client};
use serde::Serialize;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::credentials::SecretReader;
use crate::crd::{EventType, GlobalTenantHook, TenantHook, TenantSpec};
use crate::{Error, Result};

/// Body POSTed to every hook
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HookPayload {
    /// Desired state of the tenant at the time of the event
    #[serde(rename = "tenantspec")]
    pub tenant_spec: TenantSpec,
    /// Event being reported
    #[serde(rename = "eventtype")]
    pub event_type: EventType,
}

/// Credentials presented to a hook
#[derive(Clone, PartialEq)]
pub enum HookAuth {
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// HTTP basic authentication
    Basic {
        /// User name
        username: String,
        /// Password, if the secret carries one
        password: Option<String>,
    },
}

impl fmt::Debug for HookAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            HookAuth::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

/// Delivers a payload to a hook URL
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HookTransport: Send + Sync {
    /// POST the payload and return the HTTP status
    async fn post(
        &self,
        url: &str,
        payload: &HookPayload,
        blocking: bool,
        auth: Option<HookAuth>,
    ) -> Result<u16>;
}

/// Source of hooks that apply to every tenant
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GlobalHookSource: Send + Sync {
    /// Current global hooks in listing order
    async fn list_global_hooks(&self) -> Result<Vec<TenantHook>>;
}

/// [`HookTransport`] over HTTP
pub struct HttpHookTransport {
    http: reqwest::Client,
}

impl HttpHookTransport {
    /// Create a transport using the given client
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HookTransport for HttpHookTransport {
    async fn post(
        &self,
        url: &str,
        payload: &HookPayload,
        blocking: bool,
        auth: Option<HookAuth>,
    ) -> Result<u16> {
        let mut request = self
            .http
            .post(url)
            .header("Block", blocking.to_string())
            .json(payload);
        request = match auth {
            Some(HookAuth::Bearer(token)) => request.bearer_auth(token),
            Some(HookAuth::Basic { username, password }) => request.basic_auth(username, password),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::unavailable("hook", format!("POST {url}: {e}")))?;
        Ok(response.status().as_u16())
    }
}

/// [`GlobalHookSource`] reading GlobalTenantHook resources
pub struct KubeGlobalHookSource {
    client: Client,
}

impl KubeGlobalHookSource {
    /// Create a source using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GlobalHookSource for KubeGlobalHookSource {
    async fn list_global_hooks(&self) -> Result<Vec<TenantHook>> {
        let api: Api<GlobalTenantHook> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(TenantHook::from).collect())
    }
}

/// Calls the hooks subscribed to a tenant event
pub struct HookDispatcher {
    transport: Arc<dyn HookTransport>,
    globals: Arc<dyn GlobalHookSource>,
    secrets: Arc<dyn SecretReader>,
}

impl HookDispatcher {
    /// Create a dispatcher
    pub fn new(
        transport: Arc<dyn HookTransport>,
        globals: Arc<dyn GlobalHookSource>,
        secrets: Arc<dyn SecretReader>,
    ) -> Self {
        Self {
            transport,
            globals,
            secrets,
        }
    }

    /// Dispatch `event` for a tenant's desired state
    ///
    /// Returns [`Error::HookRejected`] for the first blocking hook that fails;
    /// no later hook is called in that case. Global hooks are listed only
    /// after every tenant hook has run; a failed listing is logged and the
    /// global hooks are skipped for this event.
    pub async fn dispatch(&self, spec: &TenantSpec, event: EventType) -> Result<()> {
        let payload = HookPayload {
            tenant_spec: spec.clone(),
            event_type: event,
        };

        self.run_all(&spec.tenant_hooks, &payload).await?;

        let globals = match self.globals.list_global_hooks().await {
            Ok(globals) => globals,
            Err(e) => {
                warn!(%event, error = %e, "failed to list global hooks, skipping them");
                return Ok(());
            }
        };
        self.run_all(&globals, &payload).await
    }

    async fn run_all(&self, hooks: &[TenantHook], payload: &HookPayload) -> Result<()> {
        let event = payload.event_type;
        for hook in hooks {
            if !hook.subscribes_to(event) {
                debug!(hook = %hook.name, %event, "hook not subscribed");
                continue;
            }

            match self.call(hook, payload).await {
                Ok(()) => {
                    info!(hook = %hook.name, url = %hook.url, %event, blocking = hook.blocking, "hook called");
                }
                Err(e) if hook.blocking => {
                    warn!(hook = %hook.name, url = %hook.url, %event, error = %e, "blocking hook failed");
                    return Err(Error::hook_rejected(&hook.name, e.to_string()));
                }
                Err(e) => {
                    warn!(hook = %hook.name, url = %hook.url, %event, error = %e, "notify hook failed, ignoring");
                }
            }
        }
        Ok(())
    }

    async fn call(&self, hook: &TenantHook, payload: &HookPayload) -> Result<()> {
        let auth = self.resolve_auth(hook).await?;
        let status = self
            .transport
            .post(&hook.url, payload, hook.blocking, auth)
            .await?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(Error::from_status(
                "hook",
                status,
                format!("POST {} returned {status}", hook.url),
            ))
        }
    }

    async fn resolve_auth(&self, hook: &TenantHook) -> Result<Option<HookAuth>> {
        let Some(creds) = &hook.credentials else {
            return Ok(None);
        };

        let data = self
            .secrets
            .read_secret(&creds.secret_namespace, &creds.secret_name)
            .await?
            .ok_or_else(|| {
                Error::authentication(
                    "hook",
                    format!(
                        "secret {}/{} not found",
                        creds.secret_namespace, creds.secret_name
                    ),
                )
            })?;

        if let Some(token) = data.get("token") {
            return Ok(Some(HookAuth::Bearer(token.clone())));
        }
        match data.get("username") {
            Some(username) => Ok(Some(HookAuth::Basic {
                username: username.clone(),
                password: data.get("password").cloned(),
            })),
            None => Err(Error::authentication(
                "hook",
                format!(
                    "secret {}/{} has neither token nor username",
                    creds.secret_namespace, creds.secret_name
                ),
            )),
        }
    }
}
