//! Bearer token acquisition for backing systems
//!
//! Tokens are requested fresh on every call. Each backing system has its own
//! flow: a client-credentials grant for the hardware-state service, a
//! privileged password grant for the identity service, and a Kubernetes
//! service-account login for the secret engine. Any failure along the way is
//! reported as [`Error::Authentication`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Namespace and name of the service-to-service client secret
pub const SERVICE_CLIENT_SECRET: (&str, &str) = ("default", "admin-client-auth");

/// Namespace and name of the privileged identity-admin secret
pub const IDENTITY_ADMIN_SECRET: (&str, &str) = ("services", "keycloak-master-admin-auth");

/// Remote system the operator talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackingSystem {
    /// Hardware partition/group membership service
    HardwareState,
    /// Identity provider holding tenant admin groups
    Identity,
    /// Secret engine holding tenant encryption domains
    SecretEngine,
}

impl BackingSystem {
    /// Short name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            BackingSystem::HardwareState => "hsm",
            BackingSystem::Identity => "keycloak",
            BackingSystem::SecretEngine => "vault",
        }
    }
}

impl fmt::Display for BackingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Obtain a bearer token for a backing system
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Request a new token; never served from a cache
    async fn token(&self, system: BackingSystem) -> Result<String>;
}

/// Read decoded secret data from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Return the secret's keys and UTF-8 values, or None if it does not exist
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;
}

/// Kubernetes-backed [`SecretReader`]
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|s| decode_secret(&s)))
    }
}

fn decode_secret(secret: &Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        out.extend(string_data.clone());
    }
    out
}

/// Where each token flow is served
#[derive(Clone, Debug)]
pub struct CredentialEndpoints {
    /// Token endpoint of the service realm (client-credentials grant)
    pub hardware_token_url: String,
    /// Token endpoint of the master realm (password grant)
    pub identity_token_url: String,
    /// Kubernetes auth login endpoint of the secret engine
    pub secret_engine_login_url: String,
    /// Role used for the secret engine login
    pub secret_engine_role: String,
    /// Service account JWT presented to the secret engine
    pub service_account_token_path: PathBuf,
}

/// [`TokenProvider`] that performs each flow over HTTP
pub struct HttpTokenProvider {
    http: reqwest::Client,
    secrets: Arc<dyn SecretReader>,
    endpoints: CredentialEndpoints,
}

impl HttpTokenProvider {
    /// Create a provider
    pub fn new(
        http: reqwest::Client,
        secrets: Arc<dyn SecretReader>,
        endpoints: CredentialEndpoints,
    ) -> Self {
        Self {
            http,
            secrets,
            endpoints,
        }
    }

    async fn load_secret(
        &self,
        system: BackingSystem,
        (namespace, name): (&str, &str),
    ) -> Result<BTreeMap<String, String>> {
        self.secrets
            .read_secret(namespace, name)
            .await
            .map_err(|e| Error::authentication(system.as_str(), e.to_string()))?
            .ok_or_else(|| {
                Error::authentication(
                    system.as_str(),
                    format!("secret {namespace}/{name} not found"),
                )
            })
    }

    async fn grant(
        &self,
        system: BackingSystem,
        url: &str,
        form: &[(&str, String)],
    ) -> Result<String> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::authentication(system.as_str(), e.to_string()))?;
        let body = read_token_response(system, response).await?;
        extract_token(system, &body, "/access_token")
    }

    async fn hardware_token(&self) -> Result<String> {
        let system = BackingSystem::HardwareState;
        let secret = self.load_secret(system, SERVICE_CLIENT_SECRET).await?;
        let form = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", required(&secret, "client-id", system)?),
            ("client_secret", required(&secret, "client-secret", system)?),
        ];
        self.grant(system, &self.endpoints.hardware_token_url, &form)
            .await
    }

    async fn identity_token(&self) -> Result<String> {
        let system = BackingSystem::Identity;
        let secret = self.load_secret(system, IDENTITY_ADMIN_SECRET).await?;
        let form = [
            ("grant_type", "password".to_string()),
            ("client_id", required(&secret, "client-id", system)?),
            ("username", required(&secret, "user", system)?),
            ("password", required(&secret, "password", system)?),
        ];
        self.grant(system, &self.endpoints.identity_token_url, &form)
            .await
    }

    async fn secret_engine_token(&self) -> Result<String> {
        let system = BackingSystem::SecretEngine;
        let jwt = tokio::fs::read_to_string(&self.endpoints.service_account_token_path)
            .await
            .map_err(|e| {
                Error::authentication(
                    system.as_str(),
                    format!(
                        "reading {}: {e}",
                        self.endpoints.service_account_token_path.display()
                    ),
                )
            })?;
        let login = serde_json::json!({
            "role": self.endpoints.secret_engine_role,
            "jwt": jwt.trim(),
        });
        let response = self
            .http
            .post(&self.endpoints.secret_engine_login_url)
            .json(&login)
            .send()
            .await
            .map_err(|e| Error::authentication(system.as_str(), e.to_string()))?;
        let body = read_token_response(system, response).await?;
        extract_token(system, &body, "/auth/client_token")
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn token(&self, system: BackingSystem) -> Result<String> {
        debug!(system = %system, "requesting token");
        match system {
            BackingSystem::HardwareState => self.hardware_token().await,
            BackingSystem::Identity => self.identity_token().await,
            BackingSystem::SecretEngine => self.secret_engine_token().await,
        }
    }
}

fn required(secret: &BTreeMap<String, String>, key: &str, system: BackingSystem) -> Result<String> {
    secret
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::authentication(system.as_str(), format!("secret is missing {key}")))
}

async fn read_token_response(system: BackingSystem, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::authentication(
            system.as_str(),
            format!("token endpoint returned {status}"),
        ));
    }
    response
        .json()
        .await
        .map_err(|e| Error::authentication(system.as_str(), format!("decoding token: {e}")))
}

/// Pull a non-empty token out of a decoded token response
pub fn extract_token(system: BackingSystem, body: &Value, pointer: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::authentication(system.as_str(), format!("response has no {pointer}"))
        })
}
