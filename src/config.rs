//! Operator configuration
//!
//! Every setting is a command-line flag; most can also come from the
//! environment so the operator's Deployment can configure it without args.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::credentials::CredentialEndpoints;
use crate::telemetry::LogFormat;
use crate::DEFAULT_TENANT_NAMESPACE;

/// Tenant and partition management operator
#[derive(Parser, Debug, Clone)]
#[command(name = "tapms-operator", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Namespace holding Tenant resources and parenting every tenant namespace
    #[arg(long, env = "TAPMS_NAMESPACE", default_value = DEFAULT_TENANT_NAMESPACE)]
    pub namespace: String,

    /// Host of the hardware-state service gateway
    #[arg(long, env = "API_GATEWAY", default_value = "api-gw-service-nmn.local")]
    pub api_gateway: String,

    /// Identity provider base URL
    #[arg(
        long,
        env = "KEYCLOAK_BASE",
        default_value = "http://keycloak.services:8080/keycloak"
    )]
    pub keycloak_base: String,

    /// Realm holding tenant admin groups
    #[arg(long, env = "KEYCLOAK_REALM", default_value = "shasta")]
    pub keycloak_realm: String,

    /// Secret engine base URL
    #[arg(long, env = "VAULT_ADDR", default_value = "http://cray-vault.vault:8200")]
    pub vault_addr: String,

    /// Kubernetes auth role used to log in to the secret engine
    #[arg(long, env = "VAULT_ROLE", default_value = "tapms-operator")]
    pub vault_role: String,

    /// Service account token presented to the secret engine
    #[arg(
        long,
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub service_account_token: PathBuf,

    /// Port of the read-only status API
    #[arg(long, env = "SERVER_PORT", default_value_t = 80)]
    pub status_port: u16,

    /// Port of the admission webhook
    #[arg(long, default_value_t = 8443)]
    pub webhook_port: u16,

    /// PEM certificate for the admission webhook
    #[arg(long, requires = "webhook_key")]
    pub webhook_cert: Option<PathBuf>,

    /// PEM private key for the admission webhook
    #[arg(long, requires = "webhook_cert")]
    pub webhook_key: Option<PathBuf>,

    /// Transport timeout for backing-system HTTP calls, in seconds
    #[arg(long, default_value_t = 30)]
    pub http_timeout_secs: u64,

    /// Log encoding: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Transport timeout for backing-system HTTP calls
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Root of the hardware-state REST API
    pub fn hardware_base_url(&self) -> String {
        format!("https://{}/apis/smd/hsm/v2", self.api_gateway)
    }

    /// Root of the identity provider's realm admin API
    pub fn identity_base_url(&self) -> String {
        format!(
            "{}/admin/realms/{}",
            self.keycloak_base.trim_end_matches('/'),
            self.keycloak_realm
        )
    }

    /// Root of the secret engine's `/v1` API
    pub fn secret_engine_base_url(&self) -> String {
        format!("{}/v1", self.vault_addr.trim_end_matches('/'))
    }

    /// Token endpoints for every backing system
    pub fn credential_endpoints(&self) -> CredentialEndpoints {
        CredentialEndpoints {
            hardware_token_url: format!(
                "https://{}/keycloak/realms/shasta/protocol/openid-connect/token",
                self.api_gateway
            ),
            identity_token_url: format!(
                "{}/realms/master/protocol/openid-connect/token",
                self.keycloak_base.trim_end_matches('/')
            ),
            secret_engine_login_url: format!(
                "{}/auth/kubernetes/login",
                self.secret_engine_base_url()
            ),
            secret_engine_role: self.vault_role.clone(),
            service_account_token_path: self.service_account_token.clone(),
        }
    }

    /// Webhook TLS material, when both halves are configured
    pub fn webhook_tls(&self) -> Option<(PathBuf, PathBuf)> {
        self.webhook_cert.clone().zip(self.webhook_key.clone())
    }
}
