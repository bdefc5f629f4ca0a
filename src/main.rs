//! TAPMS operator - converges tenants across namespace, hardware, identity and key-management systems

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use tapms::admission::AdmissionValidator;
use tapms::config::OperatorConfig;
use tapms::controller::{error_policy, reconcile, Context};
use tapms::credentials::{BackingSystem, HttpTokenProvider, KubeSecretReader, SecretReader};
use tapms::crd::{GlobalTenantHook, Tenant};
use tapms::hooks::{HookDispatcher, HttpHookTransport, KubeGlobalHookSource};
use tapms::rest::{AuthScheme, RestClient};
use tapms::retry::{retry_with_backoff, RetryConfig};
use tapms::server::{start_status_server, TenantCatalog};
use tapms::syncer::{HttpHardwareStateClient, HttpIdentityClient, HttpSecretEngineClient};
use tapms::telemetry::{init_telemetry, TelemetryConfig};
use tapms::webhook::{webhook_router, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let config = OperatorConfig::parse();

    if config.crd {
        for crd in [Tenant::crd(), GlobalTenantHook::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: config.log_format,
        ..Default::default()
    })?;

    run_controller(config).await
}

/// Ensure the Tenant and GlobalTenantHook CRDs are installed
///
/// Server-side apply keeps the installed versions in step with the binary.
/// Retried because the API server may still be coming up.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(tapms::FIELD_MANAGER).force();

    for crd in [Tenant::crd(), GlobalTenantHook::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        retry_with_backoff(&RetryConfig::with_max_attempts(10), "install_crd", || {
            let (crds, params, crd, name) = (&crds, &params, &crd, name.as_str());
            async move {
                tracing::info!(crd = %name, "installing CRD");
                crds.patch(name, params, &Patch::Apply(crd)).await
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

/// Serve the admission webhook, over TLS when certificate and key are configured
async fn serve_webhook(config: &OperatorConfig, state: Arc<WebhookState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.webhook_port));
    let app = webhook_router(state);

    match config.webhook_tls() {
        Some((cert, key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load webhook TLS material: {}", e))?;
            tracing::info!(%addr, "admission webhook started (TLS)");
            axum_server::bind_rustls(addr, tls)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            tracing::warn!(%addr, "admission webhook started without TLS");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!(namespace = %config.namespace, "TAPMS operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;
    let secrets: Arc<dyn SecretReader> = Arc::new(KubeSecretReader::new(client.clone()));
    let tokens = Arc::new(HttpTokenProvider::new(
        http.clone(),
        secrets.clone(),
        config.credential_endpoints(),
    ));

    let hardware = Arc::new(HttpHardwareStateClient::new(RestClient::new(
        http.clone(),
        tokens.clone(),
        BackingSystem::HardwareState,
        config.hardware_base_url(),
        AuthScheme::Bearer,
    )));
    let identity = Arc::new(HttpIdentityClient::new(RestClient::new(
        http.clone(),
        tokens.clone(),
        BackingSystem::Identity,
        config.identity_base_url(),
        AuthScheme::Bearer,
    )));
    let secret_engine = Arc::new(HttpSecretEngineClient::new(RestClient::new(
        http.clone(),
        tokens,
        BackingSystem::SecretEngine,
        config.secret_engine_base_url(),
        AuthScheme::VaultToken,
    )));
    let hook_transport = Arc::new(HttpHookTransport::new(http));
    let global_hooks = Arc::new(KubeGlobalHookSource::new(client.clone()));

    let ctx = Arc::new(
        Context::builder()
            .kube_client(client.clone())
            .namespace(config.namespace.clone())
            .hardware_client(hardware.clone())
            .identity_client(identity)
            .secret_engine_client(secret_engine)
            .hook_transport(hook_transport.clone())
            .global_hooks(global_hooks.clone())
            .secret_reader(secrets.clone())
            .build()?,
    );

    let webhook_state = Arc::new(WebhookState::new(
        AdmissionValidator::new(hardware),
        HookDispatcher::new(hook_transport, global_hooks, secrets),
    ));

    let tenants: Api<Tenant> = Api::namespaced(client, &config.namespace);
    let controller = Controller::new(tenants, WatcherConfig::default());
    let catalog: Arc<dyn TenantCatalog> = Arc::new(controller.store());

    tracing::info!("Starting Tenant controller, webhook and status API");

    let tenant_controller = controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Tenant reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Tenant reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = tenant_controller => {
            tracing::info!("Tenant controller stopped");
        }
        result = serve_webhook(&config, webhook_state) => {
            result?;
            tracing::warn!("Admission webhook stopped");
        }
        result = start_status_server(catalog, config.status_port) => {
            result?;
            tracing::warn!("Status API stopped");
        }
    }

    tracing::info!("TAPMS operator shutting down");
    Ok(())
}
