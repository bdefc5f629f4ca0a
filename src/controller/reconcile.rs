//! Tenant reconciliation pass
//!
//! Create and update share one pass: persist `Deploying`, converge every
//! backing system in a fixed order, then persist the applied state as
//! `Deployed`. A failure anywhere leaves the observed state untouched so the
//! next pass recomputes the same diff; every step is idempotent, so rerunning
//! the whole pass is safe.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::teardown::teardown;
use super::Context;
use crate::crd::{EventType, Tenant, TenantState};
use crate::syncer::{CollectionKind, EnsureOutcome};
use crate::{Error, TENANT_FINALIZER};

/// Delay before retrying when the namespace hierarchy has not caught up
pub(crate) const NAMESPACE_REQUEUE: Duration = Duration::from_secs(5);

/// Reconcile a Tenant
#[instrument(skip(tenant, ctx), fields(tenant = %tenant.name_any()))]
pub async fn reconcile(tenant: Arc<Tenant>, ctx: Arc<Context>) -> Result<Action, Error> {
    if tenant.deletion_requested() {
        if !tenant.has_finalizer(TENANT_FINALIZER) {
            debug!("deletion requested and teardown already complete");
            return Ok(Action::await_change());
        }
        return teardown(&tenant, &ctx).await;
    }

    if !tenant.has_finalizer(TENANT_FINALIZER) {
        info!("adding finalizer");
        ctx.store.add_finalizer(&tenant, TENANT_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if tenant.spec.requires_key_update && !tenant.spec.tenant_kms.enabled {
        info!("key update requested without an encryption domain, clearing");
        ctx.store.clear_key_update_flag(&tenant).await?;
    }

    if is_settled(&tenant) {
        debug!("tenant is deployed and converged");
        return Ok(Action::await_change());
    }

    deploy(&tenant, &ctx).await
}

/// Nothing left to apply
///
/// A key-update request only counts while an encryption domain is enabled.
fn is_settled(tenant: &Tenant) -> bool {
    let kms = &tenant.spec.tenant_kms;
    let kms_pending = kms.enabled
        && (tenant.spec.requires_key_update
            || tenant
                .status
                .as_ref()
                .is_none_or(|s| s.tenant_kms.public_key.is_none()));

    tenant.state() == TenantState::Deployed && tenant.is_converged() && !kms_pending
}

async fn deploy(tenant: &Tenant, ctx: &Context) -> Result<Action, Error> {
    let name = tenant.tenant_name();

    if tenant.status.as_ref().and_then(|s| s.state).is_none() {
        ctx.update_status(tenant, |s| s.state = Some(TenantState::New))
            .await?;
        info!(state = %TenantState::New, "tenant observed");
    }

    // Visible as in-progress before any remote work
    let generated = Uuid::new_v4().to_string();
    let recorded = ctx
        .update_status(tenant, |s| {
            s.state = Some(TenantState::Deploying);
            s.uuid.get_or_insert_with(|| generated.clone());
        })
        .await?;
    let uuid = recorded.uuid.clone().unwrap_or(generated);
    info!(state = %TenantState::Deploying, %uuid, "applying tenant");

    let desired_children = tenant.desired_child_namespaces();

    if ctx.namespaces.ensure_root(name).await? == EnsureOutcome::Requeue {
        return Ok(Action::requeue(NAMESPACE_REQUEUE));
    }
    for child in &desired_children {
        if ctx.namespaces.ensure_child(name, child).await? == EnsureOutcome::Requeue {
            return Ok(Action::requeue(NAMESPACE_REQUEUE));
        }
        if ctx.namespaces.propagate_secrets(name, child).await? == EnsureOutcome::Requeue {
            return Ok(Action::requeue(NAMESPACE_REQUEUE));
        }
    }

    let observed_resources = tenant.observed_resources();
    ctx.hardware
        .converge(
            name,
            CollectionKind::Partition,
            &tenant.spec.tenant_resources,
            observed_resources,
        )
        .await?;
    ctx.hardware
        .converge(
            name,
            CollectionKind::Group,
            &tenant.spec.tenant_resources,
            observed_resources,
        )
        .await?;

    ctx.identity.ensure_exists(name).await?;

    let rotate = tenant.spec.requires_key_update;
    let kms = if tenant.spec.tenant_kms.enabled {
        let kms = ctx
            .encryption
            .ensure_domain(
                name,
                &uuid,
                &tenant.spec.tenant_kms,
                &recorded.tenant_kms,
                rotate,
            )
            .await?;
        if rotate {
            ctx.store.clear_key_update_flag(tenant).await?;
            info!("key update applied, flag cleared");
        }
        kms
    } else {
        recorded.tenant_kms.clone()
    };

    let desired: BTreeSet<&str> = desired_children.iter().map(String::as_str).collect();
    for stale in tenant
        .observed_child_namespaces()
        .iter()
        .filter(|c| !desired.contains(c.as_str()))
    {
        ctx.namespaces.delete_child(name, stale).await?;
    }

    let event = if recorded.last_deployed.is_none() {
        EventType::Create
    } else {
        EventType::Update
    };
    ctx.hooks.dispatch(&tenant.spec, event).await?;

    let deployed_at = Utc::now().to_rfc3339();
    ctx.update_status(tenant, |s| {
        s.state = Some(TenantState::Deployed);
        s.child_namespaces = desired_children.clone();
        s.tenant_resources = tenant.spec.tenant_resources.clone();
        s.tenant_hooks = tenant.spec.tenant_hooks.clone();
        s.tenant_kms = kms.clone();
        s.last_deployed = Some(deployed_at.clone());
    })
    .await?;
    info!(state = %TenantState::Deployed, %event, "tenant deployed");

    Ok(Action::await_change())
}
