//! Finalizer-ordered tenant teardown
//!
//! Children go before the root namespace, namespaces before hardware, and the
//! finalizer is released only once every backing system is clean. A step the
//! backing system refuses for now requeues without releasing the finalizer.

use std::collections::BTreeSet;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::info;

use super::Context;
use crate::crd::{EventType, Tenant, TenantState};
use crate::syncer::hardware::collection_names;
use crate::syncer::{CollectionKind, DeleteOutcome};
use crate::{Error, TENANT_FINALIZER};

/// Delay before retrying a deletion the backing system refused for now
pub(crate) const BLOCKED_REQUEUE: Duration = Duration::from_secs(10);

pub(super) async fn teardown(tenant: &Tenant, ctx: &Context) -> Result<Action, Error> {
    let name = tenant.tenant_name();

    let recorded = if tenant.state() == TenantState::Deleting {
        tenant.status.clone().unwrap_or_default()
    } else {
        let status = ctx
            .update_status(tenant, |s| s.state = Some(TenantState::Deleting))
            .await?;
        info!(state = %TenantState::Deleting, "tearing down tenant");
        status
    };

    let children: BTreeSet<String> = tenant
        .desired_child_namespaces()
        .into_iter()
        .chain(recorded.child_namespaces.iter().cloned())
        .collect();
    for child in &children {
        if ctx.namespaces.delete_child(name, child).await? == DeleteOutcome::Blocked {
            return Ok(Action::requeue(BLOCKED_REQUEUE));
        }
    }

    if ctx.namespaces.delete_root(name).await? == DeleteOutcome::Blocked {
        info!("root namespace still has children, waiting");
        return Ok(Action::requeue(BLOCKED_REQUEUE));
    }

    for kind in [CollectionKind::Partition, CollectionKind::Group] {
        let names = collection_names(
            kind,
            &[&tenant.spec.tenant_resources, &recorded.tenant_resources],
        );
        for collection in &names {
            ctx.hardware.delete(kind, collection).await?;
        }
    }

    ctx.identity.delete(name).await?;
    ctx.encryption.delete_domain(&recorded.tenant_kms).await?;

    ctx.hooks.dispatch(&tenant.spec, EventType::Delete).await?;

    ctx.release_finalizer(tenant, TENANT_FINALIZER).await?;
    info!("teardown complete, finalizer released");
    Ok(Action::await_change())
}
