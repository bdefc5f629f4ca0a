//! Admission-time validation of tenant changes
//!
//! Checks read the hardware-state service and never mutate it. Every problem
//! found is collected so the caller sees the full list in one rejection, and
//! any failure to reach the service rejects the request.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::crd::{Tenant, TenantResource};
use crate::syncer::{CollectionKind, HardwareStateClient};
use crate::{Error, Result};

/// Hardware component type every tenant member must have
const NODE_COMPONENT_TYPE: &str = "Node";

/// Inventory role required for members of a resource class, if any
fn required_role(class: &str) -> Option<&'static str> {
    if class.eq_ignore_ascii_case("compute") {
        Some("Compute")
    } else if class.eq_ignore_ascii_case("application") {
        Some("Application")
    } else {
        None
    }
}

/// Validates declared tenants against live hardware state
pub struct AdmissionValidator {
    hardware: Arc<dyn HardwareStateClient>,
}

impl AdmissionValidator {
    /// Create a validator
    pub fn new(hardware: Arc<dyn HardwareStateClient>) -> Self {
        Self { hardware }
    }

    /// Validate a tenant being created
    pub async fn validate_create(&self, tenant: &Tenant) -> Result<()> {
        let name = tenant.tenant_name();
        if name.trim().is_empty() {
            return Err(Error::validation("tenantname must not be empty"));
        }

        let mut problems = Vec::new();
        self.check_eligibility(name, &tenant.spec.tenant_resources, &mut problems)
            .await?;
        self.check_exclusivity(name, &tenant.spec.tenant_resources, &mut problems)
            .await?;

        reject_if_any(name, problems)
    }

    /// Validate an update of `old` into `new`
    ///
    /// The tenant name is immutable, as is the exclusivity flag of any resource
    /// class already applied. The new declaration must also pass every
    /// create-time check.
    pub async fn validate_update(&self, old: &Tenant, new: &Tenant) -> Result<()> {
        let name = new.tenant_name();
        let mut problems = Vec::new();

        if old.tenant_name() != name {
            problems.push(format!(
                "tenantname is immutable (was {}, now {name})",
                old.tenant_name()
            ));
        }

        for resource in &new.spec.tenant_resources {
            let previous = old
                .observed_resources()
                .iter()
                .find(|r| r.class == resource.class);
            if let Some(previous) = previous {
                if previous.exclusive != resource.exclusive {
                    problems.push(format!(
                        "enforceexclusivehsmgroups is immutable for {} resources",
                        resource.class
                    ));
                }
            }
        }

        self.check_eligibility(name, &new.spec.tenant_resources, &mut problems)
            .await?;
        self.check_exclusivity(name, &new.spec.tenant_resources, &mut problems)
            .await?;

        reject_if_any(name, problems)
    }

    /// Every member of a compute or application resource must be a node with that role
    async fn check_eligibility(
        &self,
        tenant: &str,
        resources: &[TenantResource],
        problems: &mut Vec<String>,
    ) -> Result<()> {
        for resource in resources {
            let Some(role) = required_role(&resource.class) else {
                debug!(%tenant, class = %resource.class, "no inventory role check for class");
                continue;
            };

            let inventory: BTreeSet<String> = self
                .hardware
                .list_components(NODE_COMPONENT_TYPE, role)
                .await
                .map_err(|e| unreachable_inventory(tenant, e))?
                .into_iter()
                .collect();

            let missing: Vec<&str> = resource
                .xnames
                .iter()
                .map(String::as_str)
                .filter(|m| !inventory.contains(*m))
                .collect();
            if !missing.is_empty() {
                problems.push(format!(
                    "not {} nodes: {}",
                    resource.class,
                    missing.join(", ")
                ));
            }
        }
        Ok(())
    }

    /// Members of an exclusive resource may not sit in another exclusive group
    async fn check_exclusivity(
        &self,
        tenant: &str,
        resources: &[TenantResource],
        problems: &mut Vec<String>,
    ) -> Result<()> {
        let exclusive: Vec<(&str, &TenantResource)> = resources
            .iter()
            .filter(|r| r.exclusive)
            .filter_map(|r| CollectionKind::Group.target_of(r).map(|g| (g, r)))
            .collect();
        if exclusive.is_empty() {
            return Ok(());
        }

        let groups = self
            .hardware
            .list_groups()
            .await
            .map_err(|e| unreachable_inventory(tenant, e))?;

        for (target, resource) in exclusive {
            let conflicts: Vec<String> = resource
                .xnames
                .iter()
                .flat_map(|member| {
                    groups
                        .iter()
                        .filter(move |g| {
                            g.name != target
                                && g.is_tenant_exclusive()
                                && g.members.iter().any(|m| m == member)
                        })
                        .map(move |g| format!("{member} (in {})", g.name))
                })
                .collect();
            if !conflicts.is_empty() {
                problems.push(format!(
                    "members already in another exclusive group: {}",
                    conflicts.join(", ")
                ));
            }
        }
        Ok(())
    }
}

fn unreachable_inventory(tenant: &str, e: Error) -> Error {
    warn!(%tenant, error = %e, "hardware state unavailable during admission");
    Error::validation_for(tenant, format!("unable to verify hardware state: {e}"))
}

fn reject_if_any(tenant: &str, problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::validation_for(tenant, problems.join("; ")))
    }
}
