//! Custom Resource Definitions for TAPMS
//!
//! This module contains the CRDs the operator owns (Tenant, GlobalTenantHook)
//! and the namespace-hierarchy anchor it drives.

mod anchor;
mod hook;
mod tenant;

pub use anchor::{SubnamespaceAnchor, SubnamespaceAnchorSpec, SubnamespaceAnchorStatus};
pub use hook::{EventType, GlobalTenantHook, GlobalTenantHookSpec, HookCredentials, TenantHook};
pub use tenant::{
    qualify_child_namespace, unqualify_child_namespace, Tenant, TenantKms, TenantKmsStatus,
    TenantResource, TenantSpec, TenantState, TenantStatus, NAMESPACE_SEPARATOR,
};
