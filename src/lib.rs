//! TAPMS - tenant and partition management operator
//!
//! A tenant is a slice of a shared hardware cluster that spans several
//! independently administered backing systems. The operator drives all of
//! them toward the tenant's declared state and tears everything down, in a
//! fixed order, when the tenant is deleted.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Tenant, GlobalTenantHook, SubnamespaceAnchor)
//! - [`controller`] - Reconciliation state machine and finalizer-ordered teardown
//! - [`syncer`] - Backing-system syncers (namespaces, hardware, identity, encryption)
//! - [`diff`] - Set difference between desired and observed membership
//! - [`credentials`] - Bearer token acquisition for each backing system
//! - [`rest`] - Authenticated JSON client shared by the REST syncers
//! - [`admission`] - Admission-time validation of tenant changes
//! - [`hooks`] - Lifecycle hook dispatch
//! - [`webhook`] - Validating admission webhook
//! - [`server`] - Read-only tenant status API
//! - [`config`] - Operator configuration
//! - [`telemetry`] - Structured logging setup
//! - [`retry`] - Backoff and optimistic-concurrency retry helpers
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod diff;
pub mod error;
pub mod hooks;
pub mod rest;
pub mod retry;
pub mod server;
pub mod syncer;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace holding Tenant resources and parenting every tenant namespace
pub const DEFAULT_TENANT_NAMESPACE: &str = "tenants";

/// Finalizer guarding tenant deletion until teardown completes
pub const TENANT_FINALIZER: &str = "tapms.hpe.com/finalizer";

/// Field manager used for server-side apply and patches
pub const FIELD_MANAGER: &str = "tapms-operator";

/// Marker stored on hardware groups created with exclusivity enforced
pub const EXCLUSIVE_GROUP_MARKER: &str = "tapms-exclusive-group-label";

/// Prefix of every tenant encryption domain name
pub const ENCRYPTION_DOMAIN_PREFIX: &str = "cray-tenant-";
