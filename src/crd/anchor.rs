//! Hierarchical namespace anchor
//!
//! Creating a `SubnamespaceAnchor` named `child` in namespace `parent` asks the
//! namespace-hierarchy controller to create namespace `child` under `parent`.
//! The resource is owned by that controller; only the shape TAPMS touches is
//! modelled here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Anchor marking a child namespace under its parent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hnc.x-k8s.io",
    version = "v1alpha2",
    kind = "SubnamespaceAnchor",
    namespaced,
    status = "SubnamespaceAnchorStatus"
)]
pub struct SubnamespaceAnchorSpec {}

/// Anchor state reported by the namespace-hierarchy controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SubnamespaceAnchorStatus {
    /// "Ok", "Missing", "Conflict" or "Forbidden"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}
