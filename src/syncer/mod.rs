//! Backing-system syncers
//!
//! Each syncer drives one remote resource type toward a declared shape with
//! the same contract:
//!
//! - ensure-exists: create when absent, leave existing resources untouched
//! - sync-members: apply removals, then additions, one member at a time
//! - delete: idempotent, absence is success
//!
//! The namespace syncer can additionally answer [`EnsureOutcome::Requeue`]
//! when the hierarchy controller has not caught up yet.

pub mod encryption;
pub mod hardware;
pub mod identity;
pub mod namespace;

use async_trait::async_trait;
use tracing::info;

use crate::diff::MemberDiff;
use crate::Result;

pub use encryption::{EncryptionSyncer, HttpSecretEngineClient, SecretEngineClient};
pub use hardware::{
    Collection, CollectionKind, HardwareStateClient, HardwareSyncer, HttpHardwareStateClient,
};
pub use identity::{HttpIdentityClient, IdentityClient, IdentityGroup, IdentitySyncer};
pub use namespace::{KubeNamespaceClient, NamespaceClient, NamespaceSyncer};

/// Result of an ensure-exists call that may need to wait on another controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The resource exists
    Ready,
    /// A precondition is not visible yet; try again shortly
    Requeue,
}

/// Result of an idempotent delete
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The resource was deleted by this call
    Deleted,
    /// Nothing to delete
    AlreadyAbsent,
    /// The backing system refused for now (e.g. children still exist)
    Blocked,
}

/// A remote resource whose membership can be changed one member at a time
#[async_trait]
pub trait MemberTarget: Send + Sync {
    /// Human-readable name for logs and errors, e.g. `partition blue`
    fn describe(&self) -> String;

    /// Add a single member
    async fn add(&self, member: &str) -> Result<()>;

    /// Remove a single member
    async fn remove(&self, member: &str) -> Result<()>;
}

/// Apply a membership diff: every removal first, then every addition
///
/// A 404 on removal and a 409 on addition mean the remote end already agrees;
/// they are logged and skipped. Any other failure aborts the call with an
/// error naming the member and the action.
pub async fn sync_members(target: &dyn MemberTarget, diff: &MemberDiff) -> Result<()> {
    for member in &diff.to_remove {
        match target.remove(member).await {
            Ok(()) => info!(target = %target.describe(), member = %member, "removed member"),
            Err(e) if e.is_not_found() => {
                info!(target = %target.describe(), member = %member, "member already absent")
            }
            Err(e) => {
                return Err(e.context(format!(
                    "removing member {member} from {}",
                    target.describe()
                )))
            }
        }
    }

    for member in &diff.to_add {
        match target.add(member).await {
            Ok(()) => info!(target = %target.describe(), member = %member, "added member"),
            Err(e) if e.is_conflict() => {
                info!(target = %target.describe(), member = %member, "member already present")
            }
            Err(e) => {
                return Err(e.context(format!(
                    "adding member {member} to {}",
                    target.describe()
                )))
            }
        }
    }

    Ok(())
}
