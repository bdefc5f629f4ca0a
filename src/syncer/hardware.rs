//! Hardware partition and group syncer
//!
//! Partitions and groups are distinct remote collections with the same member
//! semantics. A tenant resource names a target partition and/or group; several
//! resources may target the same collection, so desired and observed members
//! are aggregated per collection name before diffing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::{sync_members, DeleteOutcome, MemberTarget};
use crate::crd::TenantResource;
use crate::diff::MemberDiff;
use crate::rest::RestClient;
use crate::{Result, EXCLUSIVE_GROUP_MARKER};

/// Which collection type a call addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    /// Hardware partition
    Partition,
    /// Hardware group
    Group,
}

impl CollectionKind {
    fn path(&self) -> &'static str {
        match self {
            CollectionKind::Partition => "partitions",
            CollectionKind::Group => "groups",
        }
    }

    /// Target collection name a resource declares for this kind
    pub fn target_of<'a>(&self, resource: &'a TenantResource) -> Option<&'a str> {
        let target = match self {
            CollectionKind::Partition => resource.partition.as_deref(),
            CollectionKind::Group => resource.group.as_deref(),
        };
        target.map(str::trim).filter(|t| !t.is_empty())
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Partition => write!(f, "partition"),
            CollectionKind::Group => write!(f, "group"),
        }
    }
}

/// A partition or group as the operator sees it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Collection {
    /// Partition name or group label
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Tags; tenant collections are tagged with the tenant name
    pub tags: Vec<String>,
    /// Member node identifiers
    pub members: Vec<String>,
    /// Exclusivity marker (groups only)
    pub exclusive_group: Option<String>,
}

impl Collection {
    /// Whether this group was created with tenant exclusivity enforced
    pub fn is_tenant_exclusive(&self) -> bool {
        self.exclusive_group.as_deref() == Some(EXCLUSIVE_GROUP_MARKER)
    }
}

/// Hardware-state service operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HardwareStateClient: Send + Sync {
    /// Read a collection by name
    async fn get_collection(&self, kind: CollectionKind, name: &str) -> Result<Option<Collection>>;

    /// Create a collection
    async fn create_collection(&self, kind: CollectionKind, collection: &Collection) -> Result<()>;

    /// Delete a collection
    async fn delete_collection(&self, kind: CollectionKind, name: &str) -> Result<()>;

    /// Add one member
    async fn add_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()>;

    /// Remove one member
    async fn remove_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()>;

    /// List every group, freshly read
    async fn list_groups(&self) -> Result<Vec<Collection>>;

    /// Identifiers of components with the given type and role
    async fn list_components(&self, component_type: &str, role: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireMembers {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WireCollection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    members: WireMembers,
    #[serde(
        rename = "exclusiveGroup",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    exclusive_group: Option<String>,
}

impl WireCollection {
    fn from_collection(kind: CollectionKind, c: &Collection) -> Self {
        let (name, label, exclusive_group) = match kind {
            CollectionKind::Partition => (Some(c.name.clone()), None, None),
            CollectionKind::Group => (None, Some(c.name.clone()), c.exclusive_group.clone()),
        };
        Self {
            name,
            label,
            description: c.description.clone(),
            tags: c.tags.clone(),
            members: WireMembers {
                ids: c.members.clone(),
            },
            exclusive_group,
        }
    }

    fn into_collection(self) -> Collection {
        Collection {
            name: self.name.or(self.label).unwrap_or_default(),
            description: self.description,
            tags: self.tags,
            members: self.members.ids,
            exclusive_group: self.exclusive_group.filter(|g| !g.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ComponentList {
    #[serde(rename = "Components", default)]
    components: Vec<Component>,
}

#[derive(Debug, Deserialize)]
struct Component {
    #[serde(rename = "ID")]
    id: String,
}

/// [`HardwareStateClient`] speaking the hardware-state service's REST API
pub struct HttpHardwareStateClient {
    rest: RestClient,
}

impl HttpHardwareStateClient {
    /// Create a client; `rest` must be rooted at the service's v2 API
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl HardwareStateClient for HttpHardwareStateClient {
    async fn get_collection(&self, kind: CollectionKind, name: &str) -> Result<Option<Collection>> {
        let found: Option<WireCollection> = self
            .rest
            .get_json(&format!("{}/{name}", kind.path()))
            .await?;
        Ok(found.map(WireCollection::into_collection))
    }

    async fn create_collection(&self, kind: CollectionKind, collection: &Collection) -> Result<()> {
        let body = serde_json::to_value(WireCollection::from_collection(kind, collection))?;
        self.rest
            .expect_success(Method::POST, kind.path(), Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, kind: CollectionKind, name: &str) -> Result<()> {
        self.rest
            .expect_success(Method::DELETE, &format!("{}/{name}", kind.path()), None)
            .await?;
        Ok(())
    }

    async fn add_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()> {
        let body = serde_json::json!({ "id": member });
        self.rest
            .expect_success(
                Method::POST,
                &format!("{}/{name}/members", kind.path()),
                Some(&body),
            )
            .await?;
        Ok(())
    }

    async fn remove_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()> {
        self.rest
            .expect_success(
                Method::DELETE,
                &format!("{}/{name}/members/{member}", kind.path()),
                None,
            )
            .await?;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Collection>> {
        let groups: Option<Vec<WireCollection>> = self.rest.get_json("groups").await?;
        Ok(groups
            .unwrap_or_default()
            .into_iter()
            .map(WireCollection::into_collection)
            .collect())
    }

    async fn list_components(&self, component_type: &str, role: &str) -> Result<Vec<String>> {
        let list: Option<ComponentList> = self
            .rest
            .get_json(&format!(
                "State/Components?type={component_type}&role={role}"
            ))
            .await?;
        Ok(list
            .unwrap_or_default()
            .components
            .into_iter()
            .map(|c| c.id)
            .collect())
    }
}

/// Membership of one named collection
struct CollectionMembers<'a> {
    client: &'a dyn HardwareStateClient,
    kind: CollectionKind,
    name: &'a str,
}

#[async_trait]
impl MemberTarget for CollectionMembers<'_> {
    fn describe(&self) -> String {
        format!("{} {}", self.kind, self.name)
    }

    async fn add(&self, member: &str) -> Result<()> {
        self.client.add_member(self.kind, self.name, member).await
    }

    async fn remove(&self, member: &str) -> Result<()> {
        self.client.remove_member(self.kind, self.name, member).await
    }
}

/// Desired and observed membership of one collection
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionPlan {
    /// Collection name
    pub name: String,
    /// Union of members declared for this collection
    pub desired: BTreeSet<String>,
    /// Union of members last applied to this collection
    pub observed: BTreeSet<String>,
    /// Any resource targeting this collection enforces exclusivity
    pub exclusive: bool,
}

/// Group resources by target collection
///
/// Returns the collections still declared, and the names of collections that
/// were applied before but are no longer declared by any resource.
pub fn plan_collections(
    kind: CollectionKind,
    desired: &[TenantResource],
    observed: &[TenantResource],
) -> (Vec<CollectionPlan>, Vec<String>) {
    let mut plans: BTreeMap<String, CollectionPlan> = BTreeMap::new();
    for resource in desired {
        if let Some(name) = kind.target_of(resource) {
            let plan = plans.entry(name.to_string()).or_insert_with(|| CollectionPlan {
                name: name.to_string(),
                ..Default::default()
            });
            plan.desired.extend(resource.xnames.iter().cloned());
            plan.exclusive |= resource.exclusive;
        }
    }

    let mut retired = BTreeSet::new();
    for resource in observed {
        if let Some(name) = kind.target_of(resource) {
            match plans.get_mut(name) {
                Some(plan) => plan.observed.extend(resource.xnames.iter().cloned()),
                None => {
                    retired.insert(name.to_string());
                }
            }
        }
    }

    (plans.into_values().collect(), retired.into_iter().collect())
}

/// Every collection name of `kind` mentioned by any of the resource lists
pub fn collection_names(kind: CollectionKind, lists: &[&[TenantResource]]) -> Vec<String> {
    lists
        .iter()
        .flat_map(|list| list.iter())
        .filter_map(|r| kind.target_of(r))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Drives hardware partitions and groups
pub struct HardwareSyncer {
    client: Arc<dyn HardwareStateClient>,
}

impl HardwareSyncer {
    /// Create a syncer on top of a hardware-state client
    pub fn new(client: Arc<dyn HardwareStateClient>) -> Self {
        Self { client }
    }

    /// Create the collection when absent; never rewrites an existing one
    pub async fn ensure_exists(&self, kind: CollectionKind, collection: &Collection) -> Result<()> {
        if self.client.get_collection(kind, &collection.name).await?.is_some() {
            debug!(%kind, name = %collection.name, "collection exists");
            return Ok(());
        }

        match self.client.create_collection(kind, collection).await {
            Ok(()) => {
                info!(%kind, name = %collection.name, "created collection");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!(%kind, name = %collection.name, "collection created concurrently");
                Ok(())
            }
            Err(e) => Err(e.context(format!("creating {kind} {}", collection.name))),
        }
    }

    /// Apply a membership diff to one collection
    pub async fn sync_members(
        &self,
        kind: CollectionKind,
        name: &str,
        diff: &MemberDiff,
    ) -> Result<()> {
        let target = CollectionMembers {
            client: self.client.as_ref(),
            kind,
            name,
        };
        sync_members(&target, diff).await
    }

    /// Delete a collection; absence is success
    pub async fn delete(&self, kind: CollectionKind, name: &str) -> Result<DeleteOutcome> {
        match self.client.delete_collection(kind, name).await {
            Ok(()) => {
                info!(%kind, %name, "deleted collection");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!(%kind, %name, "collection already absent");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e.context(format!("deleting {kind} {name}"))),
        }
    }

    /// Move every collection of `kind` from observed to desired membership
    ///
    /// Collections no longer declared are deleted first so members they held
    /// are free before any addition.
    pub async fn converge(
        &self,
        tenant: &str,
        kind: CollectionKind,
        desired: &[TenantResource],
        observed: &[TenantResource],
    ) -> Result<()> {
        let (plans, retired) = plan_collections(kind, desired, observed);

        for name in &retired {
            self.delete(kind, name).await?;
        }

        for plan in &plans {
            let collection = Collection {
                name: plan.name.clone(),
                description: format!("{kind} for tenant {tenant}"),
                tags: vec![tenant.to_string()],
                members: Vec::new(),
                exclusive_group: (kind == CollectionKind::Group && plan.exclusive)
                    .then(|| EXCLUSIVE_GROUP_MARKER.to_string()),
            };
            self.ensure_exists(kind, &collection).await?;

            let diff = MemberDiff::between(&plan.desired, &plan.observed);
            if diff.is_empty() {
                debug!(%kind, name = %plan.name, "membership up to date");
                continue;
            }
            self.sync_members(kind, &plan.name, &diff).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::BackingSystem;
    use crate::rest::testutil::{client, serve};
    use crate::rest::AuthScheme;
    use crate::Error;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{delete, post};
    use axum::{Json, Router};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::Mutex;

    fn resource(class: &str, members: &[&str], partition: Option<&str>, group: Option<&str>) -> TenantResource {
        TenantResource {
            class: class.to_string(),
            xnames: members.iter().map(|m| m.to_string()).collect(),
            partition: partition.map(str::to_string),
            group: group.map(str::to_string),
            exclusive: false,
        }
    }

    #[test]
    fn plans_aggregate_resources_sharing_a_collection() {
        let desired = vec![
            resource("compute", &["x1"], Some("blue"), None),
            resource("application", &["x9"], Some("blue"), None),
        ];
        let observed = vec![resource("compute", &["x1", "x2"], Some("blue"), None)];

        let (plans, retired) = plan_collections(CollectionKind::Partition, &desired, &observed);
        assert!(retired.is_empty());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].desired.len(), 2);
        assert_eq!(plans[0].observed.len(), 2);
    }

    #[test]
    fn renamed_collections_are_retired() {
        let desired = vec![resource("compute", &["x1"], None, Some("green"))];
        let observed = vec![resource("compute", &["x1"], None, Some("red"))];

        let (plans, retired) = plan_collections(CollectionKind::Group, &desired, &observed);
        assert_eq!(plans[0].name, "green");
        assert!(plans[0].observed.is_empty());
        assert_eq!(retired, vec!["red".to_string()]);
    }

    #[test]
    fn blank_targets_are_ignored() {
        let desired = vec![resource("compute", &["x1"], Some("  "), None)];
        let (plans, _) = plan_collections(CollectionKind::Partition, &desired, &[]);
        assert!(plans.is_empty());
    }

    #[tokio::test]
    async fn ensure_exists_leaves_existing_collections_alone() {
        let mut client = MockHardwareStateClient::new();
        client
            .expect_get_collection()
            .returning(|_, name| {
                Ok(Some(Collection {
                    name: name.to_string(),
                    ..Default::default()
                }))
            });
        client.expect_create_collection().never();

        let syncer = HardwareSyncer::new(Arc::new(client));
        let collection = Collection {
            name: "blue".to_string(),
            ..Default::default()
        };
        syncer
            .ensure_exists(CollectionKind::Partition, &collection)
            .await
            .unwrap();
        syncer
            .ensure_exists(CollectionKind::Partition, &collection)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ensure_exists_tolerates_concurrent_creation() {
        let mut client = MockHardwareStateClient::new();
        client.expect_get_collection().returning(|_, _| Ok(None));
        client
            .expect_create_collection()
            .returning(|_, _| Err(Error::rejected("hsm", 409, "exists")));

        let syncer = HardwareSyncer::new(Arc::new(client));
        syncer
            .ensure_exists(CollectionKind::Group, &Collection::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ensure_exists_surfaces_rejections() {
        let mut client = MockHardwareStateClient::new();
        client.expect_get_collection().returning(|_, _| Ok(None));
        client
            .expect_create_collection()
            .returning(|_, _| Err(Error::rejected("hsm", 400, "bad label")));

        let syncer = HardwareSyncer::new(Arc::new(client));
        let err = syncer
            .ensure_exists(CollectionKind::Group, &Collection::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn delete_of_missing_collection_is_success() {
        let mut client = MockHardwareStateClient::new();
        client
            .expect_delete_collection()
            .returning(|_, _| Err(Error::rejected("hsm", 404, "no such group")));

        let syncer = HardwareSyncer::new(Arc::new(client));
        assert_eq!(
            syncer.delete(CollectionKind::Group, "blue").await.unwrap(),
            DeleteOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn converge_retires_then_creates_then_adds() {
        let mut seq = Sequence::new();
        let mut client = MockHardwareStateClient::new();

        client
            .expect_delete_collection()
            .with(eq(CollectionKind::Group), eq("red"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        client
            .expect_get_collection()
            .with(eq(CollectionKind::Group), eq("green"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        client
            .expect_create_collection()
            .withf(|kind, c| {
                *kind == CollectionKind::Group
                    && c.name == "green"
                    && c.tags == vec!["blue".to_string()]
                    && c.exclusive_group.as_deref() == Some(EXCLUSIVE_GROUP_MARKER)
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        client
            .expect_add_member()
            .with(eq(CollectionKind::Group), eq("green"), eq("x1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let mut desired = resource("compute", &["x1"], None, Some("green"));
        desired.exclusive = true;
        let observed = resource("compute", &["x1"], None, Some("red"));

        let syncer = HardwareSyncer::new(Arc::new(client));
        syncer
            .converge("blue", CollectionKind::Group, &[desired], &[observed])
            .await
            .unwrap();
    }

    type Calls = Arc<Mutex<Vec<String>>>;

    #[tokio::test]
    async fn http_client_uses_service_wire_format() {
        let calls: Calls = Arc::default();
        let router = Router::new()
            .route(
                "/groups",
                post(|State(calls): State<Calls>, Json(body): Json<serde_json::Value>| async move {
                    calls.lock().unwrap().push(format!("create {body}"));
                    StatusCode::CREATED
                }),
            )
            .route(
                "/groups/{label}/members",
                post(
                    |State(calls): State<Calls>,
                     Path(label): Path<String>,
                     Json(body): Json<serde_json::Value>| async move {
                        calls.lock().unwrap().push(format!("add {label} {}", body["id"]));
                        StatusCode::CONFLICT
                    },
                ),
            )
            .route(
                "/partitions/{name}/members/{id}",
                delete(
                    |State(calls): State<Calls>, Path((name, id)): Path<(String, String)>| async move {
                        calls.lock().unwrap().push(format!("remove {name} {id}"));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(calls.clone());
        let base = serve(router).await;
        let hsm = HttpHardwareStateClient::new(client(
            BackingSystem::HardwareState,
            &base,
            AuthScheme::Bearer,
        ));

        hsm.create_collection(
            CollectionKind::Group,
            &Collection {
                name: "green".to_string(),
                exclusive_group: Some(EXCLUSIVE_GROUP_MARKER.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let err = hsm
            .add_member(CollectionKind::Group, "green", "x1")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        hsm.remove_member(CollectionKind::Partition, "blue", "x2")
            .await
            .unwrap();

        let calls = calls.lock().unwrap().clone();
        assert!(calls[0].contains(r#""label":"green""#));
        assert!(calls[0].contains(r#""exclusiveGroup":"tapms-exclusive-group-label""#));
        assert!(!calls[0].contains(r#""name""#));
        assert_eq!(calls[1], r#"add green "x1""#);
        assert_eq!(calls[2], "remove blue x2");
    }

    #[tokio::test]
    async fn http_client_reads_component_ids() {
        let router = Router::new().route(
            "/State/Components",
            axum::routing::get(|| async {
                Json(serde_json::json!({
                    "Components": [{"ID": "x1", "Type": "Node"}, {"ID": "x2", "Type": "Node"}]
                }))
            }),
        );
        let base = serve(router).await;
        let hsm = HttpHardwareStateClient::new(client(
            BackingSystem::HardwareState,
            &base,
            AuthScheme::Bearer,
        ));

        let ids = hsm.list_components("Node", "Compute").await.unwrap();
        assert_eq!(ids, vec!["x1".to_string(), "x2".to_string()]);
    }
}
