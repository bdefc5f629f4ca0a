//! In-memory backends for controller tests
//!
//! Every fake records the calls that change remote state in one shared
//! journal, so tests can assert on cross-system ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use serde_json::{json, Value};

use super::store::TenantStore;
use super::Context;
use crate::credentials::MockSecretReader;
use crate::crd::{Tenant, TenantResource, TenantSpec, TenantStatus};
use crate::hooks::{HookAuth, HookPayload, HookTransport, MockGlobalHookSource};
use crate::syncer::{
    Collection, CollectionKind, HardwareStateClient, IdentityClient, IdentityGroup,
    NamespaceClient, SecretEngineClient,
};
use crate::{Error, Result, DEFAULT_TENANT_NAMESPACE, TENANT_FINALIZER};

type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Journal, entry: String) {
    journal.lock().unwrap().push(entry);
}

/// Tenant `name` in the operator namespace, finalizer attached, nothing applied
pub(crate) fn tenant(name: &str) -> Tenant {
    let mut t = Tenant::new(
        name,
        TenantSpec {
            tenant_name: name.to_string(),
            ..Default::default()
        },
    );
    t.metadata.namespace = Some(DEFAULT_TENANT_NAMESPACE.to_string());
    t.metadata.finalizers = Some(vec![TENANT_FINALIZER.to_string()]);
    t
}

/// Compute resource with the given members and targets
pub(crate) fn compute(
    members: &[&str],
    partition: Option<&str>,
    group: Option<&str>,
) -> TenantResource {
    TenantResource {
        class: "compute".to_string(),
        xnames: members.iter().map(|m| m.to_string()).collect(),
        partition: partition.map(str::to_string),
        group: group.map(str::to_string),
        exclusive: false,
    }
}

/// Snapshot of the journal
pub(crate) struct JournalView(Vec<String>);

impl JournalView {
    pub(crate) fn contains(&self, entry: &str) -> bool {
        self.0.iter().any(|e| e == entry)
    }

    /// Index of `entry`, panicking with the full journal when it is missing
    pub(crate) fn position(&self, entry: &str) -> usize {
        self.0
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry:?} not in journal {:?}", self.0))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.0.iter().filter(|e| *e == entry).count()
    }
}

/// Single-tenant store with injectable write conflicts
///
/// Every write bumps the resourceVersion. Guarded writes computed from an
/// older copy fail with 409, as they do against the API server.
pub(crate) struct FakeStore {
    tenant: Mutex<Tenant>,
    conflicts: Mutex<u32>,
    journal: Journal,
}

fn bump_version(tenant: &mut Tenant) {
    let version: u64 = tenant
        .metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    tenant.metadata.resource_version = Some((version + 1).to_string());
}

fn stale_write() -> Error {
    Error::rejected("kubernetes", 409, "the object has been modified")
}

impl FakeStore {
    pub(crate) fn current(&self) -> Tenant {
        self.tenant.lock().unwrap().clone()
    }

    /// Swap in a new copy, as a watch event would
    pub(crate) fn replace(&self, tenant: Tenant) {
        let mut current = self.tenant.lock().unwrap();
        *current = tenant;
        bump_version(&mut current);
    }

    pub(crate) fn set_status(&self, status: TenantStatus) {
        let mut current = self.tenant.lock().unwrap();
        current.status = Some(status);
        bump_version(&mut current);
    }

    /// Fail the next `n` status writes with 409
    pub(crate) fn conflict_next_writes(&self, n: u32) {
        *self.conflicts.lock().unwrap() = n;
    }

    /// Apply `change` if `from` is the latest copy
    fn guarded_write(&self, from: &Tenant, change: impl FnOnce(&mut Tenant)) -> Result<()> {
        let mut current = self.tenant.lock().unwrap();
        if from.metadata.resource_version != current.metadata.resource_version {
            return Err(stale_write());
        }
        change(&mut current);
        bump_version(&mut current);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for FakeStore {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<Tenant>> {
        let tenant = self.current();
        Ok((tenant.metadata.name.as_deref() == Some(name)).then_some(tenant))
    }

    async fn replace_status(&self, tenant: &Tenant, status: &TenantStatus) -> Result<()> {
        {
            let mut conflicts = self.conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(stale_write());
            }
        }
        self.guarded_write(tenant, |t| t.status = Some(status.clone()))
    }

    async fn add_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()> {
        self.guarded_write(tenant, |t| {
            t.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string())
        })?;
        record(&self.journal, "add finalizer".to_string());
        Ok(())
    }

    async fn remove_finalizer(&self, tenant: &Tenant, finalizer: &str) -> Result<()> {
        self.guarded_write(tenant, |t| {
            if let Some(finalizers) = t.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != finalizer);
            }
        })?;
        record(&self.journal, "remove finalizer".to_string());
        Ok(())
    }

    async fn clear_key_update_flag(&self, _tenant: &Tenant) -> Result<()> {
        record(&self.journal, "clear key update".to_string());
        let mut current = self.tenant.lock().unwrap();
        current.spec.requires_key_update = false;
        bump_version(&mut current);
        Ok(())
    }
}

/// Anchors and secrets keyed by `namespace/name`
pub(crate) struct FakeNamespaces {
    anchors: Mutex<BTreeSet<String>>,
    secrets: Mutex<BTreeSet<String>>,
    hidden: Mutex<BTreeSet<String>>,
    forbid_root_delete: Mutex<bool>,
    journal: Journal,
}

impl FakeNamespaces {
    /// Namespace `ns` is not materialised yet
    pub(crate) fn hide_namespace(&self, ns: &str) {
        self.hidden.lock().unwrap().insert(ns.to_string());
    }

    pub(crate) fn seed_secret(&self, ns: &str, name: &str) {
        self.secrets.lock().unwrap().insert(format!("{ns}/{name}"));
    }

    /// Reject deletion of root anchors the way the hierarchy controller does
    pub(crate) fn forbid_root_delete(&self) {
        *self.forbid_root_delete.lock().unwrap() = true;
    }

    fn hidden(&self, ns: &str) -> bool {
        self.hidden.lock().unwrap().contains(ns)
    }
}

#[async_trait]
impl NamespaceClient for FakeNamespaces {
    async fn anchor_exists(&self, parent: &str, name: &str) -> Result<bool> {
        Ok(self.anchors.lock().unwrap().contains(&format!("{parent}/{name}")))
    }

    async fn create_anchor(&self, parent: &str, name: &str) -> Result<()> {
        if self.hidden(parent) {
            return Err(Error::rejected("kubernetes", 404, "namespace not found"));
        }
        record(&self.journal, format!("create anchor {parent}/{name}"));
        self.anchors.lock().unwrap().insert(format!("{parent}/{name}"));
        Ok(())
    }

    async fn delete_anchor(&self, parent: &str, name: &str) -> Result<()> {
        if parent == DEFAULT_TENANT_NAMESPACE && *self.forbid_root_delete.lock().unwrap() {
            return Err(Error::rejected("kubernetes", 403, "subnamespaces still exist"));
        }
        record(&self.journal, format!("delete anchor {parent}/{name}"));
        if self.anchors.lock().unwrap().remove(&format!("{parent}/{name}")) {
            Ok(())
        } else {
            Err(Error::rejected("kubernetes", 404, "anchor not found"))
        }
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let key = format!("{namespace}/{name}");
        Ok(self.secrets.lock().unwrap().contains(&key).then(|| Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        if self.hidden(namespace) {
            return Err(Error::rejected("kubernetes", 404, "namespace not found"));
        }
        let name = secret.metadata.name.clone().unwrap_or_default();
        record(&self.journal, format!("create secret {namespace}/{name}"));
        self.secrets.lock().unwrap().insert(format!("{namespace}/{name}"));
        Ok(())
    }
}

/// Partitions and groups keyed by `kind name`
pub(crate) struct FakeHardware {
    collections: Mutex<BTreeMap<String, BTreeSet<String>>>,
    conflict_members: Mutex<BTreeSet<String>>,
    failing_members: Mutex<BTreeSet<String>>,
    journal: Journal,
}

impl FakeHardware {
    pub(crate) fn seed(&self, kind: &str, name: &str, members: &[&str]) {
        self.collections.lock().unwrap().insert(
            format!("{kind} {name}"),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub(crate) fn members(&self, kind: &str, name: &str) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .get(&format!("{kind} {name}"))
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Adding `member` answers 409 even though the member lands
    pub(crate) fn conflict_on_add(&self, member: &str) {
        self.conflict_members.lock().unwrap().insert(member.to_string());
    }

    /// Adding `member` answers 500
    pub(crate) fn fail_on_add(&self, member: &str) {
        self.failing_members.lock().unwrap().insert(member.to_string());
    }
}

#[async_trait]
impl HardwareStateClient for FakeHardware {
    async fn get_collection(&self, kind: CollectionKind, name: &str) -> Result<Option<Collection>> {
        Ok(self.collections.lock().unwrap().get(&format!("{kind} {name}")).map(|members| {
            Collection {
                name: name.to_string(),
                members: members.iter().cloned().collect(),
                ..Default::default()
            }
        }))
    }

    async fn create_collection(&self, kind: CollectionKind, collection: &Collection) -> Result<()> {
        record(&self.journal, format!("create {kind} {}", collection.name));
        self.collections
            .lock()
            .unwrap()
            .insert(format!("{kind} {}", collection.name), BTreeSet::new());
        Ok(())
    }

    async fn delete_collection(&self, kind: CollectionKind, name: &str) -> Result<()> {
        record(&self.journal, format!("delete {kind} {name}"));
        match self.collections.lock().unwrap().remove(&format!("{kind} {name}")) {
            Some(_) => Ok(()),
            None => Err(Error::rejected("hsm", 404, "no such collection")),
        }
    }

    async fn add_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()> {
        record(&self.journal, format!("add {kind} {name} {member}"));
        if self.failing_members.lock().unwrap().contains(member) {
            return Err(Error::unavailable("hsm", "internal server error"));
        }
        self.collections
            .lock()
            .unwrap()
            .entry(format!("{kind} {name}"))
            .or_default()
            .insert(member.to_string());
        if self.conflict_members.lock().unwrap().contains(member) {
            return Err(Error::rejected("hsm", 409, "member already exists"));
        }
        Ok(())
    }

    async fn remove_member(&self, kind: CollectionKind, name: &str, member: &str) -> Result<()> {
        record(&self.journal, format!("remove {kind} {name} {member}"));
        let removed = self
            .collections
            .lock()
            .unwrap()
            .get_mut(&format!("{kind} {name}"))
            .is_some_and(|m| m.remove(member));
        if removed {
            Ok(())
        } else {
            Err(Error::rejected("hsm", 404, "no such member"))
        }
    }

    async fn list_groups(&self) -> Result<Vec<Collection>> {
        Ok(Vec::new())
    }

    async fn list_components(&self, _component_type: &str, _role: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Identity groups by name, ids derived from the name
pub(crate) struct FakeIdentity {
    groups: Mutex<BTreeSet<String>>,
    journal: Journal,
}

#[async_trait]
impl IdentityClient for FakeIdentity {
    async fn find_group(&self, name: &str) -> Result<Option<IdentityGroup>> {
        Ok(self.groups.lock().unwrap().contains(name).then(|| IdentityGroup {
            id: Some(format!("id-{name}")),
            name: name.to_string(),
            path: format!("/{name}"),
        }))
    }

    async fn create_group(&self, group: &IdentityGroup) -> Result<()> {
        record(&self.journal, format!("create identity group {}", group.name));
        self.groups.lock().unwrap().insert(group.name.clone());
        Ok(())
    }

    async fn delete_group(&self, id: &str) -> Result<()> {
        record(&self.journal, format!("delete identity group {id}"));
        let name = id.trim_start_matches("id-");
        self.groups.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Secret-engine paths; every key reads back with one version of material
pub(crate) struct FakeSecretEngine {
    paths: Mutex<BTreeMap<String, Value>>,
    journal: Journal,
}

#[async_trait]
impl SecretEngineClient for FakeSecretEngine {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let paths = self.paths.lock().unwrap();
        Ok(paths.get(path).map(|body| {
            if path.contains("/keys/") {
                json!({ "keys": { "1": "-----BEGIN PUBLIC KEY-----" } })
            } else {
                body.clone()
            }
        }))
    }

    async fn write(&self, path: &str, body: &Value) -> Result<()> {
        record(&self.journal, format!("write {path}"));
        self.paths
            .lock()
            .unwrap()
            .insert(path.to_string(), body.clone());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        record(&self.journal, format!("delete {path}"));
        match self.paths.lock().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::rejected("vault", 404, "not found")),
        }
    }
}

/// Journals each call; URLs ending in `/fail` answer 500
pub(crate) struct FakeHookTransport {
    journal: Journal,
}

#[async_trait]
impl HookTransport for FakeHookTransport {
    async fn post(
        &self,
        url: &str,
        payload: &HookPayload,
        _blocking: bool,
        _auth: Option<HookAuth>,
    ) -> Result<u16> {
        record(&self.journal, format!("hook {url} {}", payload.event_type));
        Ok(if url.ends_with("/fail") { 500 } else { 200 })
    }
}

/// One tenant and every backing system, sharing a journal
pub(crate) struct Backends {
    pub(crate) store: Arc<FakeStore>,
    pub(crate) namespaces: Arc<FakeNamespaces>,
    pub(crate) hardware: Arc<FakeHardware>,
    pub(crate) identity: Arc<FakeIdentity>,
    pub(crate) secret_engine: Arc<FakeSecretEngine>,
    journal: Journal,
}

impl Backends {
    pub(crate) fn new(tenant: Tenant) -> Self {
        let journal: Journal = Arc::default();
        Self {
            store: Arc::new(FakeStore {
                tenant: Mutex::new(tenant),
                conflicts: Mutex::new(0),
                journal: journal.clone(),
            }),
            namespaces: Arc::new(FakeNamespaces {
                anchors: Mutex::default(),
                secrets: Mutex::default(),
                hidden: Mutex::default(),
                forbid_root_delete: Mutex::new(false),
                journal: journal.clone(),
            }),
            hardware: Arc::new(FakeHardware {
                collections: Mutex::default(),
                conflict_members: Mutex::default(),
                failing_members: Mutex::default(),
                journal: journal.clone(),
            }),
            identity: Arc::new(FakeIdentity {
                groups: Mutex::default(),
                journal: journal.clone(),
            }),
            secret_engine: Arc::new(FakeSecretEngine {
                paths: Mutex::default(),
                journal: journal.clone(),
            }),
            journal,
        }
    }

    pub(crate) fn journal(&self) -> JournalView {
        JournalView(self.journal.lock().unwrap().clone())
    }

    /// Forget calls made so far, keeping remote state
    pub(crate) fn clear_journal(&self) {
        self.journal.lock().unwrap().clear();
    }

    pub(crate) fn context(&self) -> Context {
        let mut globals = MockGlobalHookSource::new();
        globals.expect_list_global_hooks().returning(|| Ok(Vec::new()));

        Context::builder()
            .namespace(DEFAULT_TENANT_NAMESPACE)
            .tenant_store(self.store.clone())
            .namespace_client(self.namespaces.clone())
            .hardware_client(self.hardware.clone())
            .identity_client(self.identity.clone())
            .secret_engine_client(self.secret_engine.clone())
            .hook_transport(Arc::new(FakeHookTransport {
                journal: self.journal.clone(),
            }))
            .global_hooks(Arc::new(globals))
            .secret_reader(Arc::new(MockSecretReader::new()))
            .build()
            .expect("test context")
    }
}
