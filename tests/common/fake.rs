//! In-memory stand-ins for the API server and the database instances
//!
//! Every fake records the writes it receives so tests can assert on what the
//! operator did, not just on the final state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use serde_json::{Value, json};

use pg_cluster_operator::controller::restart::{Instance, InstanceOps, InstanceRole};
use pg_cluster_operator::controller::{ClusterApi, Error, EventPublisher, Result, StatusStore};
use pg_cluster_operator::crd::{PostgresCluster, PostgresDbOps};
use pg_cluster_operator::resources::patroni::InstanceTemplate;
use pg_cluster_operator::resources::{DesiredObject, LiveObject, ObjectKey};

// =============================================================================
// Cluster API
// =============================================================================

/// Object store keyed by (kind, namespace, name)
#[derive(Default)]
pub struct FakeClusterApi {
    objects: Mutex<BTreeMap<ObjectKey, LiveObject>>,
    version: AtomicU64,
    writes: Mutex<Vec<(String, ObjectKey)>>,
    /// Objects whose next write fails with a conflict
    conflicts: Mutex<Vec<ObjectKey>>,
    /// Objects every write to fails
    broken: Mutex<Vec<ObjectKey>>,
}

fn labels_match(payload: &Value, selector: &str) -> bool {
    let labels = payload.pointer("/metadata/labels");
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                .is_some_and(|v| v == value),
            None => false,
        })
}

#[allow(dead_code)]
impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store an object as if another client had created it
    pub fn seed(&self, key: ObjectKey, mut payload: Value) {
        let version = self.next_version();
        payload["metadata"]["resourceVersion"] = json!(version);
        self.objects.lock().unwrap().insert(
            key.clone(),
            LiveObject {
                key,
                resource_version: Some(version),
                payload,
            },
        );
    }

    pub fn object(&self, key: &ObjectKey) -> Option<LiveObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Writes in the order they happened, as (verb, key)
    pub fn writes(&self) -> Vec<(String, ObjectKey)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn conflict_on(&self, key: ObjectKey) {
        self.conflicts.lock().unwrap().push(key);
    }

    pub fn break_object(&self, key: ObjectKey) {
        self.broken.lock().unwrap().push(key);
    }

    /// Mutate a stored object the way another controller would
    pub fn edit(&self, key: &ObjectKey, edit: impl FnOnce(&mut Value)) {
        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(key).unwrap();
        edit(&mut object.payload);
        object.payload["metadata"]["resourceVersion"] = json!(version);
        object.resource_version = Some(version);
    }

    fn check_write(&self, key: &ObjectKey) -> Result<()> {
        if self.broken.lock().unwrap().contains(key) {
            return Err(Error::ValidationError(format!("{} rejected by admission", key)));
        }
        let mut conflicts = self.conflicts.lock().unwrap();
        if let Some(pos) = conflicts.iter().position(|k| k == key) {
            conflicts.remove(pos);
            return Err(Error::ApplyConflict(key.to_string()));
        }
        Ok(())
    }

    fn store(&self, key: &ObjectKey, mut payload: Value, uid: Value) -> LiveObject {
        let version = self.next_version();
        payload["metadata"]["uid"] = uid;
        payload["metadata"]["resourceVersion"] = json!(version);
        let live = LiveObject {
            key: key.clone(),
            resource_version: Some(version),
            payload,
        };
        self.objects.lock().unwrap().insert(key.clone(), live.clone());
        live
    }

    fn record(&self, verb: &str, key: &ObjectKey) {
        self.writes.lock().unwrap().push((verb.to_string(), key.clone()));
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_owned(&self, namespace: &str, selector: &str) -> Result<Vec<LiveObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.key.namespace == namespace && labels_match(&o.payload, selector))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<LiveObject>> {
        Ok(self.object(key))
    }

    async fn create(&self, desired: &DesiredObject) -> Result<LiveObject> {
        self.check_write(&desired.key)?;
        if self.object(&desired.key).is_some() {
            return Err(Error::ApplyConflict(format!("{} already exists", desired.key)));
        }
        self.record("create", &desired.key);
        let uid = json!(format!("uid-{}", desired.key.name));
        Ok(self.store(&desired.key, desired.payload.clone(), uid))
    }

    async fn patch(
        &self,
        desired: &DesiredObject,
        resource_version: Option<String>,
    ) -> Result<LiveObject> {
        self.check_write(&desired.key)?;
        let existing = self
            .object(&desired.key)
            .ok_or_else(|| Error::NotFound(desired.key.to_string()))?;
        if resource_version.is_some() && resource_version != existing.resource_version {
            return Err(Error::ApplyConflict(desired.key.to_string()));
        }
        self.record("patch", &desired.key);
        let uid = existing.payload["metadata"]["uid"].clone();
        Ok(self.store(&desired.key, desired.payload.clone(), uid))
    }

    async fn delete(&self, live: &LiveObject) -> Result<()> {
        self.check_write(&live.key)?;
        self.record("delete", &live.key);
        self.objects.lock().unwrap().remove(&live.key);
        Ok(())
    }
}

// =============================================================================
// Status store
// =============================================================================

type NamedKey = (String, String);

fn named(namespace: &str, name: &str) -> NamedKey {
    (namespace.to_string(), name.to_string())
}

/// Operations and clusters with merge-patch status semantics
#[derive(Default)]
pub struct FakeStatusStore {
    operations: Mutex<HashMap<NamedKey, PostgresDbOps>>,
    clusters: Mutex<HashMap<NamedKey, PostgresCluster>>,
    version: AtomicU64,
    /// Number of upcoming status writes that fail with a conflict
    pending_conflicts: AtomicU32,
    status_writes: AtomicU32,
}

fn merge_status<S>(current: &Option<S>, patch: &Value) -> Result<Option<S>>
where
    S: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut doc = serde_json::to_value(current)?;
    if doc.is_null() {
        doc = json!({});
    }
    json_patch::merge(&mut doc, patch);
    Ok(Some(serde_json::from_value(doc)?))
}

#[allow(dead_code)]
impl FakeStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn put_operation(&self, mut op: PostgresDbOps) {
        op.metadata.resource_version = Some(self.next_version());
        let key = named(&op.namespace().unwrap_or_default(), &op.name_any());
        self.operations.lock().unwrap().insert(key, op);
    }

    pub fn put_cluster(&self, mut cluster: PostgresCluster) {
        cluster.metadata.resource_version = Some(self.next_version());
        let key = named(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        self.clusters.lock().unwrap().insert(key, cluster);
    }

    pub fn operation(&self, namespace: &str, name: &str) -> Option<PostgresDbOps> {
        self.operations.lock().unwrap().get(&named(namespace, name)).cloned()
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<PostgresCluster> {
        self.clusters.lock().unwrap().get(&named(namespace, name)).cloned()
    }

    pub fn remove_operation(&self, namespace: &str, name: &str) {
        self.operations.lock().unwrap().remove(&named(namespace, name));
    }

    /// Set a deletion timestamp the way `kubectl delete` does with finalizers
    pub fn mark_operation_deleted(&self, namespace: &str, name: &str) {
        let mut operations = self.operations.lock().unwrap();
        if let Some(op) = operations.get_mut(&named(namespace, name)) {
            op.metadata.deletion_timestamp = Some(
                Time(k8s_openapi::chrono::Utc::now()),
            );
        }
    }

    pub fn fail_next_status_writes(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> u32 {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn check_conflict(&self, what: &str) -> Result<()> {
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::StatusConflict(what.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatusStore for FakeStatusStore {
    async fn get_operation(&self, namespace: &str, name: &str) -> Result<Option<PostgresDbOps>> {
        Ok(self.operation(namespace, name))
    }

    async fn patch_operation_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()> {
        let what = format!("PostgresDbOps {}/{}", namespace, name);
        self.check_conflict(&what)?;
        let version = self.next_version();
        let mut operations = self.operations.lock().unwrap();
        let op = operations
            .get_mut(&named(namespace, name))
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        if resource_version.is_some() && resource_version != op.metadata.resource_version {
            return Err(Error::StatusConflict(what));
        }
        op.status = merge_status(&op.status, &status)?;
        op.metadata.resource_version = Some(version);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<PostgresCluster>> {
        Ok(self.cluster(namespace, name))
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: Value,
    ) -> Result<()> {
        let what = format!("PostgresCluster {}/{}", namespace, name);
        self.check_conflict(&what)?;
        let version = self.next_version();
        let mut clusters = self.clusters.lock().unwrap();
        let cluster = clusters
            .get_mut(&named(namespace, name))
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        if resource_version.is_some() && resource_version != cluster.metadata.resource_version {
            return Err(Error::StatusConflict(what));
        }
        cluster.status = merge_status(&cluster.status, &status)?;
        cluster.metadata.resource_version = Some(version);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Instances
// =============================================================================

/// How an injected failure surfaces
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The instance never becomes ready
    Timeout,
    /// A transient API error
    Transient,
    /// Patroni refuses the switchover
    Rejected,
    /// Patroni refuses the PostgreSQL restart
    Refused,
}

impl Failure {
    fn error(self, instance: &str) -> Error {
        match self {
            Failure::Timeout => Error::ReadinessTimeout {
                instance: instance.to_string(),
                timeout: Duration::from_secs(60),
            },
            Failure::Transient => Error::NotFound(format!("Pod {}", instance)),
            Failure::Rejected => Error::SwitchoverRejected(format!("{} refused", instance)),
            Failure::Refused => {
                Error::RestartRejected(format!("{}: 503 restart already in progress", instance))
            }
        }
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// Instances of one cluster, restarted and promoted in memory
///
/// A restarted instance picks up `template`, like a pod recreated from the
/// current StatefulSet would.
#[derive(Default)]
pub struct FakeInstanceOps {
    instances: Mutex<BTreeMap<String, Instance>>,
    template: Mutex<Option<InstanceTemplate>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, (Failure, u32)>>,
    hooks: Mutex<Vec<(String, Hook)>>,
}

#[allow(dead_code)]
impl FakeInstanceOps {
    pub fn new(instances: Vec<Instance>) -> Self {
        let ops = Self::default();
        for instance in instances {
            ops.add_instance(instance);
        }
        ops
    }

    pub fn with_template(self, template: InstanceTemplate) -> Self {
        *self.template.lock().unwrap() = Some(template);
        self
    }

    pub fn add_instance(&self, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.name.clone(), instance);
    }

    pub fn remove_instance(&self, name: &str) {
        self.instances.lock().unwrap().remove(name);
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    pub fn primary(&self) -> Option<String> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .find(|i| i.role == InstanceRole::Primary)
            .map(|i| i.name.clone())
    }

    /// Calls as `"<action> <instance>"`, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Restart calls only, as (action, instance)
    pub fn restarts(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| {
                let (action, rest) = c.split_once(' ')?;
                matches!(action, "restart_pod" | "restart_postgres")
                    .then(|| (action.to_string(), rest.to_string()))
            })
            .collect()
    }

    /// Fail the next `times` actions on `instance`
    pub fn fail(&self, instance: &str, failure: Failure, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(instance.to_string(), (failure, times));
    }

    /// Run `hook` once after the first successful action on `instance`
    pub fn after(&self, instance: &str, hook: impl FnOnce() + Send + 'static) {
        self.hooks
            .lock()
            .unwrap()
            .push((instance.to_string(), Box::new(hook)));
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_failure(&self, instance: &str) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        if let Some((failure, remaining)) = failures.get_mut(instance) {
            let failure = *failure;
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(instance);
            }
            return Err(failure.error(instance));
        }
        Ok(())
    }

    fn run_hooks(&self, instance: &str) {
        let due: Vec<Hook> = {
            let mut hooks = self.hooks.lock().unwrap();
            let mut due = Vec::new();
            let mut i = 0;
            while i < hooks.len() {
                if hooks[i].0 == instance {
                    due.push(hooks.remove(i).1);
                } else {
                    i += 1;
                }
            }
            due
        };
        for hook in due {
            hook();
        }
    }

    fn refresh(&self, name: &str, pod_replaced: bool) {
        let template = self.template.lock().unwrap().clone();
        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get_mut(name) {
            instance.pending_restart = false;
            instance.ready = true;
            if let Some(template) = template.filter(|_| pod_replaced) {
                instance.config_hash = Some(template.config_hash);
                instance.image = Some(template.image);
            }
        }
    }
}

#[async_trait]
impl InstanceOps for FakeInstanceOps {
    async fn list_instances(&self, _namespace: &str, _cluster: &str) -> Result<Vec<Instance>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn restart_pod(&self, _namespace: &str, instance: &str) -> Result<()> {
        self.record(format!("restart_pod {}", instance));
        self.check_failure(instance)?;
        self.refresh(instance, true);
        self.run_hooks(instance);
        Ok(())
    }

    async fn wait_ready(&self, _namespace: &str, instance: &str) -> Result<()> {
        self.record(format!("wait_ready {}", instance));
        self.check_failure(instance)?;
        let missing = self.instance(instance).is_none();
        if missing {
            // The StatefulSet recreates the pod as a replica
            let ordinal = instance
                .rsplit_once('-')
                .and_then(|(_, o)| o.parse().ok())
                .unwrap_or_default();
            self.add_instance(Instance {
                name: instance.to_string(),
                ordinal,
                role: InstanceRole::Replica,
                ready: true,
                config_hash: None,
                image: None,
                pending_restart: false,
            });
        }
        self.refresh(instance, true);
        self.run_hooks(instance);
        Ok(())
    }

    async fn restart_postgres(&self, _namespace: &str, instance: &str) -> Result<()> {
        self.record(format!("restart_postgres {}", instance));
        self.check_failure(instance)?;
        self.refresh(instance, false);
        self.run_hooks(instance);
        Ok(())
    }

    async fn switchover(
        &self,
        _namespace: &str,
        _cluster: &str,
        primary: &str,
        candidate: &str,
    ) -> Result<()> {
        self.record(format!("switchover {} -> {}", primary, candidate));
        self.check_failure(primary)?;
        {
            let mut instances = self.instances.lock().unwrap();
            for instance in instances.values_mut() {
                if instance.name == primary {
                    instance.role = InstanceRole::Replica;
                } else if instance.name == candidate {
                    instance.role = InstanceRole::Primary;
                }
            }
        }
        self.run_hooks(primary);
        Ok(())
    }

    /// Scaling down drops the highest ordinals; new pods appear once waited for
    async fn scale_instances(&self, _namespace: &str, cluster: &str, instances: i32) -> Result<()> {
        self.record(format!("scale {} {}", cluster, instances));
        self.check_failure(cluster)?;
        let keep = u32::try_from(instances).unwrap_or_default();
        self.instances
            .lock()
            .unwrap()
            .retain(|_, instance| instance.ordinal < keep);
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

#[allow(dead_code)]
impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            object: resource_ref.name.clone().unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}
