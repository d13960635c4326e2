//! An in-memory stand-in for the api server, for testing reconciles without a cluster.
//!
//! `FakeCluster` implements `ClusterApi` and behaves like the api server in the ways that matter to
//! the operator: it assigns `uid`, `resourceVersion` and `generation`, rejects writes with a stale
//! `resourceVersion` with a 409, keeps `status` out of regular replaces, and deletes dependents
//! through their owner references the way the garbage collector does. Writes can be made to fail
//! per type, to simulate admission rejections.
use crate::k8s_types::siab_io::v1alpha1::SIABApplication;
use crate::k8s_types::K8sType;
use crate::reconcile::ClusterApi;
use crate::resource::{str_value, ObjectId, ObjectIdRef};
use crate::runner::client::Error;

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{json, Value};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Identifies a stored object: `(apiVersion, kind, namespace, name)`
pub type ObjectKey = (&'static str, &'static str, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Replace,
    ReplaceStatus,
}

/// A request that was made to the fake api server
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub verb: Verb,
    pub kind: &'static str,
    pub id: ObjectId,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    counter: u64,
    rejected_writes: HashMap<&'static str, StatusCode>,
    rejected_status_writes: Option<StatusCode>,
    operations: Vec<Operation>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn record(&mut self, verb: Verb, k8s_type: &K8sType, id: &ObjectIdRef<'_>) {
        self.operations.push(Operation {
            verb,
            kind: k8s_type.kind,
            id: id.to_owned(),
        });
    }

    fn check_writable(&self, k8s_type: &K8sType) -> Result<(), Error> {
        match self.rejected_writes.get(k8s_type.kind) {
            Some(status) => Err(Error::http(*status)),
            None => Ok(()),
        }
    }

    fn assign_version(&mut self, object: &mut Value) {
        let version = self.next().to_string();
        set_metadata(object, "resourceVersion", Value::from(version));
    }
}

#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key(k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> ObjectKey {
    (
        k8s_type.api_version,
        k8s_type.kind,
        id.namespace.to_owned(),
        id.name.to_owned(),
    )
}

fn object_id(object: &Value) -> ObjectId {
    ObjectId::new(
        str_value(object, "/metadata/namespace").unwrap_or(""),
        str_value(object, "/metadata/name").unwrap_or(""),
    )
}

fn set_metadata(object: &mut Value, field: &str, value: Value) {
    if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert(field.to_owned(), value);
    }
}

fn resource_version_conflicts(existing: &Value, incoming: &Value) -> bool {
    match str_value(incoming, "/metadata/resourceVersion") {
        Some(version) => str_value(existing, "/metadata/resourceVersion") != Some(version),
        None => false,
    }
}

fn owner_uids(object: &Value) -> Vec<&str> {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|owners| {
            owners
                .iter()
                .filter_map(|o| o.get("uid").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

impl FakeCluster {
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a test that panicked while holding the lock has already failed
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stores an object as is, apart from the fields the api server assigns
    pub fn insert(&self, k8s_type: &K8sType, mut object: Value) -> Value {
        let mut state = self.lock();
        let id = object_id(&object);
        let uid = format!("uid-{}", state.next());
        set_metadata(&mut object, "uid", Value::from(uid));
        set_metadata(&mut object, "generation", Value::from(1));
        state.assign_version(&mut object);
        state
            .objects
            .insert(key(k8s_type, &id.as_id_ref()), object.clone());
        object
    }

    /// Creates a `SIABApplication` with the given spec and no status
    pub fn create_application(&self, namespace: &str, name: &str, spec: Value) -> Value {
        self.insert(
            SIABApplication,
            json!({
                "apiVersion": SIABApplication.api_version,
                "kind": SIABApplication.kind,
                "metadata": {"namespace": namespace, "name": name},
                "spec": spec,
            }),
        )
    }

    /// Replaces the spec of an application the way a user would, which increments its generation
    pub fn update_application_spec(&self, namespace: &str, name: &str, spec: Value) {
        let mut state = self.lock();
        let id = ObjectIdRef::new(namespace, name);
        let version = state.next().to_string();
        if let Some(app) = state.objects.get_mut(&key(SIABApplication, &id)) {
            let generation = app
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            app["spec"] = spec;
            set_metadata(app, "generation", Value::from(generation + 1));
            set_metadata(app, "resourceVersion", Value::from(version));
        }
    }

    /// Sets the status of any object, like the controller responsible for it would
    pub fn set_status(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>, status: Value) {
        let mut state = self.lock();
        let version = state.next().to_string();
        if let Some(object) = state.objects.get_mut(&key(k8s_type, id)) {
            object["status"] = status;
            set_metadata(object, "resourceVersion", Value::from(version));
        }
    }

    /// Deletes the object, along with everything that it owns, directly or transitively
    pub fn delete(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) {
        let mut state = self.lock();
        let mut deleted_uids = match state.objects.remove(&key(k8s_type, id)) {
            Some(object) => vec![str_value(&object, "/metadata/uid")
                .unwrap_or("")
                .to_owned()],
            None => return,
        };
        while let Some(owner_uid) = deleted_uids.pop() {
            let dependents: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|(_, obj)| owner_uids(obj).contains(&owner_uid.as_str()))
                .map(|(k, _)| k.clone())
                .collect();
            for dependent in dependents {
                if let Some(obj) = state.objects.remove(&dependent) {
                    deleted_uids.push(str_value(&obj, "/metadata/uid").unwrap_or("").to_owned());
                }
            }
        }
    }

    pub fn get_object(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Option<Value> {
        self.lock().objects.get(&key(k8s_type, id)).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Every stored object that isn't a `SIABApplication`
    pub fn children_snapshot(&self) -> BTreeMap<ObjectKey, Value> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.1 != SIABApplication.kind)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Makes creates and replaces of the given type fail with `status`
    pub fn reject_writes(&self, k8s_type: &K8sType, status: StatusCode) {
        self.lock().rejected_writes.insert(k8s_type.kind, status);
    }

    pub fn allow_writes(&self, k8s_type: &K8sType) {
        self.lock().rejected_writes.remove(k8s_type.kind);
    }

    /// Makes every status write fail with the given status, or succeed again when `None`
    pub fn reject_status_writes(&self, status: Option<StatusCode>) {
        self.lock().rejected_status_writes = status;
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().operations.clear();
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error> {
        let mut state = self.lock();
        state.record(Verb::Get, k8s_type, id);
        Ok(state.objects.get(&key(k8s_type, id)).cloned())
    }

    async fn create(&self, k8s_type: &K8sType, object: &Value) -> Result<Value, Error> {
        let id = object_id(object);
        {
            let mut state = self.lock();
            state.record(Verb::Create, k8s_type, &id.as_id_ref());
            state.check_writable(k8s_type)?;
            if state.objects.contains_key(&key(k8s_type, &id.as_id_ref())) {
                return Err(Error::http(StatusCode::CONFLICT));
            }
        }
        let mut object = object.clone();
        if let Some(obj) = object.as_object_mut() {
            obj.remove("status");
        }
        Ok(self.insert(k8s_type, object))
    }

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error> {
        let mut state = self.lock();
        state.record(Verb::Replace, k8s_type, id);
        state.check_writable(k8s_type)?;
        let existing = state
            .objects
            .get(&key(k8s_type, id))
            .cloned()
            .ok_or_else(|| Error::http(StatusCode::NOT_FOUND))?;
        if resource_version_conflicts(&existing, object) {
            return Err(Error::http(StatusCode::CONFLICT));
        }

        let mut updated = object.clone();
        match existing.get("status") {
            Some(status) => updated["status"] = status.clone(),
            None => {
                if let Some(obj) = updated.as_object_mut() {
                    obj.remove("status");
                }
            }
        }
        let generation = existing
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if existing.get("spec") != updated.get("spec") {
            generation + 1
        } else {
            generation
        };
        let uid = existing.pointer("/metadata/uid").cloned().unwrap_or(Value::Null);
        set_metadata(&mut updated, "uid", uid);
        set_metadata(&mut updated, "generation", Value::from(generation));
        state.assign_version(&mut updated);
        state.objects.insert(key(k8s_type, id), updated.clone());
        Ok(updated)
    }

    async fn replace_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error> {
        let mut state = self.lock();
        state.record(Verb::ReplaceStatus, k8s_type, id);
        if let Some(status) = state.rejected_status_writes {
            return Err(Error::http(status));
        }
        let mut existing = state
            .objects
            .get(&key(k8s_type, id))
            .cloned()
            .ok_or_else(|| Error::http(StatusCode::NOT_FOUND))?;
        if resource_version_conflicts(&existing, object) {
            return Err(Error::http(StatusCode::CONFLICT));
        }
        existing["status"] = object.get("status").cloned().unwrap_or(Value::Null);
        state.assign_version(&mut existing);
        state.objects.insert(key(k8s_type, id), existing.clone());
        Ok(existing)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("failed to build runtime")
            .block_on(future)
    }

    #[test]
    fn stale_resource_version_is_a_conflict() {
        let cluster = FakeCluster::new();
        let app = cluster.create_application("apps", "web", json!({"image": "nginx"}));
        let id = ObjectIdRef::new("apps", "web");
        cluster.update_application_spec("apps", "web", json!({"image": "nginx:2"}));

        let err = run(cluster.replace_status(SIABApplication, &id, &app))
            .expect_err("stale write should fail");
        assert!(err.is_http_status(409));
    }

    #[test]
    fn deleting_an_owner_deletes_its_dependents() {
        let cluster = FakeCluster::new();
        let app = cluster.create_application("apps", "web", json!({"image": "nginx"}));
        let owner_uid = app["metadata"]["uid"].clone();
        cluster.insert(
            k8s_types::core::v1::Service,
            json!({
                "metadata": {"namespace": "apps", "name": "web", "ownerReferences": [{"uid": owner_uid}]},
            }),
        );
        cluster.insert(
            k8s_types::core::v1::Service,
            json!({"metadata": {"namespace": "apps", "name": "unrelated"}}),
        );
        assert_eq!(3, cluster.object_count());

        cluster.delete(SIABApplication, &ObjectIdRef::new("apps", "web"));
        assert_eq!(1, cluster.object_count());
        assert!(cluster
            .get_object(
                k8s_types::core::v1::Service,
                &ObjectIdRef::new("apps", "unrelated")
            )
            .is_some());
    }

    #[test]
    fn replace_keeps_status_and_bumps_generation_on_spec_change() {
        let cluster = FakeCluster::new();
        let app = cluster.create_application("apps", "web", json!({"image": "nginx"}));
        let id = ObjectIdRef::new("apps", "web");
        cluster.set_status(SIABApplication, &id, json!({"phase": "Running"}));

        let mut update = cluster.get_object(SIABApplication, &id).expect("app");
        update["spec"] = json!({"image": "nginx:2"});
        update["status"] = json!({"phase": "Failed"});
        let updated = run(cluster.replace(SIABApplication, &id, &update)).expect("replace");

        assert_eq!(json!({"phase": "Running"}), updated["status"]);
        assert_eq!(Some(2), updated["metadata"]["generation"].as_i64());
        assert_eq!(app["metadata"]["uid"], updated["metadata"]["uid"]);
    }
}
