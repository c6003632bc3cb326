//! An in-memory [`ObjectStore`] that behaves closely enough to the API server for reconciler tests

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::Mutex,
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use snafu::ResultExt;
use stackable_operator::kube::{self, error::ErrorResponse, ResourceExt};

use super::{object_ref, DeleteSnafu, ObjectStore, Result, StoredResource};

type Key = (String, String, String);

fn kind<K: StoredResource>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: StoredResource>(name: &str, namespace: &str) -> Key {
    (
        kind::<K>(),
        namespace.to_string(),
        name.to_string(),
    )
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, Value>>,
    failing_deletes: Mutex<BTreeSet<String>>,
    deleted: Mutex<Vec<Key>>,
}

impl MemoryStore {
    /// Stores `obj` verbatim, including its status.
    pub fn insert<K: StoredResource>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).unwrap();
        if value["metadata"].get("generation").is_none() {
            value["metadata"]["generation"] = json!(1);
        }
        self.objects.lock().unwrap().insert(
            key::<K>(&obj.name_any(), &obj.namespace().unwrap()),
            value,
        );
    }

    pub fn get<K: StoredResource>(&self, name: &str, namespace: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&key::<K>(name, namespace))
            .map(|value| serde_json::from_value(value.clone()).unwrap())
    }

    /// Makes every later deletion of an object called `name` fail.
    pub fn fail_deletes_of(&self, name: &str) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(name.to_string());
    }

    /// Names of all deleted objects of kind `K`, in deletion order.
    pub fn deleted<K: StoredResource>(&self) -> Vec<String> {
        let kind = kind::<K>();
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }
}

fn matches_labels(value: &Value, label_selector: Option<&str>) -> bool {
    let Some(label_selector) = label_selector else {
        return true;
    };
    label_selector.split(',').all(|requirement| {
        let (label, expected) = requirement.split_once('=').unwrap();
        value["metadata"]["labels"][label].as_str() == Some(expected)
    })
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list<K: StoredResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let kind = kind::<K>();
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind
                    && namespace.map_or(true, |namespace| namespace == ns)
                    && matches_labels(value, label_selector)
            })
            .map(|(_, value)| serde_json::from_value(value.clone()).unwrap())
            .collect())
    }

    async fn get_opt<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        Ok(self.get(name, namespace))
    }

    async fn apply<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let key = key::<K>(&obj.name_any(), &obj.namespace().unwrap());
        let mut value = serde_json::to_value(obj).unwrap();
        let mut objects = self.objects.lock().unwrap();
        let generation = match objects.get(&key) {
            Some(old) => {
                let generation = old["metadata"]["generation"].as_i64().unwrap_or(1);
                if let Some(status) = old.get("status") {
                    value["status"] = status.clone();
                }
                if let Some(finalizers) = old["metadata"].get("finalizers") {
                    value["metadata"]["finalizers"] = finalizers.clone();
                }
                if old.get("spec") == value.get("spec") {
                    generation
                } else {
                    generation + 1
                }
            }
            None => {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("status");
                }
                1
            }
        };
        value["metadata"]["generation"] = json!(generation);
        objects.insert(key, value.clone());
        Ok(serde_json::from_value(value).unwrap())
    }

    async fn apply_status<K, S>(&self, obj: &K, status: &S) -> Result<()>
    where
        K: StoredResource,
        S: Serialize + Debug + Send + Sync,
    {
        let key = key::<K>(&obj.name_any(), &obj.namespace().unwrap());
        if let Some(value) = self.objects.lock().unwrap().get_mut(&key) {
            value["status"] = serde_json::to_value(status).unwrap();
        }
        Ok(())
    }

    async fn set_finalizers<K: StoredResource>(
        &self,
        obj: &K,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let key = key::<K>(&obj.name_any(), &obj.namespace().unwrap());
        let mut objects = self.objects.lock().unwrap();
        if let Some(value) = objects.get_mut(&key) {
            value["metadata"]["finalizers"] = json!(finalizers);
            let released = finalizers.is_empty()
                && value["metadata"].get("deletionTimestamp").is_some();
            if released {
                objects.remove(&key);
            }
        }
        Ok(())
    }

    async fn delete<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<()> {
        if self.failing_deletes.lock().unwrap().contains(name) {
            return Err(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("deleting {name} is forbidden"),
                reason: "Forbidden".to_string(),
                code: 403,
            }))
            .context(DeleteSnafu {
                object: object_ref::<K>(name, namespace),
            });
        }
        let key = key::<K>(name, namespace);
        if self.objects.lock().unwrap().remove(&key).is_some() {
            self.deleted.lock().unwrap().push(key);
        }
        Ok(())
    }
}
