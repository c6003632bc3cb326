//! The narrow slice of the Kubernetes API that the reconcilers depend on
//!
//! Reconcilers only ever talk to an [`ObjectStore`], which lets them run against
//! remote clusters (and against an in-memory store in tests).

use std::{fmt::Debug, path::Path};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::NamespaceResourceScope,
    kube::{
        self,
        api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
        config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
        runtime::{reflector::ObjectRef, watcher, WatchStreamExt},
        Resource, ResourceExt,
    },
};
use tracing::warn;

#[cfg(test)]
pub mod memory;

/// Identifies the object whose modification caused a reconcile pass.
pub type Trigger = ObjectRef<DynamicObject>;

/// Any namespaced object that can be read from and written to an [`ObjectStore`].
pub trait StoredResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}
impl<K> StoredResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list {kind} objects"))]
    List { source: kube::Error, kind: String },

    #[snafu(display("failed to get {object}"))]
    Get {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("{kind} {name:?} has no namespace"))]
    NoNamespace { kind: String, name: String },

    #[snafu(display("failed to apply {object}"))]
    Apply {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update status of {object}"))]
    PatchStatus {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update finalizers of {object}"))]
    PatchFinalizers {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to delete {object}"))]
    Delete {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Typed CRUD access to the objects of a single cluster.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists all objects of kind `K`, across all namespaces if `namespace` is [`None`].
    async fn list<K: StoredResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    async fn get_opt<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<Option<K>>;

    /// Creates or overwrites the fields of `obj` owned by this operator.
    async fn apply<K: StoredResource>(&self, obj: &K) -> Result<K>;

    /// Replaces the status of `obj`, leaving everything else untouched.
    async fn apply_status<K, S>(&self, obj: &K, status: &S) -> Result<()>
    where
        K: StoredResource,
        S: Serialize + Debug + Send + Sync;

    async fn set_finalizers<K: StoredResource>(&self, obj: &K, finalizers: Vec<String>)
        -> Result<()>;

    /// Deletes the object, succeeding if it is already gone.
    async fn delete<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<()>;
}

pub fn object_ref<K: StoredResource>(name: &str, namespace: &str) -> ObjectRef<DynamicObject> {
    ObjectRef::<K>::new(name).within(namespace).erase()
}

fn namespace_of<K: StoredResource>(obj: &K) -> Result<String> {
    obj.namespace().with_context(|| NoNamespaceSnafu {
        kind: K::kind(&()).to_string(),
        name: obj.name_any(),
    })
}

#[derive(Debug, Snafu)]
pub enum FromKubeconfigError {
    #[snafu(display("failed to read kubeconfig {path:?}"))]
    ReadKubeconfig {
        source: KubeconfigError,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to load kubeconfig {path:?}"))]
    LoadKubeconfig {
        source: KubeconfigError,
        path: std::path::PathBuf,
    },

    #[snafu(display("failed to create Kubernetes client for {path:?}"))]
    CreateClient {
        source: kube::Error,
        path: std::path::PathBuf,
    },
}

/// An [`ObjectStore`] backed by a live Kubernetes cluster.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: kube::Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connects to a remote cluster using the default context of a kubeconfig file.
    pub async fn from_kubeconfig(
        path: &Path,
        field_manager: impl Into<String>,
    ) -> Result<Self, FromKubeconfigError> {
        let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu { path })?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context(LoadKubeconfigSnafu { path })?;
        let client = kube::Client::try_from(config).context(CreateClientSnafu { path })?;
        Ok(Self::new(client, field_manager))
    }

    fn api<K: StoredResource>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Emits a [`Trigger`] whenever an object of kind `K` is created, modified, or deleted.
    pub fn watch<K: StoredResource>(&self, namespace: Option<&str>) -> BoxStream<'static, Trigger> {
        watcher(self.api::<K>(namespace), watcher::Config::default())
            .default_backoff()
            .touched_objects()
            .filter_map(|res| async move {
                match res {
                    Ok(obj) => Some(ObjectRef::from_obj(&obj).erase()),
                    Err(error) => {
                        warn!(
                            kind = %K::kind(&()),
                            %error,
                            "Watch failed, will be retried"
                        );
                        None
                    }
                }
            })
            .boxed()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn list<K: StoredResource>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(label_selector) = label_selector {
            params = params.labels(label_selector);
        }
        Ok(self
            .api::<K>(namespace)
            .list(&params)
            .await
            .with_context(|_| ListSnafu {
                kind: K::kind(&()).to_string(),
            })?
            .items)
    }

    async fn get_opt<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<Option<K>> {
        self.api::<K>(Some(namespace))
            .get_opt(name)
            .await
            .with_context(|_| GetSnafu {
                object: object_ref::<K>(name, namespace),
            })
    }

    async fn apply<K: StoredResource>(&self, obj: &K) -> Result<K> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        self.api::<K>(Some(&namespace))
            .patch(
                &name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(obj),
            )
            .await
            .with_context(|_| ApplySnafu {
                object: object_ref::<K>(&name, &namespace),
            })
    }

    async fn apply_status<K, S>(&self, obj: &K, status: &S) -> Result<()>
    where
        K: StoredResource,
        S: Serialize + Debug + Send + Sync,
    {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        self.api::<K>(Some(&namespace))
            .patch_status(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await
            .with_context(|_| PatchStatusSnafu {
                object: object_ref::<K>(&name, &namespace),
            })?;
        Ok(())
    }

    async fn set_finalizers<K: StoredResource>(
        &self,
        obj: &K,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let namespace = namespace_of(obj)?;
        let name = obj.name_any();
        self.api::<K>(Some(&namespace))
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .with_context(|_| PatchFinalizersSnafu {
                object: object_ref::<K>(&name, &namespace),
            })?;
        Ok(())
    }

    async fn delete<K: StoredResource>(&self, name: &str, namespace: &str) -> Result<()> {
        match self
            .api::<K>(Some(namespace))
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(source).with_context(|_| DeleteSnafu {
                object: object_ref::<K>(name, namespace),
            }),
        }
    }
}
