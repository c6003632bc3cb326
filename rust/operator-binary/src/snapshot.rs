//! Point-in-time reads of everything a reconcile pass looks at, and the objects it writes back

use std::{collections::BTreeMap, fmt::Debug};

use serde::Serialize;
use snafu::{ResultExt, Snafu};
use stackable_mesh_cert_operator_crd_utils::SecretReference;
use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret},
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef, ResourceExt},
};
use tracing::{debug, info};

use crate::{
    crd::{
        CertificateRequest, CertificateRequestStatus, IssuedCertificate, IssuedCertificateStatus,
        PodBounceDirective, PodBounceDirectiveStatus,
    },
    store::{self, ObjectStore, StoredResource},
    OWNER_LABEL,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list {kind} objects"))]
    List { source: store::Error, kind: &'static str },

    #[snafu(display("failed to get issued certificate secret {secret}"))]
    GetTarget {
        source: store::Error,
        secret: SecretReference,
    },

    #[snafu(display("failed to apply output"))]
    ApplyOutput { source: store::Error },

    #[snafu(display("failed to list orphaned {kind} objects"))]
    ListOrphans { source: store::Error, kind: &'static str },

    #[snafu(display("failed to delete orphaned {kind} {namespace}/{name}"))]
    DeleteOrphan {
        source: store::Error,
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[snafu(display("failed to sync status"))]
    SyncStatus { source: store::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Restricts which objects a reconciler sees.
#[derive(Debug, Clone, Default)]
pub struct Predicates {
    /// Only consider objects in this namespace, all namespaces if [`None`].
    pub namespace: Option<String>,

    /// Only consider primary objects (such as [`IssuedCertificate`]s) matching this label selector.
    pub label_selector: Option<String>,
}

/// Everything that the certificate agent needs to know about its own cluster.
#[derive(Debug, Clone, Default)]
pub struct AgentSnapshot {
    pub issued_certificates: Vec<IssuedCertificate>,
    pub certificate_requests: Vec<CertificateRequest>,
    pub pod_bounce_directives: Vec<PodBounceDirective>,
    pub secrets: Vec<Secret>,
    pub config_maps: Vec<ConfigMap>,
    pub pods: Vec<Pod>,
}

impl AgentSnapshot {
    pub async fn build(store: &impl ObjectStore, predicates: &Predicates) -> Result<Self> {
        let namespace = predicates.namespace.as_deref();
        let labels = predicates.label_selector.as_deref();
        let mut snapshot = Self {
            issued_certificates: list(store, namespace, labels, "IssuedCertificate").await?,
            certificate_requests: list(store, namespace, None, "CertificateRequest").await?,
            pod_bounce_directives: list(store, namespace, None, "PodBounceDirective").await?,
            secrets: list(store, namespace, None, "Secret").await?,
            config_maps: list(store, namespace, None, "ConfigMap").await?,
            pods: list(store, namespace, None, "Pod").await?,
        };
        if let Some(namespace) = namespace {
            snapshot.get_foreign_targets(store, namespace).await?;
        }
        Ok(snapshot)
    }

    /// Issued Secrets may be written outside of the watched namespace, and would otherwise
    /// never be seen again.
    async fn get_foreign_targets(
        &mut self,
        store: &impl ObjectStore,
        namespace: &str,
    ) -> Result<()> {
        let mut targets: Vec<&SecretReference> = Vec::new();
        for issued in &self.issued_certificates {
            let target = &issued.spec.issued_certificate_secret;
            if target.namespace != namespace && !targets.contains(&target) {
                targets.push(target);
            }
        }
        let mut found = Vec::new();
        for target in targets {
            let secret = store
                .get_opt::<Secret>(&target.name, &target.namespace)
                .await
                .with_context(|_| GetTargetSnafu {
                    secret: target.clone(),
                })?;
            if let Some(secret) = secret {
                debug!(
                    secret = %target,
                    "Found issued certificate secret outside of watched namespace"
                );
                found.push(secret);
            }
        }
        self.secrets.extend(found);
        Ok(())
    }
}

/// What the certificate issuer sees of one (possibly remote) cluster.
#[derive(Debug, Clone, Default)]
pub struct IssuerSnapshot {
    pub certificate_requests: Vec<CertificateRequest>,
    pub issued_certificates: Vec<IssuedCertificate>,
}

impl IssuerSnapshot {
    pub async fn build(store: &impl ObjectStore, predicates: &Predicates) -> Result<Self> {
        let namespace = predicates.namespace.as_deref();
        Ok(Self {
            certificate_requests: list(store, namespace, None, "CertificateRequest").await?,
            issued_certificates: list(
                store,
                namespace,
                predicates.label_selector.as_deref(),
                "IssuedCertificate",
            )
            .await?,
        })
    }
}

async fn list<K: StoredResource>(
    store: &impl ObjectStore,
    namespace: Option<&str>,
    label_selector: Option<&str>,
    kind: &'static str,
) -> Result<Vec<K>> {
    store
        .list(namespace, label_selector)
        .await
        .context(ListSnafu { kind })
}

type ObjectKey = (String, String);

fn object_key(meta: &ObjectMeta) -> ObjectKey {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// The objects that should exist once a pass has been applied.
///
/// Owned objects that are not part of the output are garbage collected, so every pass
/// must re-add the objects that it still needs.
#[derive(Debug, Default)]
pub struct OutputSet {
    secrets: BTreeMap<ObjectKey, Secret>,
    certificate_requests: BTreeMap<ObjectKey, CertificateRequest>,
}

impl OutputSet {
    pub fn add_secret(&mut self, secret: Secret) {
        self.secrets.insert(object_key(&secret.metadata), secret);
    }

    pub fn add_certificate_request(&mut self, request: CertificateRequest) {
        self.certificate_requests
            .insert(object_key(&request.metadata), request);
    }

    /// Keeps an existing [`Secret`] exactly as it is.
    pub fn keep_secret(&mut self, secret: &Secret) {
        self.add_secret(Secret {
            metadata: desired_meta(&secret.metadata),
            data: secret.data.clone(),
            type_: secret.type_.clone(),
            ..Secret::default()
        });
    }

    /// Keeps an existing [`CertificateRequest`] without touching its status.
    pub fn keep_certificate_request(&mut self, request: &CertificateRequest) {
        self.add_certificate_request(CertificateRequest {
            metadata: desired_meta(&request.metadata),
            spec: request.spec.clone(),
            status: None,
        });
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
    }

    pub fn certificate_request(&self, namespace: &str, name: &str) -> Option<&CertificateRequest> {
        self.certificate_requests
            .get(&(namespace.to_string(), name.to_string()))
    }

    pub fn secrets(&self) -> impl Iterator<Item = &Secret> {
        self.secrets.values()
    }

    pub fn certificate_requests(&self) -> impl Iterator<Item = &CertificateRequest> {
        self.certificate_requests.values()
    }

    /// Applies every object (labelled as owned by `owner`), then deletes owned objects that
    /// are no longer part of the output.
    pub async fn apply(
        self,
        store: &impl ObjectStore,
        owner: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        let secrets = apply_owned(store, self.secrets, owner).await?;
        let requests = apply_owned(store, self.certificate_requests, owner).await?;
        collect_orphans::<Secret>(store, &secrets, owner, namespace, "Secret").await?;
        collect_orphans::<CertificateRequest>(
            store,
            &requests,
            owner,
            namespace,
            "CertificateRequest",
        )
        .await?;
        Ok(())
    }
}

fn desired_meta(meta: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone(),
        namespace: meta.namespace.clone(),
        labels: meta.labels.clone(),
        annotations: meta.annotations.clone(),
        ..ObjectMeta::default()
    }
}

async fn apply_owned<K: StoredResource>(
    store: &impl ObjectStore,
    objects: BTreeMap<ObjectKey, K>,
    owner: &str,
) -> Result<Vec<ObjectKey>> {
    let mut keys = Vec::with_capacity(objects.len());
    for (key, mut obj) in objects {
        obj.labels_mut()
            .insert(OWNER_LABEL.to_string(), owner.to_string());
        store.apply(&obj).await.context(ApplyOutputSnafu)?;
        keys.push(key);
    }
    Ok(keys)
}

async fn collect_orphans<K: StoredResource>(
    store: &impl ObjectStore,
    keep: &[ObjectKey],
    owner: &str,
    namespace: Option<&str>,
    kind: &'static str,
) -> Result<()> {
    let selector = format!("{OWNER_LABEL}={owner}");
    let owned: Vec<K> = store
        .list(namespace, Some(&selector))
        .await
        .context(ListOrphansSnafu { kind })?;
    for obj in owned {
        let key = object_key(obj.meta());
        if keep.contains(&key) {
            continue;
        }
        let (namespace, name) = key;
        info!(kind, %namespace, %name, "Deleting orphaned object");
        store
            .delete::<K>(&name, &namespace)
            .await
            .with_context(|_| DeleteOrphanSnafu {
                kind,
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
    }
    Ok(())
}

/// An object whose status is written by the reconcilers.
pub trait Reported: StoredResource {
    type Status: Serialize + Debug + PartialEq + Send + Sync;

    fn reported(&self) -> Option<&Self::Status>;
}

impl Reported for IssuedCertificate {
    type Status = IssuedCertificateStatus;

    fn reported(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl Reported for CertificateRequest {
    type Status = CertificateRequestStatus;

    fn reported(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

impl Reported for PodBounceDirective {
    type Status = PodBounceDirectiveStatus;

    fn reported(&self) -> Option<&Self::Status> {
        self.status.as_ref()
    }
}

/// Writes back the statuses in `after` that differ from their counterparts in `before`.
pub async fn sync_statuses<K: Reported>(
    store: &impl ObjectStore,
    before: &[K],
    after: &[K],
) -> Result<()> {
    for obj in after {
        let previous = before
            .iter()
            .find(|candidate| object_key(candidate.meta()) == object_key(obj.meta()));
        let Some(status) = obj.reported() else {
            continue;
        };
        if previous.and_then(Reported::reported) == Some(status) {
            continue;
        }
        debug!(
            object = %ObjectRef::from_obj(obj),
            ?status,
            "Updating status"
        );
        store
            .apply_status(obj, status)
            .await
            .context(SyncStatusSnafu)?;
    }
    Ok(())
}
