//! The certificate issuer, which signs the [`CertificateRequest`]s of every workload cluster

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{runtime::reflector::ObjectRef, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ca::{self, SigningRequest},
    crd::{
        CertificateRequest, CertificateRequestState, CertificateRequestStatus, IssuedCertificate,
    },
    reconciler::{Reconcile, Registration},
    snapshot::{self, sync_statuses, IssuerSnapshot},
    store::{ObjectStore, Trigger},
    utils::error_full_message,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to reconcile clusters {}", clusters.join(", ")))]
    Clusters { clusters: Vec<String> },
}

#[derive(Debug, Snafu)]
pub enum ClusterError {
    #[snafu(display("failed to build snapshot of cluster {cluster:?}"))]
    BuildSnapshot {
        source: snapshot::Error,
        cluster: String,
    },

    #[snafu(display("failed to sync CertificateRequest statuses of cluster {cluster:?}"))]
    SyncStatus {
        source: snapshot::Error,
        cluster: String,
    },
}

#[derive(Debug, Snafu)]
pub enum SignError {
    #[snafu(display("failed to translate certificate request + issued certificate"))]
    Translate { source: ca::DynError },
}

/// A cluster whose certificate requests are signed by this issuer.
pub struct Cluster<S> {
    pub name: String,
    pub store: Arc<S>,
}

pub struct Issuer<S> {
    registration: Registration,
    clusters: Vec<Cluster<S>>,
    authority: Box<ca::Dynamic>,
}

impl<S: ObjectStore> Issuer<S> {
    pub fn new(
        registration: Registration,
        clusters: Vec<Cluster<S>>,
        authority: Box<ca::Dynamic>,
    ) -> Self {
        Self {
            registration,
            clusters,
            authority,
        }
    }

    async fn reconcile_cluster(
        &self,
        cluster: &Cluster<S>,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        let snapshot = IssuerSnapshot::build(&*cluster.store, &self.registration.predicates)
            .await
            .with_context(|_| BuildSnapshotSnafu {
                cluster: cluster.name.clone(),
            })?;
        let mut requests = snapshot.certificate_requests.clone();
        for request in &mut requests {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.process_request(&cluster.name, request, &snapshot.issued_certificates)
                .await;
        }
        sync_statuses(&*cluster.store, &snapshot.certificate_requests, &requests)
            .await
            .with_context(|_| SyncStatusSnafu {
                cluster: cluster.name.clone(),
            })
    }

    /// Updates the status of `request`, signing it if possible.
    pub async fn process_request(
        &self,
        cluster: &str,
        request: &mut CertificateRequest,
        issued_certificates: &[IssuedCertificate],
    ) {
        let generation = request.generation();
        if request.current_status().is_none() {
            request.status = Some(CertificateRequestStatus {
                observed_generation: generation,
                ..CertificateRequestStatus::default()
            });
        }
        if request.is_signed() {
            return;
        }

        let request_ref = ObjectRef::from_obj(&*request);
        let Some(issued) = issued_certificates.iter().find(|issued| {
            issued.metadata.name == request.metadata.name
                && issued.metadata.namespace == request.metadata.namespace
        }) else {
            debug!(
                cluster,
                request = %request_ref,
                "No matching issued certificate, leaving request pending"
            );
            return;
        };

        let signing_request = SigningRequest {
            hosts: &issued.spec.hosts,
            csr_pem: request.spec.certificate_signing_request.as_bytes(),
            issued_certificate: issued,
            cluster,
        };
        let status = match self
            .authority
            .sign(&signing_request)
            .await
            .context(TranslateSnafu)
        {
            Ok(Some(signed)) => {
                info!(cluster, request = %request_ref, "Certificate request signed");
                CertificateRequestStatus {
                    observed_generation: generation,
                    state: CertificateRequestState::Finished,
                    error: String::new(),
                    signed_certificate: String::from_utf8_lossy(&signed.certificate_pem)
                        .into_owned(),
                    signing_root_ca: String::from_utf8_lossy(&signed.root_ca_pem).into_owned(),
                }
            }
            Ok(None) => CertificateRequestStatus {
                observed_generation: generation,
                ..CertificateRequestStatus::default()
            },
            Err(err) => {
                let error = error_full_message(&err);
                warn!(
                    cluster,
                    request = %request_ref,
                    %error,
                    "Signing certificate request failed"
                );
                CertificateRequestStatus {
                    observed_generation: generation,
                    state: CertificateRequestState::Failed,
                    error,
                    ..CertificateRequestStatus::default()
                }
            }
        };
        request.status = Some(status);
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> Reconcile for Issuer<S> {
    type Error = Error;

    fn registration(&self) -> &Registration {
        &self.registration
    }

    async fn reconcile(
        &self,
        trigger: Option<&Trigger>,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        debug!(?trigger, "Reconciling certificate requests");
        let mut failed = Vec::new();
        for cluster in &self.clusters {
            if let Err(err) = self.reconcile_cluster(cluster, cancel).await {
                warn!(
                    cluster = %cluster.name,
                    error = %error_full_message(&err),
                    "Failed to reconcile cluster"
                );
                failed.push(cluster.name.clone());
            }
        }
        if failed.is_empty() {
            Ok(false)
        } else {
            ClustersSnafu { clusters: failed }.fail()
        }
    }
}
