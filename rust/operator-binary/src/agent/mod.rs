//! The certificate agent, which runs in every workload cluster
//!
//! It owns the private keys, publishes CSRs as [`CertificateRequest`]s, writes the signed chains
//! to their target Secrets, and then rolls them out using the [`PodBouncer`].

pub mod state;
pub mod translator;

use std::{mem, sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::{runtime::reflector::ObjectRef, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bounce::PodBouncer,
    crd::{IssuedCertificate, IssuedCertificateState, IssuedCertificateStatus},
    reconciler::{Reconcile, Registration},
    snapshot::{self, sync_statuses, AgentSnapshot, OutputSet},
    store::{self, ObjectStore, Trigger},
    utils::error_full_message,
};

use self::translator::Translator;

/// How long the pod bouncer waits for Pods or trust roots to converge before yielding.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build snapshot"))]
    BuildSnapshot { source: snapshot::Error },

    #[snafu(display("failed to apply output"))]
    ApplyOutput { source: snapshot::Error },

    #[snafu(display("failed to sync IssuedCertificate statuses"))]
    SyncIssuedCertificates { source: snapshot::Error },

    #[snafu(display("failed to sync PodBounceDirective statuses"))]
    SyncPodBounceDirectives { source: snapshot::Error },

    #[snafu(display("failed to update finalizers of {issued_certificate}"))]
    UpdateFinalizers {
        source: store::Error,
        issued_certificate: ObjectRef<IssuedCertificate>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Agent<S> {
    store: Arc<S>,
    registration: Registration,
    settle_delay: Duration,
}

impl<S: ObjectStore> Agent<S> {
    pub fn new(store: Arc<S>, registration: Registration, settle_delay: Duration) -> Self {
        Self {
            store,
            registration,
            settle_delay,
        }
    }

    /// Advances every [`IssuedCertificate`] in `snapshot`, collecting the objects to keep in `output`.
    ///
    /// Statuses are only updated in `snapshot`, nothing but pod deletions is written to the cluster.
    /// Returns whether any certificate is waiting for Pods to converge.
    pub async fn translate(
        &self,
        snapshot: &mut AgentSnapshot,
        output: &mut OutputSet,
        cancel: &CancellationToken,
    ) -> bool {
        let bouncer = PodBouncer::new(&*self.store, self.settle_delay);
        let mut issued_certificates = mem::take(&mut snapshot.issued_certificates);
        let mut waiting = false;
        {
            let mut translator = Translator {
                snapshot: &mut *snapshot,
                output,
                bouncer: &bouncer,
                cancel,
            };
            for issued in &mut issued_certificates {
                let issued_ref = ObjectRef::from_obj(&*issued);
                if issued.metadata.deletion_timestamp.is_some() {
                    debug!(
                        issued_certificate = %issued_ref,
                        "Issued certificate is being deleted, releasing its objects"
                    );
                    continue;
                }
                match translator.translate(issued).await {
                    Ok(wait) => waiting |= wait,
                    Err(err) => {
                        let message = error_full_message(&err);
                        if err.is_internal() {
                            error!(
                                issued_certificate = %issued_ref,
                                error = %message,
                                "Issued certificate is in an impossible state"
                            );
                        } else {
                            warn!(
                                issued_certificate = %issued_ref,
                                error = %message,
                                "Issuing certificate failed"
                            );
                        }
                        translator.keep_target_secret(issued);
                        issued.status = Some(IssuedCertificateStatus {
                            observed_generation: issued.generation(),
                            state: IssuedCertificateState::Failed,
                            error: message,
                        });
                    }
                }
            }
        }
        snapshot.issued_certificates = issued_certificates;
        waiting
    }

    async fn update_finalizers(
        &self,
        finalizer: &str,
        issued_certificates: &[IssuedCertificate],
    ) -> Result<()> {
        for issued in issued_certificates {
            let finalizers = issued.finalizers();
            let has_finalizer = finalizers.iter().any(|f| f == finalizer);
            let deleting = issued.metadata.deletion_timestamp.is_some();
            let desired = match (deleting, has_finalizer) {
                (true, true) => finalizers
                    .iter()
                    .filter(|f| *f != finalizer)
                    .cloned()
                    .collect(),
                (false, false) => {
                    let mut finalizers = finalizers.to_vec();
                    finalizers.push(finalizer.to_string());
                    finalizers
                }
                _ => continue,
            };
            info!(
                issued_certificate = %ObjectRef::from_obj(issued),
                deleting,
                "Updating finalizers"
            );
            self.store
                .set_finalizers(issued, desired)
                .await
                .with_context(|_| UpdateFinalizersSnafu {
                    issued_certificate: ObjectRef::from_obj(issued),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> Reconcile for Agent<S> {
    type Error = Error;

    fn registration(&self) -> &Registration {
        &self.registration
    }

    async fn reconcile(
        &self,
        trigger: Option<&Trigger>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let predicates = &self.registration.predicates;
        let mut snapshot = AgentSnapshot::build(&*self.store, predicates)
            .await
            .context(BuildSnapshotSnafu)?;
        debug!(
            trigger = ?trigger,
            issued_certificates = snapshot.issued_certificates.len(),
            "Reconciling issued certificates"
        );
        let issued_before = snapshot.issued_certificates.clone();
        let directives_before = snapshot.pod_bounce_directives.clone();

        let mut output = OutputSet::default();
        let waiting = self.translate(&mut snapshot, &mut output, cancel).await;
        if cancel.is_cancelled() {
            info!("Pass was cancelled, not writing any changes");
            return Ok(false);
        }

        // Pods are already gone, their record must not depend on the rest of the pass
        sync_statuses(
            &*self.store,
            &directives_before,
            &snapshot.pod_bounce_directives,
        )
        .await
        .context(SyncPodBounceDirectivesSnafu)?;
        output
            .apply(
                &*self.store,
                &self.registration.name,
                predicates.namespace.as_deref(),
            )
            .await
            .context(ApplyOutputSnafu)?;
        sync_statuses(
            &*self.store,
            &issued_before,
            &snapshot.issued_certificates,
        )
        .await
        .context(SyncIssuedCertificatesSnafu)?;
        if let Some(finalizer) = &self.registration.finalizer {
            self.update_finalizers(finalizer, &snapshot.issued_certificates)
                .await?;
        }
        Ok(waiting)
    }
}
