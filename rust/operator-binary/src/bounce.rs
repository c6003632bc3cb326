//! Restarts Pods in stages, so that they pick up new trust material without taking the mesh down

use std::time::Duration;

use snafu::Snafu;
use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret},
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    crd::{BouncedPodSet, PodBounceDirective, PodSelector, RootCertSync},
    store::{self, ObjectStore},
    utils::error_full_message,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "failed to delete {} pod(s): {}",
        errors.len(),
        errors.iter().map(|err| error_full_message(err)).collect::<Vec<_>>().join("; ")
    ))]
    DeletePods { errors: Vec<store::Error> },

    #[snafu(display("bouncing pods was cancelled"))]
    Cancelled,
}
type Result<T, E = Error> = std::result::Result<T, E>;

pub struct PodBouncer<'a, S> {
    store: &'a S,
    settle_delay: Duration,
}

impl<'a, S: ObjectStore> PodBouncer<'a, S> {
    /// `settle_delay` is how long to wait for external convergence before giving up for this pass.
    pub fn new(store: &'a S, settle_delay: Duration) -> Self {
        Self {
            store,
            settle_delay,
        }
    }

    /// Works through `directive` in order, recording progress in its status.
    ///
    /// Returns `true` if the caller should come back later because an earlier stage has not
    /// converged yet, and `false` once every stage is done.
    pub async fn bounce_pods(
        &self,
        directive: &mut PodBounceDirective,
        pods: &[Pod],
        config_maps: &[ConfigMap],
        secrets: &[Secret],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let directive_ref = ObjectRef::from_obj(&*directive);
        let status = directive.status.get_or_insert_with(Default::default);
        for (position, selector) in directive.spec.pods_to_bounce.iter().enumerate() {
            if let Some(bounced) = status.pods_bounced.get(position) {
                let ready = ready_replicas(selector, pods, &bounced.bounced_pods);
                if ready < selector.wait_for_replicas as usize {
                    info!(
                        directive = %directive_ref,
                        position,
                        ready,
                        wait_for = selector.wait_for_replicas,
                        "Waiting for replacement pods to become ready"
                    );
                    self.settle(cancel).await;
                    return Ok(true);
                }
                continue;
            }

            if let Some(sync) = &selector.root_cert_sync {
                if !root_cert_synced(sync, config_maps, secrets) {
                    info!(
                        directive = %directive_ref,
                        position,
                        config_map = %sync.config_map_ref,
                        "Waiting for root certificate to propagate"
                    );
                    self.settle(cancel).await;
                    return Ok(true);
                }
            }

            let mut bounced = BouncedPodSet::default();
            let mut errors = Vec::new();
            let mut cancelled = false;
            for pod in pods.iter().filter(|pod| selector_matches(selector, pod)) {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let name = pod.name_any();
                match self.store.delete::<Pod>(&name, &selector.namespace).await {
                    Ok(()) => {
                        info!(
                            directive = %directive_ref,
                            position,
                            pod = %ObjectRef::from_obj(pod),
                            "Bounced pod"
                        );
                        bounced.bounced_pods.push(name);
                    }
                    Err(error) => {
                        warn!(
                            directive = %directive_ref,
                            position,
                            pod = %ObjectRef::from_obj(pod),
                            error = %error_full_message(&error),
                            "Failed to bounce pod"
                        );
                        errors.push(error);
                    }
                }
            }
            // Deletions can't be rolled back, so partial progress is recorded too
            status.pods_bounced.push(bounced);
            if cancelled {
                return CancelledSnafu.fail();
            }
            if !errors.is_empty() {
                return DeletePodsSnafu { errors }.fail();
            }
            if selector.wait_for_replicas > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn settle(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.settle_delay) => {}
        }
    }
}

fn selector_matches(selector: &PodSelector, pod: &Pod) -> bool {
    pod.metadata.namespace.as_deref() == Some(selector.namespace.as_str())
        && selector
            .labels
            .iter()
            .all(|(key, value)| pod.labels().get(key) == Some(value))
}

fn is_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|cond| cond.type_ == "Ready" && cond.status == "True")
            })
}

/// Counts the ready Pods that replaced the ones in `bounced`.
///
/// Pods that were bounced but still show up (because the snapshot predates their deletion)
/// are not replacements, and never count as ready.
fn ready_replicas(selector: &PodSelector, pods: &[Pod], bounced: &[String]) -> usize {
    pods.iter()
        .filter(|pod| selector_matches(selector, pod))
        .filter(|pod| !bounced.contains(&pod.name_any()))
        .filter(|pod| is_ready(pod))
        .count()
}

fn root_cert_synced(sync: &RootCertSync, config_maps: &[ConfigMap], secrets: &[Secret]) -> bool {
    let Some(config_map) = sync.config_map_ref.find_in(config_maps) else {
        return false;
    };
    let published = config_map
        .data
        .as_ref()
        .and_then(|data| data.get(&sync.config_map_key))
        .map(|value| value.as_bytes())
        .or_else(|| {
            config_map
                .binary_data
                .as_ref()
                .and_then(|data| data.get(&sync.config_map_key))
                .map(|value| value.0.as_slice())
        });
    let expected = sync.secret_ref.lookup(secrets, &sync.secret_key);
    matches!((published, expected), (Some(published), Some(expected)) if published == expected)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use stackable_mesh_cert_operator_crd_utils::{ConfigMapReference, SecretReference};
    use stackable_operator::{
        k8s_openapi::{
            api::core::v1::{ConfigMap, Pod, PodCondition, PodStatus, Secret},
            ByteString,
        },
        kube::api::ObjectMeta,
    };
    use tokio_util::sync::CancellationToken;

    use super::{Error, PodBouncer};
    use crate::{
        crd::{
            BouncedPodSet, PodBounceDirective, PodBounceDirectiveSpec, PodBounceDirectiveStatus,
            PodSelector, RootCertSync,
        },
        store::memory::MemoryStore,
    };

    fn pod(name: &str, app: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("gloo-system".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    fn selector(app: &str, wait_for_replicas: u32) -> PodSelector {
        PodSelector {
            namespace: "gloo-system".to_string(),
            labels: BTreeMap::from([("app".to_string(), app.to_string())]),
            wait_for_replicas,
            root_cert_sync: None,
        }
    }

    fn directive(selectors: Vec<PodSelector>, bounced: Vec<Vec<&str>>) -> PodBounceDirective {
        let mut directive =
            PodBounceDirective::new("gloo", PodBounceDirectiveSpec { pods_to_bounce: selectors });
        directive.metadata.namespace = Some("gloo-system".to_string());
        directive.status = Some(PodBounceDirectiveStatus {
            pods_bounced: bounced
                .into_iter()
                .map(|pods| BouncedPodSet {
                    bounced_pods: pods.into_iter().map(String::from).collect(),
                })
                .collect(),
        });
        directive
    }

    fn store_with(pods: &[Pod]) -> MemoryStore {
        let store = MemoryStore::default();
        for pod in pods {
            store.insert(pod);
        }
        store
    }

    fn bounced(directive: &PodBounceDirective) -> Vec<Vec<String>> {
        directive
            .status
            .as_ref()
            .unwrap()
            .pods_bounced
            .iter()
            .map(|set| set.bounced_pods.clone())
            .collect()
    }

    #[tokio::test]
    async fn waits_until_bounced_pods_are_replaced() {
        let pods = [pod("pod1", "gloo", false), pod("pod2", "other", true)];
        let store = store_with(&pods);
        let mut directive = directive(vec![selector("gloo", 1)], vec![vec!["pod1"]]);
        let bouncer = PodBouncer::new(&store, Duration::ZERO);

        let wait = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(wait);
        assert!(store.deleted::<Pod>().is_empty());
    }

    #[tokio::test]
    async fn bounced_pods_are_never_deleted_again() {
        let pods = [pod("pod1", "gloo", true), pod("pod3", "gloo", true)];
        let store = store_with(&pods);
        let mut directive = directive(vec![selector("gloo", 1)], vec![vec!["pod1"]]);
        let bouncer = PodBouncer::new(&store, Duration::ZERO);

        let wait = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap();

        assert!(!wait);
        assert!(store.deleted::<Pod>().is_empty());
        assert_eq!(bounced(&directive), vec![vec!["pod1".to_string()]]);
    }

    #[tokio::test]
    async fn later_stages_wait_for_earlier_ones() {
        let pods = [
            pod("istiod-1", "istiod", true),
            pod("gateway-1", "gateway", true),
        ];
        let store = store_with(&pods);
        let mut directive = directive(
            vec![selector("istiod", 1), selector("gateway", 0)],
            vec![],
        );
        let bouncer = PodBouncer::new(&store, Duration::ZERO);

        let wait = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(wait);
        assert_eq!(store.deleted::<Pod>(), vec!["istiod-1".to_string()]);
        assert_eq!(bounced(&directive), vec![vec!["istiod-1".to_string()]]);

        // the old pod is still visible, its replacement is not ready yet
        let pods = [
            pod("istiod-1", "istiod", true),
            pod("istiod-2", "istiod", false),
            pod("gateway-1", "gateway", true),
        ];
        let wait = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(wait);
        assert_eq!(store.deleted::<Pod>(), vec!["istiod-1".to_string()]);

        let pods = [
            pod("istiod-2", "istiod", true),
            pod("gateway-1", "gateway", true),
        ];
        let wait = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(!wait);
        assert_eq!(
            store.deleted::<Pod>(),
            vec!["istiod-1".to_string(), "gateway-1".to_string()]
        );
        assert_eq!(
            bounced(&directive),
            vec![vec!["istiod-1".to_string()], vec!["gateway-1".to_string()]]
        );
    }

    #[tokio::test]
    async fn waits_for_root_cert_propagation() {
        let pods = [pod("gateway-1", "gateway", true)];
        let store = store_with(&pods);
        let mut gateway = selector("gateway", 0);
        gateway.root_cert_sync = Some(RootCertSync {
            secret_ref: SecretReference::new("cacerts", "gloo-system"),
            secret_key: "root-cert.pem".to_string(),
            config_map_ref: ConfigMapReference::new("root-cert", "gloo-system"),
            config_map_key: "root-cert.pem".to_string(),
        });
        let mut directive = directive(vec![gateway], vec![]);
        let secrets = [Secret {
            metadata: ObjectMeta {
                name: Some("cacerts".to_string()),
                namespace: Some("gloo-system".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "root-cert.pem".to_string(),
                ByteString(b"new root".to_vec()),
            )])),
            ..Secret::default()
        }];
        let config_map = |root: &str| ConfigMap {
            metadata: ObjectMeta {
                name: Some("root-cert".to_string()),
                namespace: Some("gloo-system".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "root-cert.pem".to_string(),
                root.to_string(),
            )])),
            ..ConfigMap::default()
        };
        let bouncer = PodBouncer::new(&store, Duration::ZERO);
        let cancel = CancellationToken::new();

        for config_maps in [vec![], vec![config_map("old root")]] {
            let wait = bouncer
                .bounce_pods(&mut directive, &pods, &config_maps, &secrets, &cancel)
                .await
                .unwrap();
            assert!(wait);
            assert!(store.deleted::<Pod>().is_empty());
        }

        let wait = bouncer
            .bounce_pods(
                &mut directive,
                &pods,
                &[config_map("new root")],
                &secrets,
                &cancel,
            )
            .await
            .unwrap();
        assert!(!wait);
        assert_eq!(store.deleted::<Pod>(), vec!["gateway-1".to_string()]);
    }

    #[tokio::test]
    async fn deletion_errors_are_accumulated() {
        let pods = [
            pod("gloo-1", "gloo", true),
            pod("gloo-2", "gloo", true),
            pod("gloo-3", "gloo", true),
        ];
        let store = store_with(&pods);
        store.fail_deletes_of("gloo-1");
        store.fail_deletes_of("gloo-3");
        let mut directive = directive(vec![selector("gloo", 0)], vec![]);
        let bouncer = PodBouncer::new(&store, Duration::ZERO);

        let err = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::DeletePods { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.deleted::<Pod>(), vec!["gloo-2".to_string()]);
        assert_eq!(bounced(&directive), vec![vec!["gloo-2".to_string()]]);
    }

    #[tokio::test]
    async fn cancellation_stops_deleting() {
        let pods = [pod("gloo-1", "gloo", true), pod("gloo-2", "gloo", true)];
        let store = store_with(&pods);
        let mut directive = directive(vec![selector("gloo", 0)], vec![]);
        let bouncer = PodBouncer::new(&store, Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bouncer
            .bounce_pods(&mut directive, &pods, &[], &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled), "{err:?}");
        assert!(store.deleted::<Pod>().is_empty());
    }
}
