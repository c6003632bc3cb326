use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Context as _;
use clap::{crate_description, crate_version, Parser};
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use stackable_mesh_cert_operator::{
    agent::{Agent, DEFAULT_SETTLE_DELAY},
    ca::{self, CertManagerAuthority, LocalAuthority},
    crd::{CertificateRequest, IssuedCertificate, PodBounceDirective},
    issuer::{Cluster, Issuer},
    reconciler::{self, Registration, DEFAULT_MIN_INTERVAL, DEFAULT_POLL_INTERVAL},
    snapshot::Predicates,
    store::{KubeStore, Trigger},
    CLEANUP_FINALIZER, FIELD_MANAGER, OPERATOR_NAME,
};
use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret},
    logging::TracingTarget,
    time::Duration,
    CustomResourceExt,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const APP_NAME: &str = "mesh-cert";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<MeshCertOperatorRun>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum Role {
    /// Issue certificates for this cluster and roll them out.
    Agent,
    /// Sign the certificate requests of every configured cluster.
    Issuer,
}

#[derive(clap::Parser)]
struct MeshCertOperatorRun {
    #[arg(value_enum, env)]
    role: Role,

    /// Name of the local cluster, as reported to signing authorities
    #[arg(long, env, default_value = "local")]
    cluster_name: String,

    /// Only consider objects in this namespace, instead of the whole cluster
    #[arg(long, env)]
    watch_namespace: Option<String>,

    /// Only consider IssuedCertificates matching this label selector
    #[arg(long, env)]
    label_selector: Option<String>,

    /// Run a full pass at least this often, even if nothing has changed
    #[arg(long, env, default_value_t = DEFAULT_POLL_INTERVAL.into())]
    poll_interval: Duration,

    /// Minimum time between two passes
    #[arg(long, env, default_value_t = DEFAULT_MIN_INTERVAL.into())]
    min_interval: Duration,

    /// How long to wait for bounced Pods to come back before checking again
    #[arg(long, env, default_value_t = DEFAULT_SETTLE_DELAY.into())]
    bounce_wait: Duration,

    /// Additional clusters to sign requests for, as NAME=KUBECONFIG_PATH
    #[arg(long, env, value_delimiter = ',')]
    remote_cluster: Vec<RemoteCluster>,

    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

#[derive(Clone, Debug)]
struct RemoteCluster {
    name: String,
    kubeconfig: PathBuf,
}

impl FromStr for RemoteCluster {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, kubeconfig)) if !name.is_empty() && !kubeconfig.is_empty() => Ok(Self {
                name: name.to_string(),
                kubeconfig: kubeconfig.into(),
            }),
            _ => Err(format!("expected NAME=KUBECONFIG_PATH, got {s:?}")),
        }
    }
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            IssuedCertificate::print_yaml_schema()?;
            CertificateRequest::print_yaml_schema()?;
            PodBounceDirective::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(run) => {
            stackable_operator::logging::initialize_logging(
                "MESH_CERT_OPERATOR_LOG",
                APP_NAME,
                run.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET,
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );

            let cancel = CancellationToken::new();
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    sigterm.recv().await;
                    info!("Received SIGTERM, shutting down");
                    cancel.cancel();
                }
            });

            let client = stackable_operator::client::create_client(Some(OPERATOR_NAME.to_string()))
                .await?;
            let local = Arc::new(KubeStore::new(client.as_kube_client(), FIELD_MANAGER));
            let mut registration = Registration::new(format!("{APP_NAME}-{}", run.role));
            registration.poll_interval = *run.poll_interval;
            registration.min_interval = *run.min_interval;
            registration.predicates = Predicates {
                namespace: run.watch_namespace.clone(),
                label_selector: run.label_selector.clone(),
            };
            let namespace = run.watch_namespace.as_deref();

            match run.role {
                Role::Agent => {
                    registration.finalizer = Some(CLEANUP_FINALIZER.to_string());
                    let triggers = agent_triggers(&local, namespace);
                    let agent = Agent::new(local, registration, *run.bounce_wait);
                    reconciler::run(agent, triggers, cancel).await;
                }
                Role::Issuer => {
                    let authority = ca::from(ca::Chain(vec![
                        ca::from(LocalAuthority::new(local.clone())),
                        ca::from(CertManagerAuthority::new(local.clone())),
                    ]));
                    let mut clusters = vec![Cluster {
                        name: run.cluster_name.clone(),
                        store: local,
                    }];
                    for remote in &run.remote_cluster {
                        let store = KubeStore::from_kubeconfig(&remote.kubeconfig, FIELD_MANAGER)
                            .await
                            .with_context(|| format!("failed to connect to cluster {}", remote.name))?;
                        clusters.push(Cluster {
                            name: remote.name.clone(),
                            store: Arc::new(store),
                        });
                    }
                    let triggers = stream::select_all(clusters.iter().flat_map(|cluster| {
                        [
                            cluster.store.watch::<CertificateRequest>(namespace),
                            cluster.store.watch::<IssuedCertificate>(namespace),
                        ]
                    }))
                    .boxed();
                    info!(
                        clusters = ?clusters.iter().map(|cluster| &cluster.name).collect::<Vec<_>>(),
                        "Starting issuer"
                    );
                    let issuer = Issuer::new(registration, clusters, authority);
                    reconciler::run(issuer, triggers, cancel).await;
                }
            }
        }
    }
    Ok(())
}

fn agent_triggers(store: &KubeStore, namespace: Option<&str>) -> BoxStream<'static, Trigger> {
    stream::select_all([
        store.watch::<IssuedCertificate>(namespace),
        store.watch::<CertificateRequest>(namespace),
        store.watch::<PodBounceDirective>(namespace),
        store.watch::<Secret>(namespace),
        store.watch::<ConfigMap>(namespace),
        store.watch::<Pod>(namespace),
    ])
    .boxed()
}
