//! Custom resources exchanged between the certificate agent and the certificate issuer.
//!
//! The agent owns [`IssuedCertificate`] and [`PodBounceDirective`] statuses, the issuer owns
//! [`CertificateRequest`] statuses. The two sides never talk to each other directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_mesh_cert_operator_crd_utils::{ConfigMapReference, SecretReference};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    time::Duration,
};

use crate::material;

mod v1alpha1_impl;

pub const GROUP: &str = "certificates.mesh.stackable.tech";

/// Lifetime of issued certificates, unless overridden by [`CertOptions::ttl`].
pub const DEFAULT_CERT_TTL: Duration = Duration::from_days_unchecked(365);

/// Size of the generated RSA keys, unless overridden by [`CertOptions::rsa_key_size`].
pub const DEFAULT_RSA_KEY_SIZE: u32 = 4096;

/// A certificate that should be issued to a workload identity in this cluster.
///
/// The private key never leaves the cluster: the agent only publishes a [`CertificateRequest`]
/// containing the CSR, and writes the final chain to `issuedCertificateSecret` once it has been signed.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.mesh.stackable.tech",
    version = "v1alpha1",
    kind = "IssuedCertificate",
    derive = "PartialEq",
    namespaced,
    status = "IssuedCertificateStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificateSpec {
    /// DNS names and SPIFFE identities (`spiffe://...`) that the certificate should be valid for.
    pub hosts: Vec<String>,

    /// Organization name written into the certificate subject.
    #[serde(default)]
    pub org: String,

    /// Which authority should sign the certificate.
    ///
    /// Certificates without an authority are left pending until one is configured.
    #[serde(default)]
    pub certificate_authority: Option<CertificateAuthority>,

    /// Where the signed certificate, its chain, and the private key should be written to.
    pub issued_certificate_secret: SecretReference,

    /// Pods that should be restarted once the new certificate has been written.
    #[serde(default)]
    pub pod_bounce_directive: Option<PodBounceDirectiveReference>,

    #[serde(default)]
    pub cert_options: CertOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CertificateAuthority {
    /// Sign with a root certificate and key stored in a Secret in the issuer cluster.
    ///
    /// The Secret must contain `root-cert.pem` and `key.pem`.
    SigningCertificateSecret(SecretReference),

    /// Delegate signing to a [cert-manager](https://cert-manager.io/) issuer in the issuer cluster.
    CertManager(CertManagerIssuer),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerIssuer {
    /// The name of the issuer that should sign the certificate.
    pub name: String,

    /// Whether the issuer is namespaced (`Issuer`) or cluster-global (`ClusterIssuer`).
    pub kind: CertManagerIssuerKind,

    /// The namespace that cert-manager `CertificateRequest` objects are created in.
    pub request_namespace: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, strum::Display)]
pub enum CertManagerIssuerKind {
    Issuer,
    ClusterIssuer,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertOptions {
    /// Size of the generated RSA private key, in bits.
    #[serde(default = "CertOptions::default_rsa_key_size")]
    pub rsa_key_size: u32,

    /// How long the issued certificate should be valid for.
    #[serde(default = "CertOptions::default_ttl")]
    #[schemars(with = "String")]
    pub ttl: Duration,
}

impl CertOptions {
    const fn default_rsa_key_size() -> u32 {
        DEFAULT_RSA_KEY_SIZE
    }

    const fn default_ttl() -> Duration {
        DEFAULT_CERT_TTL
    }
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            rsa_key_size: Self::default_rsa_key_size(),
            ttl: Self::default_ttl(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodBounceDirectiveReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificateStatus {
    /// The `metadata.generation` that `state` refers to.
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub state: IssuedCertificateState,

    /// Why the workflow failed, empty unless `state` is `FAILED`.
    #[serde(default)]
    pub error: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IssuedCertificateState {
    #[default]
    Pending,
    Requested,
    Issued,
    Finished,
    Failed,

    /// Written by something other than this operator.
    #[serde(other)]
    Unknown,
}

/// Carries a certificate signing request from an agent cluster to the issuer.
///
/// Named and namespaced like the [`IssuedCertificate`] it belongs to.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.mesh.stackable.tech",
    version = "v1alpha1",
    kind = "CertificateRequest",
    derive = "PartialEq",
    namespaced,
    status = "CertificateRequestStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 certificate signing request.
    pub certificate_signing_request: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub state: CertificateRequestState,

    #[serde(default)]
    pub error: String,

    /// PEM-encoded certificate, set once `state` is `FINISHED`.
    #[serde(default)]
    pub signed_certificate: String,

    /// PEM-encoded root of the chain that signed `signedCertificate`.
    #[serde(default)]
    pub signing_root_ca: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CertificateRequestState {
    #[default]
    Pending,
    Finished,
    Failed,
}

/// An ordered plan for restarting Pods so that they pick up new trust material.
///
/// Each entry in `podsToBounce` is only ever bounced once, progress is tracked by position in `status.podsBounced`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "certificates.mesh.stackable.tech",
    version = "v1alpha1",
    kind = "PodBounceDirective",
    derive = "PartialEq",
    namespaced,
    status = "PodBounceDirectiveStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct PodBounceDirectiveSpec {
    #[serde(default)]
    pub pods_to_bounce: Vec<PodSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    pub namespace: String,

    /// All of these labels must be present on a Pod for it to be bounced.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// How many replacement Pods must be ready before later selectors are processed.
    #[serde(default)]
    pub wait_for_replicas: u32,

    /// Only bounce once the new root certificate has been propagated.
    #[serde(default)]
    pub root_cert_sync: Option<RootCertSync>,
}

/// Compares the root certificate in a ConfigMap (typically published by the mesh control plane)
/// against the one in the issued Secret.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RootCertSync {
    pub secret_ref: SecretReference,

    #[serde(default = "RootCertSync::default_key")]
    pub secret_key: String,

    pub config_map_ref: ConfigMapReference,

    #[serde(default = "RootCertSync::default_key")]
    pub config_map_key: String,
}

impl RootCertSync {
    fn default_key() -> String {
        material::ROOT_CERT.to_string()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodBounceDirectiveStatus {
    /// One entry per already processed `podsToBounce` position.
    #[serde(default)]
    pub pods_bounced: Vec<BouncedPodSet>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BouncedPodSet {
    #[serde(default)]
    pub bounced_pods: Vec<String>,
}

#[cfg(test)]
mod tests {
    use stackable_mesh_cert_operator_crd_utils::SecretReference;
    use stackable_operator::time::Duration;

    use super::{
        CertManagerIssuerKind, CertOptions, CertificateAuthority, IssuedCertificate,
        IssuedCertificateState, PodBounceDirective, DEFAULT_CERT_TTL,
    };

    #[test]
    fn issued_certificate_defaults() {
        let input = r#"
        apiVersion: certificates.mesh.stackable.tech/v1alpha1
        kind: IssuedCertificate
        metadata:
          name: istio
          namespace: istio-system
        spec:
          hosts:
            - spiffe://cluster.local/ns/istio-system/sa/istiod
          issuedCertificateSecret:
            name: cacerts
            namespace: istio-system
        "#;
        let issued: IssuedCertificate = serde_yaml::from_str(input).unwrap();
        assert_eq!(issued.spec.org, "");
        assert_eq!(issued.spec.certificate_authority, None);
        assert_eq!(issued.spec.pod_bounce_directive, None);
        assert_eq!(issued.spec.cert_options, CertOptions::default());
        assert_eq!(issued.spec.cert_options.ttl, DEFAULT_CERT_TTL);
        assert_eq!(issued.status, None);
    }

    #[test]
    fn issued_certificate_authorities() {
        let input = r#"
        apiVersion: certificates.mesh.stackable.tech/v1alpha1
        kind: IssuedCertificate
        metadata:
          name: istio
          namespace: istio-system
        spec:
          hosts: []
          org: stackable
          certificateAuthority:
            signingCertificateSecret:
              name: root-ca
              namespace: mesh-issuer
          issuedCertificateSecret:
            name: cacerts
            namespace: istio-system
          certOptions:
            rsaKeySize: 2048
            ttl: 30d
        "#;
        let issued: IssuedCertificate = serde_yaml::from_str(input).unwrap();
        assert_eq!(
            issued.spec.certificate_authority,
            Some(CertificateAuthority::SigningCertificateSecret(
                SecretReference::new("root-ca", "mesh-issuer")
            ))
        );
        assert_eq!(issued.spec.cert_options.rsa_key_size, 2048);
        assert_eq!(
            issued.spec.cert_options.ttl,
            Duration::from_days_unchecked(30)
        );

        let input = r#"
        apiVersion: certificates.mesh.stackable.tech/v1alpha1
        kind: IssuedCertificate
        metadata:
          name: istio
          namespace: istio-system
        spec:
          hosts: []
          certificateAuthority:
            certManager:
              name: mesh-ca
              kind: ClusterIssuer
              requestNamespace: mesh-issuer
          issuedCertificateSecret:
            name: cacerts
            namespace: istio-system
        "#;
        let issued: IssuedCertificate = serde_yaml::from_str(input).unwrap();
        match issued.spec.certificate_authority {
            Some(CertificateAuthority::CertManager(issuer)) => {
                assert_eq!(issuer.kind, CertManagerIssuerKind::ClusterIssuer);
                assert_eq!(issuer.kind.to_string(), "ClusterIssuer");
            }
            other => panic!("unexpected authority {other:?}"),
        }
    }

    #[test]
    fn unknown_state_is_preserved_as_unknown() {
        let input = r#"
        apiVersion: certificates.mesh.stackable.tech/v1alpha1
        kind: IssuedCertificate
        metadata:
          name: istio
          namespace: istio-system
          generation: 4
        spec:
          hosts: []
          issuedCertificateSecret:
            name: cacerts
            namespace: istio-system
        status:
          observedGeneration: 4
          state: EXPLODED
        "#;
        let issued: IssuedCertificate = serde_yaml::from_str(input).unwrap();
        let status = issued.status.unwrap();
        assert_eq!(status.state, IssuedCertificateState::Unknown);
        assert_eq!(status.error, "");
    }

    #[test]
    fn pod_bounce_directive_defaults_root_cert_keys() {
        let input = r#"
        apiVersion: certificates.mesh.stackable.tech/v1alpha1
        kind: PodBounceDirective
        metadata:
          name: istio
          namespace: istio-system
        spec:
          podsToBounce:
            - namespace: istio-system
              labels:
                app: istiod
              waitForReplicas: 1
            - namespace: istio-system
              labels:
                app: istio-ingressgateway
              rootCertSync:
                secretRef:
                  name: cacerts
                  namespace: istio-system
                configMapRef:
                  name: istio-ca-root-cert
                  namespace: istio-system
        "#;
        let directive: PodBounceDirective = serde_yaml::from_str(input).unwrap();
        let selectors = &directive.spec.pods_to_bounce;
        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0].wait_for_replicas, 1);
        assert_eq!(selectors[0].root_cert_sync, None);
        let sync = selectors[1].root_cert_sync.as_ref().unwrap();
        assert_eq!(sync.secret_key, "root-cert.pem");
        assert_eq!(sync.config_map_key, "root-cert.pem");
        assert_eq!(selectors[1].wait_for_replicas, 0);
    }
}
