//! Signs certificates with a root certificate and key that are stored in a Secret of the issuer cluster

use std::sync::Arc;

use async_trait::async_trait;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::{BigNum, MsbOption},
    conf::{Conf, ConfMethod},
    hash::MessageDigest,
    pkey::PKey,
    x509::{
        extension::{
            AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectAlternativeName,
            SubjectKeyIdentifier,
        },
        X509Builder, X509Req, X509,
    },
};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_mesh_cert_operator_crd_utils::SecretReference;
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef, time::Duration,
};
use time::OffsetDateTime;
use tracing::info;

use super::{SignedCertificate, SigningAuthority, SigningRequest};
use crate::{
    crd::CertificateAuthority,
    material::{FromDataError, RootCaData},
    store::{self, ObjectStore},
};

const SPIFFE_SCHEME: &str = "spiffe://";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load signing CA {secret}"))]
    FindCa {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("signing CA {secret} does not exist"))]
    CaNotFound { secret: ObjectRef<Secret> },

    #[snafu(display("signing CA {secret} is invalid"))]
    InvalidCa {
        source: FromDataError,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load certificate of signing CA {secret}"))]
    LoadCertificate {
        source: openssl::error::ErrorStack,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to load private key of signing CA {secret}"))]
    LoadKey {
        source: openssl::error::ErrorStack,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to parse certificate signing request"))]
    ParseCsr { source: openssl::error::ErrorStack },

    #[snafu(display("certificate signing request is not signed by its own key"))]
    CsrSignatureInvalid,

    #[snafu(display("certificate lifetime {ttl} is out of range"))]
    TtlOutOfRange { ttl: Duration },

    #[snafu(display("failed to build certificate"))]
    BuildCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: openssl::error::ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Handles [`CertificateAuthority::SigningCertificateSecret`].
pub struct LocalAuthority<S> {
    store: Arc<S>,
}

impl<S> LocalAuthority<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> SigningAuthority for LocalAuthority<S> {
    type Error = Error;

    async fn sign(&self, request: &SigningRequest<'_>) -> Result<Option<SignedCertificate>> {
        let Some(CertificateAuthority::SigningCertificateSecret(ca_ref)) =
            &request.issued_certificate.spec.certificate_authority
        else {
            return Ok(None);
        };
        let secret = ObjectRef::<Secret>::from(ca_ref);
        let ca_secret = self
            .store
            .get_opt::<Secret>(&ca_ref.name, &ca_ref.namespace)
            .await
            .context(FindCaSnafu {
                secret: secret.clone(),
            })?
            .context(CaNotFoundSnafu {
                secret: secret.clone(),
            })?;
        let ttl = request.issued_certificate.spec.cert_options.ttl;
        let signed = sign_csr(ca_ref, &ca_secret, request.hosts, request.csr_pem, ttl)?;
        info!(
            ca = %secret,
            cluster = request.cluster,
            "Signed certificate request"
        );
        Ok(Some(signed))
    }
}

/// Issues an intermediate CA certificate for the key in `csr_pem`.
pub fn sign_csr(
    ca_ref: &SecretReference,
    ca_secret: &Secret,
    hosts: &[String],
    csr_pem: &[u8],
    ttl: Duration,
) -> Result<SignedCertificate> {
    let secret = || ObjectRef::<Secret>::from(ca_ref);
    let data = ca_secret.data.clone().unwrap_or_default();
    let ca = RootCaData::from_data(&data).with_context(|_| InvalidCaSnafu { secret: secret() })?;
    let root_cert =
        X509::from_pem(ca.root_cert).with_context(|_| LoadCertificateSnafu { secret: secret() })?;
    let root_key = PKey::private_key_from_pem(ca.key)
        .with_context(|_| LoadKeySnafu { secret: secret() })?;

    let csr = X509Req::from_pem(csr_pem).context(ParseCsrSnafu)?;
    let csr_key = csr.public_key().context(ParseCsrSnafu)?;
    ensure!(
        csr.verify(&csr_key).context(ParseCsrSnafu)?,
        CsrSignatureInvalidSnafu
    );

    let now = OffsetDateTime::now_utc();
    let not_before = now - Duration::from_minutes_unchecked(5);
    let not_after = time::Duration::try_from(*ttl)
        .ok()
        .and_then(|ttl| now.checked_add(ttl))
        .context(TtlOutOfRangeSnafu { ttl })?;
    let conf = Conf::new(ConfMethod::default()).context(BuildCertificateSnafu)?;
    let cert = X509Builder::new()
        .and_then(|mut x509| {
            x509.set_subject_name(csr.subject_name())?;
            x509.set_issuer_name(root_cert.subject_name())?;
            x509.set_not_before(Asn1Time::from_unix(not_before.unix_timestamp())?.as_ref())?;
            x509.set_not_after(Asn1Time::from_unix(not_after.unix_timestamp())?.as_ref())?;
            x509.set_pubkey(&csr_key)?;
            x509.set_version(
                3 - 1, // zero-indexed
            )?;
            let mut serial = BigNum::new()?;
            serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
            x509.set_serial_number(Asn1Integer::from_bn(&serial)?.as_ref())?;
            let ctx = x509.x509v3_context(Some(&root_cert), Some(&conf));
            let mut exts = vec![
                BasicConstraints::new().critical().ca().build()?,
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
                SubjectKeyIdentifier::new().build(&ctx)?,
                AuthorityKeyIdentifier::new()
                    .issuer(true)
                    .keyid(true)
                    .build(&ctx)?,
            ];
            if !hosts.is_empty() {
                let mut san_ext = SubjectAlternativeName::new();
                for host in hosts {
                    if host.starts_with(SPIFFE_SCHEME) {
                        san_ext.uri(host);
                    } else {
                        san_ext.dns(host);
                    }
                }
                exts.push(san_ext.build(&ctx)?);
            }
            for ext in exts {
                x509.append_extension(ext)?;
            }
            x509.sign(&root_key, MessageDigest::sha256())?;
            Ok(x509)
        })
        .context(BuildCertificateSnafu)?
        .build();
    Ok(SignedCertificate {
        certificate_pem: cert.to_pem().context(SerializeCertificateSnafu)?,
        root_ca_pem: root_cert.to_pem().context(SerializeCertificateSnafu)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use openssl::{nid::Nid, pkey::PKey, rsa::Rsa, x509::X509};
    use stackable_mesh_cert_operator_crd_utils::SecretReference;
    use stackable_operator::time::Duration;

    use super::{sign_csr, Error, LocalAuthority};
    use crate::{
        agent::translator::build_csr,
        ca::{
            testing::{root_ca, root_ca_secret},
            SigningAuthority, SigningRequest,
        },
        crd::{CertificateAuthority, IssuedCertificate, IssuedCertificateSpec},
        store::memory::MemoryStore,
    };

    fn issued(authority: Option<CertificateAuthority>) -> IssuedCertificate {
        IssuedCertificate::new(
            "istio",
            IssuedCertificateSpec {
                hosts: vec!["spiffe://cluster.local/ns/istio-system/sa/istiod".to_string()],
                org: "stackable".to_string(),
                certificate_authority: authority,
                issued_certificate_secret: SecretReference::new("cacerts", "istio-system"),
                pod_bounce_directive: None,
                cert_options: Default::default(),
            },
        )
    }

    #[test]
    fn signs_intermediate_ca() {
        let root = root_ca();
        let ca_ref = SecretReference::new("root-ca", "mesh-issuer");
        let ca_secret = root_ca_secret("root-ca", "mesh-issuer", &root);
        let key = PKey::try_from(Rsa::generate(2048).unwrap()).unwrap();
        let hosts = vec![
            "spiffe://cluster.local/ns/istio-system/sa/istiod".to_string(),
            "istiod.istio-system.svc".to_string(),
        ];
        let csr = build_csr(&key, &hosts, "stackable").unwrap();

        let signed = sign_csr(
            &ca_ref,
            &ca_secret,
            &hosts,
            &csr.to_pem().unwrap(),
            Duration::from_days_unchecked(30),
        )
        .unwrap();

        let cert = X509::from_pem(&signed.certificate_pem).unwrap();
        assert!(cert.verify(&root.1).unwrap());
        assert!(cert.public_key().unwrap().public_eq(&key));
        assert_eq!(signed.root_ca_pem, root.0.to_pem().unwrap());
        let org = cert
            .subject_name()
            .entries_by_nid(Nid::ORGANIZATIONNAME)
            .next()
            .unwrap();
        assert_eq!(org.data().as_slice(), b"stackable");
        let sans = cert.subject_alt_names().unwrap();
        assert_eq!(
            sans.iter().filter_map(|san| san.uri()).collect::<Vec<_>>(),
            vec!["spiffe://cluster.local/ns/istio-system/sa/istiod"]
        );
        assert_eq!(
            sans.iter().filter_map(|san| san.dnsname()).collect::<Vec<_>>(),
            vec!["istiod.istio-system.svc"]
        );
    }

    #[test]
    fn rejects_tampered_csr() {
        let root = root_ca();
        let ca_ref = SecretReference::new("root-ca", "mesh-issuer");
        let ca_secret = root_ca_secret("root-ca", "mesh-issuer", &root);
        let err = sign_csr(
            &ca_ref,
            &ca_secret,
            &[],
            b"not a csr",
            Duration::from_days_unchecked(1),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "failed to parse certificate signing request");
    }

    #[test]
    fn rejects_unrepresentable_lifetime() {
        let root = root_ca();
        let ca_ref = SecretReference::new("root-ca", "mesh-issuer");
        let ca_secret = root_ca_secret("root-ca", "mesh-issuer", &root);
        let key = PKey::try_from(Rsa::generate(2048).unwrap()).unwrap();
        let csr = build_csr(&key, &[], "stackable").unwrap();
        let err = sign_csr(
            &ca_ref,
            &ca_secret,
            &[],
            &csr.to_pem().unwrap(),
            Duration::from_days_unchecked(365 * 100_000),
        )
        .unwrap_err();
        assert!(matches!(err, Error::TtlOutOfRange { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn ignores_other_authorities() {
        let authority = LocalAuthority::new(Arc::new(MemoryStore::default()));
        let issued = issued(None);
        let request = SigningRequest {
            hosts: &issued.spec.hosts,
            csr_pem: b"",
            issued_certificate: &issued,
            cluster: "east",
        };
        assert_eq!(authority.sign(&request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_ca_secret_is_an_error() {
        let authority = LocalAuthority::new(Arc::new(MemoryStore::default()));
        let issued = issued(Some(CertificateAuthority::SigningCertificateSecret(
            SecretReference::new("root-ca", "mesh-issuer"),
        )));
        let request = SigningRequest {
            hosts: &issued.spec.hosts,
            csr_pem: b"",
            issued_certificate: &issued,
            cluster: "east",
        };
        let err = authority.sign(&request).await.unwrap_err();
        assert!(matches!(err, Error::CaNotFound { .. }), "{err:?}");
    }
}
