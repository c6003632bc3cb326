//! Moves a single [`IssuedCertificate`] through its workflow

use std::collections::BTreeMap;

use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req, X509ReqBuilder, X509},
};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef, ResourceExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::state::{self, Effect, Event};
use crate::{
    bounce::{self, PodBouncer},
    crd::{
        CertificateRequest, CertificateRequestSpec, CertificateRequestState, IssuedCertificate,
        IssuedCertificateState, IssuedCertificateStatus, PodBounceDirective,
    },
    material::{self, IssuedCertificateData},
    snapshot::{AgentSnapshot, OutputSet},
    store::ObjectStore,
    utils::asn1time_to_offsetdatetime,
};

const SPIFFE_SCHEME: &str = "spiffe://";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate private key"))]
    GenerateKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to serialize private key"))]
    SerializeKey { source: openssl::error::ErrorStack },

    #[snafu(display("failed to build certificate signing request"))]
    BuildCsr { source: openssl::error::ErrorStack },

    #[snafu(display("private key {secret} has no {key:?} entry"))]
    MissingPrivateKey {
        secret: ObjectRef<Secret>,
        key: &'static str,
    },

    #[snafu(display("failed to load private key from {secret}"))]
    LoadPrivateKey {
        source: openssl::error::ErrorStack,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("signed certificate in {request} does not belong to the private key"))]
    KeyMismatch {
        request: ObjectRef<CertificateRequest>,
    },

    #[snafu(display("{request} failed: {message}"))]
    RequestFailed {
        request: ObjectRef<CertificateRequest>,
        message: String,
    },

    #[snafu(display("{directive} does not exist"))]
    MissingDirective {
        directive: ObjectRef<PodBounceDirective>,
    },

    #[snafu(display("failed to bounce pods of {directive}"))]
    BouncePods {
        source: bounce::Error,
        directive: ObjectRef<PodBounceDirective>,
    },

    #[snafu(display("invalid workflow transition"))]
    Transition { source: state::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error breaks an internal contract rather than being caused by the
    /// certificate's environment.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::Transition { .. })
    }
}

/// Generates the CSR that is sent to the issuer.
///
/// `spiffe://` hosts become URI SANs, everything else is treated as a DNS name.
pub fn build_csr(
    key: &PKey<Private>,
    hosts: &[String],
    org: &str,
) -> Result<X509Req, openssl::error::ErrorStack> {
    let mut req = X509ReqBuilder::new()?;
    let mut name = X509NameBuilder::new()?;
    if !org.is_empty() {
        name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
    }
    req.set_subject_name(&name.build())?;
    req.set_pubkey(key)?;
    if !hosts.is_empty() {
        let mut extensions = Stack::new()?;
        let ctx = req.x509v3_context(None);
        let mut san_ext = SubjectAlternativeName::new();
        for host in hosts {
            if host.starts_with(SPIFFE_SCHEME) {
                san_ext.uri(host);
            } else {
                san_ext.dns(host);
            }
        }
        extensions.push(san_ext.build(&ctx)?)?;
        req.add_extensions(&extensions)?;
    }
    req.sign(key, MessageDigest::sha256())?;
    Ok(req.build())
}

fn owned_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

/// Everything that a single pass shares between all certificates.
pub struct Translator<'a, S> {
    pub snapshot: &'a mut AgentSnapshot,
    pub output: &'a mut OutputSet,
    pub bouncer: &'a PodBouncer<'a, S>,
    pub cancel: &'a CancellationToken,
}

impl<S: ObjectStore> Translator<'_, S> {
    /// Advances `issued` as far as possible, updating its status.
    ///
    /// Returns `true` if the certificate is waiting for something that won't necessarily
    /// trigger another pass by itself.
    pub async fn translate(&mut self, issued: &mut IssuedCertificate) -> Result<bool> {
        let name = issued.name_any();
        let namespace = issued.namespace().unwrap_or_default();
        let generation = issued.generation();
        let mut current = issued.effective_state();
        let mut waiting = false;

        // Restarts re-evaluate Pending, nothing can restart twice in one pass
        for _ in 0..2 {
            let event = self.observe(current, issued, &name, &namespace).await?;
            let transition = state::transition(current, event).context(TransitionSnafu)?;
            match transition.effect {
                Effect::Nothing => {}
                Effect::GenerateRequest => self.generate_request(issued, &name, &namespace)?,
                Effect::KeepRequest => self.keep_request(&name, &namespace),
                Effect::WriteIssuedSecret => self.write_issued_secret(issued, &name, &namespace)?,
                Effect::Fail => {
                    let request = self.find_request(&name, &namespace);
                    return RequestFailedSnafu {
                        request: ObjectRef::<CertificateRequest>::new(&name).within(&namespace),
                        message: request
                            .and_then(|request| request.current_status())
                            .map(|status| status.error.clone())
                            .unwrap_or_default(),
                    }
                    .fail();
                }
            }
            if current == IssuedCertificateState::Failed {
                info!(
                    issued_certificate = %ObjectRef::from_obj(&*issued),
                    previous_error = issued
                        .status
                        .as_ref()
                        .map_or("", |status| status.error.as_str()),
                    "Retrying failed issued certificate"
                );
            }
            if transition.next != current {
                info!(
                    issued_certificate = %ObjectRef::from_obj(&*issued),
                    from = %current,
                    to = %transition.next,
                    "Advancing issued certificate"
                );
            }
            waiting = event == Event::BounceWaiting;
            current = transition.next;
            if !transition.reevaluate {
                break;
            }
        }

        self.keep_target_secret(issued);
        issued.status = Some(IssuedCertificateStatus {
            observed_generation: generation,
            state: current,
            error: String::new(),
        });
        Ok(waiting)
    }

    async fn observe(
        &mut self,
        state: IssuedCertificateState,
        issued: &IssuedCertificate,
        name: &str,
        namespace: &str,
    ) -> Result<Event> {
        Ok(match state {
            IssuedCertificateState::Pending
            | IssuedCertificateState::Failed
            | IssuedCertificateState::Unknown => Event::Entered,
            IssuedCertificateState::Requested => {
                let key = self.find_private_key(name, namespace);
                match (key, self.find_request(name, namespace)) {
                    (Some(_), Some(request)) => match request.effective_state() {
                        CertificateRequestState::Failed => Event::RequestFailed,
                        _ if request.is_signed() => Event::RequestSigned,
                        _ => Event::RequestPending,
                    },
                    _ => Event::InputsMissing,
                }
            }
            IssuedCertificateState::Issued => {
                if self.find_target_secret(issued).is_none() {
                    Event::TargetMissing
                } else if self.bounce(issued).await? {
                    Event::BounceWaiting
                } else {
                    Event::BounceDone
                }
            }
            IssuedCertificateState::Finished => {
                if self.find_target_secret(issued).is_some() {
                    Event::TargetPresent
                } else {
                    Event::TargetMissing
                }
            }
        })
    }

    fn find_private_key(&self, name: &str, namespace: &str) -> Option<&Secret> {
        self.output.secret(namespace, name).or_else(|| {
            self.snapshot.secrets.iter().find(|secret| {
                secret.metadata.name.as_deref() == Some(name)
                    && secret.metadata.namespace.as_deref() == Some(namespace)
            })
        })
    }

    fn find_request(&self, name: &str, namespace: &str) -> Option<&CertificateRequest> {
        self.snapshot.certificate_requests.iter().find(|request| {
            request.metadata.name.as_deref() == Some(name)
                && request.metadata.namespace.as_deref() == Some(namespace)
        })
    }

    fn find_target_secret(&self, issued: &IssuedCertificate) -> Option<&Secret> {
        issued
            .spec
            .issued_certificate_secret
            .find_in(&self.snapshot.secrets)
    }

    async fn bounce(&mut self, issued: &IssuedCertificate) -> Result<bool> {
        let Some(directive_ref) = &issued.spec.pod_bounce_directive else {
            return Ok(false);
        };
        let directive = self
            .snapshot
            .pod_bounce_directives
            .iter_mut()
            .find(|directive| directive_ref.matches(directive))
            .context(MissingDirectiveSnafu {
                directive: directive_ref,
            })?;
        self.bouncer
            .bounce_pods(
                directive,
                &self.snapshot.pods,
                &self.snapshot.config_maps,
                &self.snapshot.secrets,
                self.cancel,
            )
            .await
            .context(BouncePodsSnafu {
                directive: directive_ref,
            })
    }

    fn generate_request(
        &mut self,
        issued: &IssuedCertificate,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let options = &issued.spec.cert_options;
        let key = Rsa::generate(options.rsa_key_size)
            .and_then(PKey::try_from)
            .context(GenerateKeySnafu)?;
        let csr = build_csr(&key, &issued.spec.hosts, &issued.spec.org)
            .and_then(|csr| csr.to_pem())
            .context(BuildCsrSnafu)?;
        let key_pem = key.private_key_to_pem_pkcs8().context(SerializeKeySnafu)?;

        self.output.add_secret(Secret {
            metadata: owned_meta(name, namespace),
            data: Some(BTreeMap::from([(
                material::PRIVATE_KEY.to_string(),
                ByteString(key_pem),
            )])),
            ..Secret::default()
        });
        self.output.add_certificate_request(CertificateRequest {
            metadata: owned_meta(name, namespace),
            spec: CertificateRequestSpec {
                certificate_signing_request: String::from_utf8_lossy(&csr).into_owned(),
            },
            status: None,
        });
        Ok(())
    }

    fn keep_request(&mut self, name: &str, namespace: &str) {
        if let Some(key) = self.find_private_key(name, namespace).cloned() {
            self.output.keep_secret(&key);
        }
        if let Some(request) = self.find_request(name, namespace).cloned() {
            self.output.keep_certificate_request(&request);
        }
    }

    fn write_issued_secret(
        &mut self,
        issued: &IssuedCertificate,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let key_secret = ObjectRef::<Secret>::new(name).within(namespace);
        let request_ref = ObjectRef::<CertificateRequest>::new(name).within(namespace);
        let private_key = self
            .find_private_key(name, namespace)
            .and_then(|secret| material::get(secret, material::PRIVATE_KEY))
            .context(MissingPrivateKeySnafu {
                secret: key_secret.clone(),
                key: material::PRIVATE_KEY,
            })?
            .to_vec();
        let signed = self
            .find_request(name, namespace)
            .and_then(|request| request.current_status())
            .cloned()
            .unwrap_or_default();

        let key = PKey::private_key_from_pem(&private_key)
            .context(LoadPrivateKeySnafu { secret: key_secret })?;
        match X509::from_pem(signed.signed_certificate.as_bytes()) {
            Ok(cert) => {
                let matches_key = cert
                    .public_key()
                    .map(|public| public.public_eq(&key))
                    .unwrap_or(false);
                if !matches_key {
                    return KeyMismatchSnafu {
                        request: request_ref,
                    }
                    .fail();
                }
                let expires_at = asn1time_to_offsetdatetime(cert.not_after())
                    .map(|expiry| expiry.to_string())
                    .unwrap_or_default();
                info!(
                    issued_certificate = %ObjectRef::from_obj(issued),
                    %expires_at,
                    "Received signed certificate"
                );
            }
            Err(_) => warn!(
                issued_certificate = %ObjectRef::from_obj(issued),
                "Signed certificate could not be parsed, writing it unverified"
            ),
        }

        // Added before the target, which wins if both share a name
        self.keep_request(name, namespace);
        let target = &issued.spec.issued_certificate_secret;
        self.output.add_secret(Secret {
            metadata: owned_meta(&target.name, &target.namespace),
            data: Some(
                IssuedCertificateData {
                    signed_certificate: signed.signed_certificate.into_bytes(),
                    private_key,
                    signing_root_ca: signed.signing_root_ca.into_bytes(),
                }
                .into_data(),
            ),
            ..Secret::default()
        });

        // The new certificate must be rolled out from the first stage again
        if let Some(directive_ref) = &issued.spec.pod_bounce_directive {
            if let Some(directive) = self
                .snapshot
                .pod_bounce_directives
                .iter_mut()
                .find(|directive| directive_ref.matches(directive))
            {
                if let Some(status) = &mut directive.status {
                    status.pods_bounced.clear();
                }
            }
        }
        Ok(())
    }

    /// An issued Secret that already exists must survive garbage collection in every state.
    pub fn keep_target_secret(&mut self, issued: &IssuedCertificate) {
        let target = &issued.spec.issued_certificate_secret;
        if self.output.secret(&target.namespace, &target.name).is_some() {
            return;
        }
        if let Some(secret) = self.find_target_secret(issued).cloned() {
            self.output.keep_secret(&secret);
        }
    }
}
