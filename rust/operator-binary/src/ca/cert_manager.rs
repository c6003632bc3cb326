//! Delegates signing to a [cert-manager](https://cert-manager.io/) issuer in the issuer cluster

use std::sync::Arc;

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::ByteString,
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef},
};
use tracing::info;

use super::{SignedCertificate, SigningAuthority, SigningRequest};
use crate::{
    crd::{CertManagerIssuer, CertificateAuthority},
    external_crd::cert_manager,
    store::{self, ObjectStore},
};

const CERT_MANAGER_GROUP: &str = "cert-manager.io";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {request}"))]
    GetRequest {
        source: store::Error,
        request: ObjectRef<cert_manager::CertificateRequest>,
    },

    #[snafu(display("failed to replace outdated {request}"))]
    DeleteRequest {
        source: store::Error,
        request: ObjectRef<cert_manager::CertificateRequest>,
    },

    #[snafu(display("failed to create {request}"))]
    CreateRequest {
        source: store::Error,
        request: ObjectRef<cert_manager::CertificateRequest>,
    },

    #[snafu(display("{request} was rejected ({reason}): {message}"))]
    Rejected {
        request: ObjectRef<cert_manager::CertificateRequest>,
        reason: String,
        message: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Handles [`CertificateAuthority::CertManager`].
pub struct CertManagerAuthority<S> {
    store: Arc<S>,
}

impl<S> CertManagerAuthority<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

/// Requests from different clusters may share a namespace and name, so the cluster is part of the name.
fn request_name(request: &SigningRequest) -> String {
    let issued = &request.issued_certificate.metadata;
    format!(
        "{}-{}-{}",
        request.cluster,
        issued.namespace.as_deref().unwrap_or_default(),
        issued.name.as_deref().unwrap_or_default(),
    )
}

fn build_request(
    name: String,
    issuer: &CertManagerIssuer,
    request: &SigningRequest,
) -> cert_manager::CertificateRequest {
    let ttl = request.issued_certificate.spec.cert_options.ttl;
    cert_manager::CertificateRequest {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(issuer.request_namespace.clone()),
            ..ObjectMeta::default()
        },
        spec: cert_manager::CertificateRequestSpec {
            request: ByteString(request.csr_pem.to_vec()),
            duration: Some(format!("{}s", ttl.as_secs())),
            is_ca: true,
            issuer_ref: cert_manager::ObjectReference {
                name: issuer.name.clone(),
                kind: Some(issuer.kind.to_string()),
                group: Some(CERT_MANAGER_GROUP.to_string()),
            },
        },
        status: None,
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> SigningAuthority for CertManagerAuthority<S> {
    type Error = Error;

    async fn sign(&self, request: &SigningRequest<'_>) -> Result<Option<SignedCertificate>> {
        let Some(CertificateAuthority::CertManager(issuer)) =
            &request.issued_certificate.spec.certificate_authority
        else {
            return Ok(None);
        };
        let name = request_name(request);
        let request_ref = || {
            ObjectRef::<cert_manager::CertificateRequest>::new(&name)
                .within(&issuer.request_namespace)
        };
        let desired = build_request(name.clone(), issuer, request);
        let existing = self
            .store
            .get_opt::<cert_manager::CertificateRequest>(&name, &issuer.request_namespace)
            .await
            .with_context(|_| GetRequestSnafu {
                request: request_ref(),
            })?;

        match existing {
            // cert-manager requests are immutable, so a new CSR needs a new request
            Some(existing) if existing.spec.request != desired.spec.request => {
                info!(request = %request_ref(), "Replacing outdated cert-manager request");
                self.store
                    .delete::<cert_manager::CertificateRequest>(&name, &issuer.request_namespace)
                    .await
                    .with_context(|_| DeleteRequestSnafu {
                        request: request_ref(),
                    })?;
                Ok(None)
            }
            Some(existing) => {
                let status = existing.status.unwrap_or_default();
                if let Some(rejection) = status.rejection() {
                    return RejectedSnafu {
                        request: request_ref(),
                        reason: rejection.reason.clone().unwrap_or_default(),
                        message: rejection.message.clone().unwrap_or_default(),
                    }
                    .fail();
                }
                Ok(status
                    .certificate
                    .filter(|cert| !cert.0.is_empty())
                    .map(|cert| SignedCertificate {
                        certificate_pem: cert.0,
                        root_ca_pem: status.ca.map(|ca| ca.0).unwrap_or_default(),
                    }))
            }
            None => {
                info!(request = %request_ref(), "Creating cert-manager request");
                self.store
                    .apply(&desired)
                    .await
                    .with_context(|_| CreateRequestSnafu {
                        request: request_ref(),
                    })?;
                Ok(None)
            }
        }
    }
}
