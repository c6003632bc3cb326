//! Pluggable certificate authorities that sign the CSRs carried by [`CertificateRequest`](crate::crd::CertificateRequest)s

pub mod cert_manager;
pub mod local;

use std::fmt::{Debug, Display};

use async_trait::async_trait;

use crate::crd::IssuedCertificate;

pub use cert_manager::CertManagerAuthority;
pub use local::LocalAuthority;

/// Everything an authority may base its decision on.
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    /// DNS names and SPIFFE identities to include as SANs.
    pub hosts: &'a [String],
    /// PEM-encoded PKCS#10 CSR.
    pub csr_pem: &'a [u8],
    /// Selects the authority and its options.
    pub issued_certificate: &'a IssuedCertificate,
    /// Name of the cluster that the request originates from.
    pub cluster: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub certificate_pem: Vec<u8>,
    pub root_ca_pem: Vec<u8>,
}

/// This trait needs to be implemented by all signing backends.
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Signs the CSR, if this authority is responsible for it.
    ///
    /// Returns [`None`] if the certificate's authority is handled by someone else, or if the
    /// signature is not available yet. Either way the request should stay pending.
    async fn sign(
        &self,
        request: &SigningRequest<'_>,
    ) -> Result<Option<SignedCertificate>, Self::Error>;
}

pub struct DynError(Box<dyn std::error::Error + Send + Sync>);

impl Debug for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for DynError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DynError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

pub struct DynamicAdapter<A>(A);

#[async_trait]
impl<A: SigningAuthority> SigningAuthority for DynamicAdapter<A> {
    type Error = DynError;

    async fn sign(
        &self,
        request: &SigningRequest<'_>,
    ) -> Result<Option<SignedCertificate>, Self::Error> {
        self.0
            .sign(request)
            .await
            .map_err(|err| DynError(Box::new(err)))
    }
}

pub type Dynamic = dyn SigningAuthority<Error = DynError>;
pub fn from(authority: impl SigningAuthority + 'static) -> Box<Dynamic> {
    Box::new(DynamicAdapter(authority))
}

/// Consults each authority in turn, the first one to produce a certificate (or fail) wins.
pub struct Chain(pub Vec<Box<Dynamic>>);

#[async_trait]
impl SigningAuthority for Chain {
    type Error = DynError;

    async fn sign(
        &self,
        request: &SigningRequest<'_>,
    ) -> Result<Option<SignedCertificate>, Self::Error> {
        for authority in &self.0 {
            if let Some(signed) = authority.sign(request).await? {
                return Ok(Some(signed));
            }
        }
        Ok(None)
    }
}
