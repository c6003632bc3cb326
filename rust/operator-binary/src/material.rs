//! Well-known layouts of the Secrets that hold key material

use std::collections::BTreeMap;

use snafu::{OptionExt, Snafu};
use stackable_operator::k8s_openapi::{api::core::v1::Secret, ByteString};

/// The agent's private key, waiting for its certificate to be signed.
pub const PRIVATE_KEY: &str = "private-key";
/// The issued certificate followed by the rest of its chain.
pub const CERT_CHAIN: &str = "cert-chain.pem";
/// The issued certificate.
pub const CA_CERT: &str = "ca-cert.pem";
/// The private key belonging to [`CA_CERT`].
pub const CA_KEY: &str = "ca-key.pem";
/// The root that everything else chains up to.
pub const ROOT_CERT: &str = "root-cert.pem";
/// The private key belonging to [`ROOT_CERT`].
pub const KEY: &str = "key.pem";

pub type SecretData = BTreeMap<String, ByteString>;

#[derive(Snafu, Debug)]
#[snafu(module)]
pub enum FromDataError {
    #[snafu(display("missing required key {key:?}"))]
    MissingKey { key: &'static str },
}

/// The contents of an `issuedCertificateSecret`, in the layout expected by Istio's `cacerts`.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCertificateData {
    pub signed_certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub signing_root_ca: Vec<u8>,
}

impl IssuedCertificateData {
    pub fn into_data(self) -> SecretData {
        let cert_chain = concat_pem([&self.signed_certificate, &self.signing_root_ca]);
        [
            (CA_CERT, self.signed_certificate),
            (CA_KEY, self.private_key),
            (ROOT_CERT, self.signing_root_ca),
            (CERT_CHAIN, cert_chain),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), ByteString(value)))
        .collect()
    }
}

/// A root certificate and key, used to sign certificates in the issuer cluster.
#[derive(Debug)]
pub struct RootCaData<'a> {
    pub root_cert: &'a [u8],
    pub key: &'a [u8],
}

impl<'a> RootCaData<'a> {
    /// Reads `root-cert.pem`/`key.pem`, falling back to `ca-cert.pem`/`ca-key.pem` for
    /// Secrets that were written in the intermediate layout.
    pub fn from_data(data: &'a SecretData) -> Result<Self, FromDataError> {
        use from_data_error::*;
        let get = |key: &str| data.get(key).map(|value| value.0.as_slice());
        if let Some(root_cert) = get(ROOT_CERT) {
            Ok(Self {
                root_cert,
                key: get(KEY).context(MissingKeySnafu { key: KEY })?,
            })
        } else {
            Ok(Self {
                root_cert: get(CA_CERT).context(MissingKeySnafu { key: ROOT_CERT })?,
                key: get(CA_KEY).context(MissingKeySnafu { key: KEY })?,
            })
        }
    }
}

/// Returns the value stored under `key`, if any.
pub fn get<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|value| value.0.as_slice())
}

/// Concatenates PEM documents, making sure that every document starts on its own line.
pub fn concat_pem<'a>(documents: impl IntoIterator<Item = &'a Vec<u8>>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for document in documents {
        if document.is_empty() {
            continue;
        }
        buffer.extend_from_slice(document);
        if !document.ends_with(b"\n") {
            buffer.push(b'\n');
        }
    }
    buffer
}
