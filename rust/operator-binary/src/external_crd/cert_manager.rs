//! CRDs owned by [cert-manager](https://cert-manager.io/), see [their API docs](https://cert-manager.io/docs/reference/api-docs/).

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::ByteString,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
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
    /// PEM-encoded PKCS#10 CSR.
    #[schemars(with = "String")]
    pub request: ByteString,
    pub duration: Option<String>,
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,
    pub issuer_ref: ObjectReference,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    pub kind: Option<String>,
    pub group: Option<String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequestStatus>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[schemars(with = "Option<String>")]
    pub certificate: Option<ByteString>,
    #[schemars(with = "Option<String>")]
    pub ca: Option<ByteString>,
    #[serde(default)]
    pub conditions: Vec<CertificateRequestCondition>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequestCondition>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl CertificateRequestStatus {
    /// The condition that caused cert-manager to give up on the request, if any.
    pub fn rejection(&self) -> Option<&CertificateRequestCondition> {
        self.conditions.iter().find(|cond| {
            cond.status == "True"
                && (cond.type_ == "Denied"
                    || cond.type_ == "InvalidRequest"
                    || (cond.type_ == "Ready" && cond.reason.as_deref() == Some("Failed")))
        })
    }
}
