use stackable_operator::kube::runtime::reflector::ObjectRef;

use crate::crd::{
    CertificateRequest, CertificateRequestState, CertificateRequestStatus, IssuedCertificate,
    IssuedCertificateState, PodBounceDirective, PodBounceDirectiveReference,
};

impl IssuedCertificate {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// The state that the workflow should continue from.
    ///
    /// A status written for an older generation is meaningless, the spec has changed since,
    /// so the workflow restarts from [`IssuedCertificateState::Pending`].
    pub fn effective_state(&self) -> IssuedCertificateState {
        match &self.status {
            Some(status) if status.observed_generation == self.generation() => status.state,
            _ => IssuedCertificateState::Pending,
        }
    }
}

impl CertificateRequest {
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// The status, unless it was written for an older generation of the CSR.
    pub fn current_status(&self) -> Option<&CertificateRequestStatus> {
        self.status
            .as_ref()
            .filter(|status| status.observed_generation == self.generation())
    }

    pub fn effective_state(&self) -> CertificateRequestState {
        self.current_status()
            .map_or(CertificateRequestState::Pending, |status| status.state)
    }

    /// Whether the issuer has nothing left to do for this request.
    pub fn is_signed(&self) -> bool {
        self.current_status().is_some_and(|status| {
            status.state == CertificateRequestState::Finished
                && !status.signed_certificate.is_empty()
        })
    }
}

impl PodBounceDirectiveReference {
    pub fn matches(&self, directive: &PodBounceDirective) -> bool {
        directive.metadata.name.as_deref() == Some(&self.name)
            && directive.metadata.namespace.as_deref() == Some(&self.namespace)
    }
}

impl From<&PodBounceDirectiveReference> for ObjectRef<PodBounceDirective> {
    fn from(val: &PodBounceDirectiveReference) -> Self {
        ObjectRef::new(&val.name).within(&val.namespace)
    }
}

#[cfg(test)]
mod tests {
    use stackable_mesh_cert_operator_crd_utils::SecretReference;
    use stackable_operator::kube::api::ObjectMeta;

    use crate::crd::{
        CertificateRequest, CertificateRequestSpec, CertificateRequestState,
        CertificateRequestStatus, IssuedCertificate, IssuedCertificateSpec, IssuedCertificateState,
        IssuedCertificateStatus,
    };

    fn issued(generation: i64, status: Option<IssuedCertificateStatus>) -> IssuedCertificate {
        let mut issued = IssuedCertificate::new(
            "istio",
            IssuedCertificateSpec {
                hosts: vec![],
                org: String::new(),
                certificate_authority: None,
                issued_certificate_secret: SecretReference::new("cacerts", "istio-system"),
                pod_bounce_directive: None,
                cert_options: Default::default(),
            },
        );
        issued.metadata.generation = Some(generation);
        issued.status = status;
        issued
    }

    #[test]
    fn stale_status_restarts_from_pending() {
        for state in [
            IssuedCertificateState::Requested,
            IssuedCertificateState::Issued,
            IssuedCertificateState::Finished,
            IssuedCertificateState::Failed,
        ] {
            let status = IssuedCertificateStatus {
                observed_generation: 1,
                state,
                error: String::new(),
            };
            assert_eq!(
                issued(1, Some(status.clone())).effective_state(),
                state,
                "{state} should be kept for the observed generation"
            );
            assert_eq!(
                issued(2, Some(status)).effective_state(),
                IssuedCertificateState::Pending,
                "{state} should be reset by a generation bump"
            );
        }
        assert_eq!(
            issued(3, None).effective_state(),
            IssuedCertificateState::Pending
        );
    }

    #[test]
    fn signed_requires_certificate_for_current_generation() {
        let request = |generation, state, cert: &str| CertificateRequest {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..ObjectMeta::default()
            },
            spec: CertificateRequestSpec {
                certificate_signing_request: "csr".to_string(),
            },
            status: Some(CertificateRequestStatus {
                observed_generation: 1,
                state,
                signed_certificate: cert.to_string(),
                ..CertificateRequestStatus::default()
            }),
        };
        assert!(request(1, CertificateRequestState::Finished, "cert").is_signed());
        assert!(!request(1, CertificateRequestState::Finished, "").is_signed());
        assert!(!request(2, CertificateRequestState::Finished, "cert").is_signed());
        assert_eq!(
            request(2, CertificateRequestState::Failed, "").effective_state(),
            CertificateRequestState::Pending
        );
    }
}
