//! Issues service mesh certificates across clusters, and rolls them out by bouncing the Pods that use them.
//!
//! Every workload cluster runs an [`agent::Agent`], the cluster holding the signing material
//! runs an [`issuer::Issuer`]. Both are driven by [`reconciler::run`].

use const_format::concatcp;

pub mod agent;
pub mod bounce;
pub mod ca;
pub mod crd;
pub mod external_crd;
pub mod issuer;
pub mod material;
pub mod reconciler;
pub mod snapshot;
pub mod store;
pub mod utils;

pub const OPERATOR_NAME: &str = "mesh-cert.stackable.tech";
pub const FIELD_MANAGER: &str = concatcp!(OPERATOR_NAME, "_reconciler");

/// Marks the objects created by a reconciler, so that they can be garbage collected.
pub const OWNER_LABEL: &str = concatcp!(crd::GROUP, "/owner");

/// Finalizer that keeps an `IssuedCertificate` around until its objects have been released.
pub const CLEANUP_FINALIZER: &str = concatcp!(crd::GROUP, "/cleanup");
