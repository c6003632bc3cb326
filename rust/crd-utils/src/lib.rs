//! Reference types that are shared between the certificate agent and issuer, but aren't clearly owned by one of them.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::api::core::v1::{ConfigMap, Secret},
    kube::{api::ObjectMeta, runtime::reflector::ObjectRef},
    schemars::{self, JsonSchema},
};

// Redefine SecretReference instead of reusing k8s-openapi's, in order to make name/namespace mandatory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Namespace of the Secret being referred to.
    pub namespace: String,
    /// Name of the Secret being referred to.
    pub name: String,
}

// Use ObjectRef for logging/errors
impl Display for SecretReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ObjectRef::<Secret>::from(self).fmt(f)
    }
}
impl From<SecretReference> for ObjectRef<Secret> {
    fn from(val: SecretReference) -> Self {
        ObjectRef::<Secret>::from(&val)
    }
}
impl From<&SecretReference> for ObjectRef<Secret> {
    fn from(val: &SecretReference) -> Self {
        ObjectRef::<Secret>::new(&val.name).within(&val.namespace)
    }
}

impl SecretReference {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Finds the referenced [`Secret`] in a list of candidates.
    pub fn find_in<'a>(&self, secrets: impl IntoIterator<Item = &'a Secret>) -> Option<&'a Secret> {
        secrets.into_iter().find(|secret| self == *secret)
    }

    /// Returns the value of `key` in the referenced [`Secret`], if both exist.
    pub fn lookup<'a>(
        &self,
        secrets: impl IntoIterator<Item = &'a Secret>,
        key: &str,
    ) -> Option<&'a [u8]> {
        self.find_in(secrets)?
            .data
            .as_ref()?
            .get(key)
            .map(|value| value.0.as_slice())
    }
}
impl PartialEq<Secret> for SecretReference {
    fn eq(&self, secret: &Secret) -> bool {
        matches(&self.name, &self.namespace, &secret.metadata)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapReference {
    /// Namespace of the ConfigMap being referred to.
    pub namespace: String,
    /// Name of the ConfigMap being referred to.
    pub name: String,
}

impl Display for ConfigMapReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ObjectRef::<ConfigMap>::from(self).fmt(f)
    }
}
impl From<&ConfigMapReference> for ObjectRef<ConfigMap> {
    fn from(val: &ConfigMapReference) -> Self {
        ObjectRef::<ConfigMap>::new(&val.name).within(&val.namespace)
    }
}

impl ConfigMapReference {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn find_in<'a>(
        &self,
        config_maps: impl IntoIterator<Item = &'a ConfigMap>,
    ) -> Option<&'a ConfigMap> {
        config_maps.into_iter().find(|cm| self == *cm)
    }
}
impl PartialEq<ConfigMap> for ConfigMapReference {
    fn eq(&self, config_map: &ConfigMap) -> bool {
        matches(&self.name, &self.namespace, &config_map.metadata)
    }
}

fn matches(name: &str, namespace: &str, meta: &ObjectMeta) -> bool {
    meta.name.as_deref() == Some(name) && meta.namespace.as_deref() == Some(namespace)
}
