mod configmap;
mod metadata;
mod namespace;
mod secret;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use configmap::ConfigMap;
pub use metadata::{ListMeta, ObjectMeta};
pub use namespace::Namespace;
pub use secret::Secret;

/// An accessor trait for a kubernetes Resource.
pub trait Resource: DeserializeOwned + Serialize {
    /// The group of the resource, or the empty string if the resource doesn't
    /// have a group.
    const GROUP: &'static str;

    /// The version of the resource.
    const VERSION: &'static str;

    /// The kind of the resource, e.g. "Secret".
    const KIND: &'static str;

    /// The plural of this resource, which is used to construct URLs.
    const PLURAL: &'static str;

    /// Standard object metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// The `apiVersion` string, `<group>/<version>` or bare `<version>` for
    /// the core group.
    fn api_version() -> String {
        if Self::GROUP.is_empty() {
            Self::VERSION.to_string()
        } else {
            format!("{}/{}", Self::GROUP, Self::VERSION)
        }
    }

    /// Creates a url path for http requests for this resource
    fn url_path(namespace: Option<&str>) -> String {
        let group = if Self::GROUP.is_empty() {
            "api"
        } else {
            "apis"
        };
        let api_version = Self::api_version();
        let namespace = match namespace {
            Some(namespace) => format!("namespaces/{}/", namespace),
            None => String::new(),
        };
        let plural = Self::PLURAL;

        format!("/{group}/{api_version}/{namespace}{plural}")
    }
}

/// A generic Kubernetes object list, as returned by list calls.
///
/// Kubernetes exposes `SecretList`, `ConfigMapList` and the like with this
/// exact shape; a single generic struct covers them all.
#[derive(Deserialize)]
#[serde(bound(deserialize = "T: serde::de::Deserialize<'de>"))]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion`
    pub metadata: ListMeta,

    /// These items we are actually interested in.
    #[serde(default)]
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_core_group() {
        assert_eq!(Secret::url_path(None), "/api/v1/secrets");
        assert_eq!(
            Secret::url_path(Some("kube-system")),
            "/api/v1/namespaces/kube-system/secrets"
        );
        assert_eq!(ConfigMap::url_path(Some("dev")), "/api/v1/namespaces/dev/configmaps");
        assert_eq!(Namespace::url_path(None), "/api/v1/namespaces");
    }

    #[test]
    fn api_version() {
        assert_eq!(Secret::api_version(), "v1");
        assert_eq!(Namespace::api_version(), "v1");
    }
}
