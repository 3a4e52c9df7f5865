use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Standard object metadata.
///
/// Only the fields the reflection engine reads are modeled here; everything
/// else on the wire is ignored on deserialize and never written back.
///
/// More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    /// Empty for cluster-scoped resources such as namespaces.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Opaque server-assigned revision; compared only for equality.
    #[serde(
        default,
        rename = "resourceVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(
        default,
        rename = "creationTimestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub creation_timestamp: Option<String>,
}

/// Metadata of a list response; only `resourceVersion` and the continue
/// token matter to callers.
#[derive(Debug, Default, Deserialize)]
pub struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: Option<String>,

    #[serde(default, rename = "continue")]
    pub r#continue: Option<String>,
}
