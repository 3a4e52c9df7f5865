use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

/// ConfigMap holds configuration data for pods to consume.
///
/// See https://kubernetes.io/docs/reference/kubernetes-api/config-and-storage-resources/config-map-v1/
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfigMap {
    /// Standard object's metadata.
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,

    /// Binary payload, base64-encoded on the wire.
    #[serde(
        default,
        rename = "binaryData",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub binary_data: BTreeMap<String, String>,
}

impl Resource for ConfigMap {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "ConfigMap";
    const PLURAL: &'static str = "configmaps";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
