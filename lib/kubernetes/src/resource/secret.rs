use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

/// Secret holds secret data of a certain type.
///
/// Values under `data` are base64-encoded on the wire; the engine treats
/// them as opaque strings and never decodes them.
///
/// See https://kubernetes.io/docs/reference/kubernetes-api/config-and-storage-resources/secret-v1/
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Secret {
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

    /// Used to facilitate programmatic handling of secret data. Immutable
    /// once the object exists.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

impl Resource for Secret {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Secret";
    const PLURAL: &'static str = "secrets";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
