use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

/// Namespace provides a scope for names. Cluster-scoped; only the metadata
/// is of interest.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Namespace {
    /// Standard object's metadata.
    pub metadata: ObjectMeta,
}

impl Resource for Namespace {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "Namespace";
    const PLURAL: &'static str = "namespaces";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
