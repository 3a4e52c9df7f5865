mod client;
pub mod config;
mod resource;
mod version;

pub use client::{Client, Error, ErrorResponse, ListParams, WatchEvent, WatchParams};
pub use resource::{ConfigMap, ListMeta, Namespace, ObjectList, ObjectMeta, Resource, Secret};
pub use version::Version;
