//! The mutation surface the reconciler consumes.
//!
//! The gateway performs exactly one API call per operation; every retry and
//! backoff decision belongs to the watch loop and the reconciler. Failures
//! are classified into the handful of cases the engine reacts to.

use async_trait::async_trait;
use kubernetes::{Client, Resource};

use crate::annotations::QualifiedName;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    AlreadyExists,

    #[error("write conflict")]
    Conflict,

    #[error("forbidden: {0}")]
    Forbidden(kubernetes::Error),

    #[error(transparent)]
    Transport(kubernetes::Error),
}

impl From<kubernetes::Error> for GatewayError {
    fn from(err: kubernetes::Error) -> Self {
        match err.api_status() {
            Some(404) => GatewayError::NotFound,
            Some(409) if err.api_reason() == Some("AlreadyExists") => GatewayError::AlreadyExists,
            Some(409) => GatewayError::Conflict,
            Some(401) | Some(403) => GatewayError::Forbidden(err),
            _ => GatewayError::Transport(err),
        }
    }
}

#[async_trait]
pub trait Gateway<R: Resource>: Send + Sync {
    async fn get(&self, name: &QualifiedName) -> Result<R, GatewayError>;

    /// Apply an RFC 6902 patch document (the serialized operation array).
    async fn patch(&self, name: &QualifiedName, patch: &serde_json::Value)
        -> Result<(), GatewayError>;

    async fn create(&self, resource: &R) -> Result<(), GatewayError>;

    /// Idempotent: deleting an object that is already gone succeeds.
    async fn delete(&self, name: &QualifiedName) -> Result<(), GatewayError>;
}

/// The production gateway, a thin classification layer over the API client.
pub struct ApiGateway {
    client: Client,
}

impl ApiGateway {
    pub fn new(client: Client) -> Self {
        ApiGateway { client }
    }
}

#[async_trait]
impl<R: Resource + Send + Sync + 'static> Gateway<R> for ApiGateway {
    async fn get(&self, name: &QualifiedName) -> Result<R, GatewayError> {
        self.client
            .get::<R>(&name.namespace, &name.name)
            .await
            .map_err(Into::into)
    }

    async fn patch(
        &self,
        name: &QualifiedName,
        patch: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        self.client
            .patch::<R>(&name.namespace, &name.name, patch)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn create(&self, resource: &R) -> Result<(), GatewayError> {
        self.client
            .create::<R>(resource)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    async fn delete(&self, name: &QualifiedName) -> Result<(), GatewayError> {
        match self.client.delete::<R>(&name.namespace, &name.name).await {
            Ok(()) => Ok(()),
            Err(err) => match GatewayError::from(err) {
                GatewayError::NotFound => Ok(()),
                err => Err(err),
            },
        }
    }
}
