//! Wires the engine together: one watcher per kind, a reconciler per
//! mirrored kind, and the namespace watcher feeding both reconcilers.

use std::sync::Arc;

use kubernetes::{Client, ConfigMap, Namespace, Secret};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::gateway::ApiGateway;
use crate::reconciler::{NamespaceHandler, Reconciler};
use crate::watcher::Watcher;

/// Secrets owned by helm release bookkeeping are never observed.
pub const HELM_TYPE_PREFIX: &str = "helm.sh";

pub fn is_helm_secret(secret: &Secret) -> bool {
    secret
        .type_
        .as_deref()
        .is_some_and(|t| t.starts_with(HELM_TYPE_PREFIX))
}

/// Run all watch loops until `shutdown` is cancelled and the queues have
/// drained.
pub async fn run(config: Config, client: Client, shutdown: CancellationToken) {
    let gateway = Arc::new(ApiGateway::new(client.clone()));

    let secret_reconciler = Arc::new(Reconciler::<Secret, _>::new(Arc::clone(&gateway)));
    let configmap_reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(Arc::clone(&gateway)));

    let mut secrets = Watcher::<Secret>::new(client.clone(), config.watcher.clone())
        .with_filter(|secret: &Secret| !is_helm_secret(secret));
    secrets.register(secret_reconciler.clone());

    let mut configmaps = Watcher::<ConfigMap>::new(client.clone(), config.watcher.clone());
    configmaps.register(configmap_reconciler.clone());

    let mut namespaces = Watcher::<Namespace>::new(client, config.watcher.clone());
    namespaces.register(Arc::new(NamespaceHandler::new(secret_reconciler)));
    namespaces.register(Arc::new(NamespaceHandler::new(configmap_reconciler)));

    let mut tasks = JoinSet::new();
    tasks.spawn(secrets.run(shutdown.clone()));
    tasks.spawn(configmaps.run(shutdown.clone()));
    tasks.spawn(namespaces.run(shutdown));

    while tasks.join_next().await.is_some() {}
}
