//! Decides, for every resource and namespace event, which mirrors to
//! create, patch or delete.
//!
//! One reconciler exists per mirrored kind. It runs on its kind's consumer
//! task, so it sees resource events one at a time; namespace events arrive
//! on the namespace consumer task and may interleave, which the indices
//! tolerate.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use kubernetes::{ConfigMap, Namespace, ObjectMeta, Resource, Secret};
use serde_json::{json, Value};

use crate::annotations::{
    QualifiedName, ReflectionProperties, AUTO_REFLECTS, REFLECTED_AT, REFLECTED_VERSION, REFLECTS,
};
use crate::gateway::{Gateway, GatewayError};
use crate::indices::{ObservedProperties, ReflectionIndices};
use crate::watcher::{Event, EventHandler};

/// Kind descriptor for resources the engine can mirror. The shared
/// reconciliation behavior is parameterized only by this: which payload
/// paths a sync patches, and how a fresh mirror is built (including fields
/// that are immutable after creation).
pub trait Reflected: Resource + Clone + Send + Sync + 'static {
    /// Payload fields to mirror, as (json pointer, value) pairs.
    fn payload(&self) -> Vec<(&'static str, Value)>;

    /// Build a new mirror of this resource in `namespace`, carrying the
    /// payload and exactly the given annotations. Labels and any other
    /// annotations of the original are not copied.
    fn mirror(&self, namespace: &str, annotations: BTreeMap<String, String>) -> Self;
}

impl Reflected for Secret {
    fn payload(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("/data", json!(self.data)),
            ("/binaryData", json!(self.binary_data)),
        ]
    }

    fn mirror(&self, namespace: &str, annotations: BTreeMap<String, String>) -> Self {
        Secret {
            metadata: ObjectMeta {
                name: self.metadata.name.clone(),
                namespace: namespace.to_string(),
                annotations,
                ..Default::default()
            },
            data: self.data.clone(),
            binary_data: self.binary_data.clone(),
            // type is immutable once the object exists; it is set here and
            // never patched afterwards
            type_: self.type_.clone(),
        }
    }
}

impl Reflected for ConfigMap {
    fn payload(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("/data", json!(self.data)),
            ("/binaryData", json!(self.binary_data)),
        ]
    }

    fn mirror(&self, namespace: &str, annotations: BTreeMap<String, String>) -> Self {
        ConfigMap {
            metadata: ObjectMeta {
                name: self.metadata.name.clone(),
                namespace: namespace.to_string(),
                annotations,
                ..Default::default()
            },
            data: self.data.clone(),
            binary_data: self.binary_data.clone(),
        }
    }
}

pub struct Reconciler<R, G> {
    gateway: Arc<G>,
    indices: ReflectionIndices,
    namespaces: DashSet<String>,
    _kind: PhantomData<fn() -> R>,
}

impl<R, G> Reconciler<R, G>
where
    R: Reflected,
    G: Gateway<R>,
{
    pub fn new(gateway: Arc<G>) -> Self {
        Reconciler {
            gateway,
            indices: ReflectionIndices::default(),
            namespaces: DashSet::new(),
            _kind: PhantomData,
        }
    }

    pub fn indices(&self) -> &ReflectionIndices {
        &self.indices
    }

    async fn handle_event(&self, event: &Event<R>) -> crate::Result<()> {
        let meta = event.resource().metadata();
        let name = QualifiedName::new(meta.namespace.clone(), meta.name.clone());
        let mut props = ReflectionProperties::parse(&meta.annotations);

        match props.reflects.take() {
            Some(source) if source != name => self.on_mirror(event, name, source, props).await,
            Some(_) => {
                // self-target; treat as a plain source
                warn!(message = "resource reflects itself, annotation ignored", resource = %name);
                self.on_source(event, name, props).await;
            }
            None => self.on_source(event, name, props).await,
        }

        Ok(())
    }

    async fn on_mirror(
        &self,
        event: &Event<R>,
        mirror: QualifiedName,
        source: QualifiedName,
        props: ReflectionProperties,
    ) {
        match event {
            Event::Added(resource) | Event::Modified(resource) => {
                let mut reflection = props.clone();
                reflection.reflects = Some(source.clone());
                self.indices.record_properties(
                    mirror.clone(),
                    ObservedProperties {
                        version: resource.metadata().resource_version.clone(),
                        reflection,
                    },
                );
                if props.auto_reflects {
                    self.indices.link_auto(source.clone(), mirror.clone());
                } else {
                    self.indices.link_direct(source.clone(), mirror.clone());
                }

                // Cheap skip: the source was observed at the version this
                // mirror already carries.
                if let Some(observed) = self.indices.properties(&source) {
                    if observed.version.is_some() && observed.version == props.reflected_version {
                        return;
                    }
                }

                if self.indices.is_not_found(&source) {
                    return;
                }

                let source_obj = match self.gateway.get(&source).await {
                    Ok(source_obj) => source_obj,
                    Err(GatewayError::NotFound) => {
                        debug!(message = "source does not exist", %source, %mirror);
                        self.indices.mark_not_found(source);
                        return;
                    }
                    Err(err) => {
                        warn!(message = "fetch source failed", %source, %mirror, %err);
                        return;
                    }
                };

                let source_props = ReflectionProperties::parse(&source_obj.metadata().annotations);
                if !(source_props.allowed && source_props.allows(&mirror.namespace, &source.namespace))
                {
                    debug!(message = "source does not allow reflection here", %source, %mirror);
                    return;
                }

                let source_version = &source_obj.metadata().resource_version;
                if source_version.is_some() && *source_version == props.reflected_version {
                    return;
                }

                self.sync(&source_obj, &mirror).await;
            }
            Event::Deleted(_) => {
                self.indices.unlink_direct(&source, &mirror);
                self.indices.unlink_auto(&source, &mirror);
                self.indices.remove_properties(&mirror);
            }
        }
    }

    async fn on_source(&self, event: &Event<R>, source: QualifiedName, props: ReflectionProperties) {
        match event {
            Event::Added(resource) | Event::Modified(resource) => {
                self.indices.record_properties(
                    source.clone(),
                    ObservedProperties {
                        version: resource.metadata().resource_version.clone(),
                        reflection: props.clone(),
                    },
                );
                self.indices.clear_not_found(&source);

                self.fan_out_direct(resource, &source, &props).await;
                self.fan_out_auto(resource, &source, &props).await;
            }
            Event::Deleted(_) => {
                // Auto-mirrors die with their source; direct mirrors stay
                // and simply stop receiving updates.
                for mirror in self.indices.auto_mirrors(&source) {
                    self.delete_auto_mirror(&source, &mirror).await;
                }

                self.indices.remove_source(&source);
            }
        }
    }

    async fn fan_out_direct(
        &self,
        source_obj: &R,
        source: &QualifiedName,
        props: &ReflectionProperties,
    ) {
        let source_version = &source_obj.metadata().resource_version;

        for mirror in self.indices.direct_mirrors(source) {
            // A source that stopped allowing reflection leaves existing
            // mirrors untouched; they only stop updating.
            if !(props.allowed && props.allows(&mirror.namespace, &source.namespace)) {
                continue;
            }

            let reflected = self
                .indices
                .properties(&mirror)
                .and_then(|observed| observed.reflection.reflected_version);
            if source_version.is_some() && reflected == *source_version {
                continue;
            }

            self.sync(source_obj, &mirror).await;
        }
    }

    async fn fan_out_auto(
        &self,
        source_obj: &R,
        source: &QualifiedName,
        props: &ReflectionProperties,
    ) {
        let mirrors = self.indices.auto_mirrors(source);

        if !(props.allowed && props.auto_enabled) {
            for mirror in mirrors {
                self.delete_auto_mirror(source, &mirror).await;
            }

            return;
        }

        let targets: std::collections::BTreeSet<String> = self
            .namespaces
            .iter()
            .filter(|ns| props.auto_allows(ns.key(), &source.namespace))
            .map(|ns| ns.key().clone())
            .collect();
        let covered: std::collections::BTreeSet<String> =
            mirrors.iter().map(|mirror| mirror.namespace.clone()).collect();

        for namespace in targets.difference(&covered) {
            self.auto_create(source_obj, source, namespace).await;
        }

        let source_version = &source_obj.metadata().resource_version;
        for mirror in mirrors {
            if !targets.contains(&mirror.namespace) {
                // no longer permitted
                self.delete_auto_mirror(source, &mirror).await;
                continue;
            }

            let reflected = self
                .indices
                .properties(&mirror)
                .and_then(|observed| observed.reflection.reflected_version);
            if source_version.is_some() && reflected == *source_version {
                continue;
            }

            self.sync(source_obj, &mirror).await;
        }
    }

    /// Patch the mirror's payload and bookkeeping annotations to the
    /// source's current state. Only the managed paths are touched; labels,
    /// owner references and foreign annotations survive.
    async fn sync(&self, source_obj: &R, mirror: &QualifiedName) {
        let meta = source_obj.metadata();
        let source = QualifiedName::new(meta.namespace.clone(), meta.name.clone());
        let Some(version) = meta.resource_version.clone() else {
            return;
        };

        let mut ops = Vec::new();
        for (path, value) in source_obj.payload() {
            ops.push(json!({ "op": "add", "path": path, "value": value }));
        }
        ops.push(json!({
            "op": "add",
            "path": annotation_pointer(REFLECTED_VERSION),
            "value": version,
        }));
        ops.push(json!({
            "op": "add",
            "path": annotation_pointer(REFLECTED_AT),
            "value": Utc::now().to_rfc3339(),
        }));

        match self.gateway.patch(mirror, &Value::Array(ops)).await {
            Ok(()) => {
                counter!("reflector_syncs_total", 1, "kind" => R::KIND);
                debug!(message = "mirror synced", %source, %mirror, %version);
            }
            Err(GatewayError::NotFound) => {
                self.indices.unlink_direct(&source, mirror);
                self.indices.unlink_auto(&source, mirror);
            }
            Err(GatewayError::Conflict) => {
                debug!(message = "mirror patch conflicted, next event reconverges", %mirror);
            }
            Err(err) => {
                warn!(message = "patch mirror failed", %source, %mirror, %err);
            }
        }
    }

    async fn auto_create(&self, source_obj: &R, source: &QualifiedName, namespace: &str) {
        let Some(version) = source_obj.metadata().resource_version.clone() else {
            return;
        };
        let mirror = QualifiedName::new(namespace, source.name.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(REFLECTS.to_string(), source.to_string());
        annotations.insert(REFLECTED_VERSION.to_string(), version.clone());
        annotations.insert(REFLECTED_AT.to_string(), Utc::now().to_rfc3339());
        annotations.insert(AUTO_REFLECTS.to_string(), "true".to_string());

        let mirror_obj = source_obj.mirror(namespace, annotations);
        match self.gateway.create(&mirror_obj).await {
            Ok(()) => {
                counter!("reflector_auto_creates_total", 1, "kind" => R::KIND);
                debug!(message = "auto-mirror created", %source, %mirror);
                self.indices.link_auto(source.clone(), mirror);
            }
            Err(GatewayError::AlreadyExists) => {
                // Adopt the object only when auto mode owns it; a
                // user-created object with the same name is never
                // overwritten.
                match self.gateway.get(&mirror).await {
                    Ok(existing) => {
                        let existing_props =
                            ReflectionProperties::parse(&existing.metadata().annotations);
                        if existing_props.auto_reflects
                            && existing_props.reflects.as_ref() == Some(source)
                        {
                            self.indices.link_auto(source.clone(), mirror.clone());
                            if existing_props.reflected_version.as_deref() != Some(version.as_str()) {
                                self.sync(source_obj, &mirror).await;
                            }
                        } else {
                            debug!(
                                message = "name taken by a foreign object, leaving untouched",
                                %mirror
                            );
                        }
                    }
                    Err(err) => {
                        warn!(message = "inspect existing object failed", %mirror, %err);
                    }
                }
            }
            Err(err) => {
                warn!(message = "create auto-mirror failed", %source, %mirror, %err);
            }
        }
    }

    async fn delete_auto_mirror(&self, source: &QualifiedName, mirror: &QualifiedName) {
        match self.gateway.delete(mirror).await {
            Ok(()) => {
                counter!("reflector_auto_deletes_total", 1, "kind" => R::KIND);
                debug!(message = "auto-mirror deleted", %source, %mirror);
                self.indices.unlink_auto(source, mirror);
            }
            Err(err) => {
                // stays linked; the next source event retries
                warn!(message = "delete auto-mirror failed", %source, %mirror, %err);
            }
        }
    }

    async fn on_namespace_added(&self, namespace: &str) {
        if !self.namespaces.insert(namespace.to_string()) {
            return;
        }

        // Sources with auto mode enabled may claim the new namespace.
        for (source, observed) in self.indices.sources() {
            let props = observed.reflection;
            if !(props.allowed && props.auto_enabled) {
                continue;
            }
            if !props.auto_allows(namespace, &source.namespace) {
                continue;
            }

            match self.gateway.get(&source).await {
                Ok(source_obj) => self.auto_create(&source_obj, &source, namespace).await,
                Err(GatewayError::NotFound) => self.indices.mark_not_found(source),
                Err(err) => {
                    warn!(message = "fetch source failed", %source, %err);
                }
            }
        }
    }

    fn on_namespace_deleted(&self, namespace: &str) {
        self.namespaces.remove(namespace);
        // the cluster removes the objects; only the records go
        self.indices.drop_auto_mirrors_in(namespace);
    }

    fn on_namespace_session_closed(&self) {
        // Auto decisions depend on namespace knowledge, so everything
        // derived from the old session is stale.
        self.namespaces.clear();
        self.indices.clear_all();
    }
}

#[async_trait]
impl<R, G> EventHandler<R> for Reconciler<R, G>
where
    R: Reflected,
    G: Gateway<R>,
{
    async fn on_event(&self, event: &Event<R>) -> crate::Result<()> {
        self.handle_event(event).await
    }

    async fn on_session_closed(&self) {
        self.indices.clear_all();
    }
}

/// Feeds namespace watch events into a kind's reconciler.
pub struct NamespaceHandler<R, G> {
    reconciler: Arc<Reconciler<R, G>>,
}

impl<R, G> NamespaceHandler<R, G> {
    pub fn new(reconciler: Arc<Reconciler<R, G>>) -> Self {
        NamespaceHandler { reconciler }
    }
}

#[async_trait]
impl<R, G> EventHandler<Namespace> for NamespaceHandler<R, G>
where
    R: Reflected,
    G: Gateway<R>,
{
    async fn on_event(&self, event: &Event<Namespace>) -> crate::Result<()> {
        match event {
            Event::Added(namespace) => {
                self.reconciler
                    .on_namespace_added(&namespace.metadata.name)
                    .await;
            }
            Event::Modified(namespace) => {
                // nothing reacts to namespace changes, but knowledge of its
                // existence is kept fresh
                self.reconciler
                    .namespaces
                    .insert(namespace.metadata.name.clone());
            }
            Event::Deleted(namespace) => {
                self.reconciler.on_namespace_deleted(&namespace.metadata.name);
            }
        }

        Ok(())
    }

    async fn on_session_closed(&self) {
        self.reconciler.on_namespace_session_closed();
    }
}

/// RFC 6901 pointer to an annotation key; `/` and `~` in the key must be
/// escaped.
fn annotation_pointer(key: &str) -> String {
    let escaped = key.replace('~', "~0").replace('/', "~1");

    format!("/metadata/annotations/{escaped}")
}
