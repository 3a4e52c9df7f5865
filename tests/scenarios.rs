//! End-to-end reconciliation scenarios against an in-memory cluster.
//!
//! Events are fed to the reconcilers directly, exactly as the watch
//! consumers would; the mock gateway plays the cluster, applying patches
//! and recording mutations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kubernetes::{ConfigMap, Namespace, ObjectMeta, Secret};
use serde_json::Value;

use reflector::annotations::{
    QualifiedName, AUTO_REFLECTS, REFLECTED_AT, REFLECTED_VERSION, REFLECTION_ALLOWED,
    REFLECTION_ALLOWED_NAMESPACES, REFLECTION_AUTO_ENABLED, REFLECTION_AUTO_NAMESPACES, REFLECTS,
};
use reflector::gateway::{Gateway, GatewayError};
use reflector::reconciler::{NamespaceHandler, Reconciler, Reflected};
use reflector::watcher::{Event, EventHandler};

/// An in-memory stand-in for the cluster: holds the objects of one kind,
/// applies JSON patches, and counts mutations.
struct MockCluster<R> {
    objects: Mutex<BTreeMap<QualifiedName, R>>,
    revision: Mutex<u64>,
    patches: Mutex<u64>,
}

impl<R: Reflected> MockCluster<R> {
    fn new() -> Arc<Self> {
        Arc::new(MockCluster {
            objects: Mutex::new(BTreeMap::new()),
            revision: Mutex::new(100),
            patches: Mutex::new(0),
        })
    }

    fn next_revision(&self) -> String {
        let mut revision = self.revision.lock().unwrap();
        *revision += 1;
        revision.to_string()
    }

    fn insert(&self, object: R) {
        let meta = object.metadata();
        let name = QualifiedName::new(meta.namespace.clone(), meta.name.clone());
        self.objects.lock().unwrap().insert(name, object);
    }

    fn get(&self, namespace: &str, name: &str) -> Option<R> {
        self.objects
            .lock()
            .unwrap()
            .get(&QualifiedName::new(namespace, name))
            .cloned()
    }

    fn patch_count(&self) -> u64 {
        *self.patches.lock().unwrap()
    }
}

#[async_trait]
impl<R: Reflected> Gateway<R> for MockCluster<R> {
    async fn get(&self, name: &QualifiedName) -> Result<R, GatewayError> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(GatewayError::NotFound)
    }

    async fn patch(&self, name: &QualifiedName, patch: &Value) -> Result<(), GatewayError> {
        let revision = self.next_revision();
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(name).ok_or(GatewayError::NotFound)?;

        let mut doc = serde_json::to_value(&*object).unwrap();
        for op in patch.as_array().expect("a patch is an operation array") {
            assert_eq!(op["op"], "add", "the engine only emits add operations");
            set_pointer(&mut doc, op["path"].as_str().unwrap(), op["value"].clone());
        }
        set_pointer(&mut doc, "/metadata/resourceVersion", Value::String(revision));

        *object = serde_json::from_value(doc).unwrap();
        *self.patches.lock().unwrap() += 1;

        Ok(())
    }

    async fn create(&self, resource: &R) -> Result<(), GatewayError> {
        let meta = resource.metadata();
        let name = QualifiedName::new(meta.namespace.clone(), meta.name.clone());
        let revision = self.next_revision();

        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&name) {
            return Err(GatewayError::AlreadyExists);
        }

        let mut doc = serde_json::to_value(resource).unwrap();
        set_pointer(&mut doc, "/metadata/resourceVersion", Value::String(revision));
        objects.insert(name, serde_json::from_value(doc).unwrap());

        Ok(())
    }

    async fn delete(&self, name: &QualifiedName) -> Result<(), GatewayError> {
        self.objects.lock().unwrap().remove(name);

        Ok(())
    }
}

/// Minimal RFC 6901 pointer set, creating intermediate objects as needed.
fn set_pointer(doc: &mut Value, pointer: &str, value: Value) {
    let mut parts: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|part| part.replace("~1", "/").replace("~0", "~"))
        .collect();
    let last = parts.pop().unwrap();

    let mut target = doc;
    for part in parts {
        let object = target.as_object_mut().unwrap();
        target = object
            .entry(part)
            .or_insert_with(|| Value::Object(Default::default()));
    }

    target.as_object_mut().unwrap().insert(last, value);
}

fn object_meta(
    namespace: &str,
    name: &str,
    revision: &str,
    annotations: &[(&str, &str)],
) -> ObjectMeta {
    ObjectMeta {
        name: name.to_string(),
        namespace: namespace.to_string(),
        resource_version: Some(revision.to_string()),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

fn secret(
    namespace: &str,
    name: &str,
    revision: &str,
    data: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> Secret {
    Secret {
        metadata: object_meta(namespace, name, revision, annotations),
        data: data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        binary_data: BTreeMap::new(),
        type_: Some("Opaque".to_string()),
    }
}

fn configmap(
    namespace: &str,
    name: &str,
    revision: &str,
    data: &[(&str, &str)],
    annotations: &[(&str, &str)],
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(namespace, name, revision, annotations),
        data: data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        binary_data: BTreeMap::new(),
    }
}

fn namespace_obj(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: name.to_string(),
            ..Default::default()
        },
    }
}

async fn observe<R: Reflected, G: Gateway<R>>(reconciler: &Reconciler<R, G>, event: Event<R>) {
    reconciler.on_event(&event).await.unwrap();
}

async fn add_namespaces<R: Reflected, G: Gateway<R>>(
    handler: &NamespaceHandler<R, G>,
    names: &[&str],
) {
    for name in names {
        handler
            .on_event(&Event::Added(namespace_obj(name)))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn direct_sync() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));

    let source = secret(
        "ns-src",
        "s",
        "1",
        &[("a", "MQ==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    let mirror = secret("ns-dst", "s", "9", &[], &[(REFLECTS, "ns-src/s")]);
    cluster.insert(source.clone());
    cluster.insert(mirror.clone());

    observe(&reconciler, Event::Added(source)).await;
    observe(&reconciler, Event::Added(mirror)).await;

    let synced = cluster.get("ns-dst", "s").unwrap();
    assert_eq!(synced.data.get("a").map(String::as_str), Some("MQ=="));
    assert_eq!(
        synced.metadata.annotations.get(REFLECTED_VERSION).map(String::as_str),
        Some("1")
    );
    assert!(synced.metadata.annotations.contains_key(REFLECTED_AT));

    // mutate the source; the mirror follows within one event cycle
    let source = secret(
        "ns-src",
        "s",
        "2",
        &[("a", "Mg==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    cluster.insert(source.clone());
    observe(&reconciler, Event::Modified(source)).await;

    let synced = cluster.get("ns-dst", "s").unwrap();
    assert_eq!(synced.data.get("a").map(String::as_str), Some("Mg=="));
    assert_eq!(
        synced.metadata.annotations.get(REFLECTED_VERSION).map(String::as_str),
        Some("2")
    );
}

#[tokio::test]
async fn auto_fan_out() {
    let cluster = MockCluster::<ConfigMap>::new();
    let reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "a", "b", "c"]).await;

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
        (REFLECTION_AUTO_NAMESPACES, "a,b"),
    ];
    let source = configmap("ns-src", "cm", "1", &[("k", "v")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source)).await;

    for namespace in ["a", "b"] {
        let mirror = cluster.get(namespace, "cm").unwrap();
        assert_eq!(mirror.data.get("k").map(String::as_str), Some("v"));
        assert_eq!(
            mirror.metadata.annotations.get(AUTO_REFLECTS).map(String::as_str),
            Some("true")
        );
        assert_eq!(
            mirror.metadata.annotations.get(REFLECTS).map(String::as_str),
            Some("ns-src/cm")
        );
    }
    assert!(cluster.get("c", "cm").is_none());
    assert!(cluster.get("ns-src", "cm").unwrap().metadata.annotations.get(AUTO_REFLECTS).is_none());

    // tightening the auto list deletes the no-longer-covered mirror
    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
        (REFLECTION_AUTO_NAMESPACES, "a"),
    ];
    let source = configmap("ns-src", "cm", "2", &[("k", "v")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Modified(source)).await;

    assert!(cluster.get("b", "cm").is_none());
    let mirror = cluster.get("a", "cm").unwrap();
    assert_eq!(
        mirror.metadata.annotations.get(REFLECTED_VERSION).map(String::as_str),
        Some("2")
    );
}

#[tokio::test]
async fn regex_namespaces() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "team-red", "team-blue", "infra"]).await;

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_ALLOWED_NAMESPACES, "team-.*"),
        (REFLECTION_AUTO_ENABLED, "true"),
        (REFLECTION_AUTO_NAMESPACES, "team-.*"),
    ];
    let source = secret("ns-src", "s", "1", &[("a", "MQ==")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source)).await;

    assert!(cluster.get("team-red", "s").is_some());
    assert!(cluster.get("team-blue", "s").is_some());
    assert!(cluster.get("infra", "s").is_none());
}

#[tokio::test]
async fn source_deletion_removes_auto_mirrors_only() {
    let cluster = MockCluster::<ConfigMap>::new();
    let reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "a", "b", "c"]).await;

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
        (REFLECTION_AUTO_NAMESPACES, "a,b"),
    ];
    let source = configmap("ns-src", "cm", "1", &[("k", "v")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source.clone())).await;

    // a user-created mirror rides along
    let direct = configmap("c", "cm-copy", "5", &[], &[(REFLECTS, "ns-src/cm")]);
    cluster.insert(direct.clone());
    observe(&reconciler, Event::Added(direct)).await;

    assert!(cluster.get("a", "cm").is_some());
    assert!(cluster.get("b", "cm").is_some());

    observe(&reconciler, Event::Deleted(source)).await;

    // auto-mirrors die with the source, the direct mirror stays
    assert!(cluster.get("a", "cm").is_none());
    assert!(cluster.get("b", "cm").is_none());
    assert!(cluster.get("c", "cm-copy").is_some());
}

#[tokio::test]
async fn session_restart_rebuilds_links_without_spurious_syncs() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));

    let source = secret(
        "ns-src",
        "s",
        "1",
        &[("a", "MQ==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    let mirror = secret("ns-dst", "s", "9", &[], &[(REFLECTS, "ns-src/s")]);
    cluster.insert(source.clone());
    cluster.insert(mirror.clone());
    observe(&reconciler, Event::Added(source)).await;
    observe(&reconciler, Event::Added(mirror)).await;

    let name = QualifiedName::new("ns-src", "s");
    assert_eq!(reconciler.indices().direct_mirrors(&name).len(), 1);

    // transport fault ends the session; all indices empty until repopulated
    EventHandler::<Secret>::on_session_closed(&*reconciler).await;
    assert!(reconciler.indices().direct_mirrors(&name).is_empty());
    assert!(reconciler.indices().properties(&name).is_none());

    // the next session relists; links are rediscovered and versions match,
    // so nothing is patched again
    let patches = cluster.patch_count();
    let source = cluster.get("ns-src", "s").unwrap();
    let mirror = cluster.get("ns-dst", "s").unwrap();
    observe(&reconciler, Event::Added(source)).await;
    observe(&reconciler, Event::Added(mirror)).await;

    assert_eq!(cluster.patch_count(), patches);
    assert_eq!(reconciler.indices().direct_mirrors(&name).len(), 1);
}

#[tokio::test]
async fn permission_revocation_stops_syncs_but_keeps_mirrors() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));

    let source = secret(
        "ns-src",
        "s",
        "1",
        &[("a", "MQ==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    let mirror = secret("ns-dst", "s", "9", &[], &[(REFLECTS, "ns-src/s")]);
    cluster.insert(source.clone());
    cluster.insert(mirror.clone());
    observe(&reconciler, Event::Added(source)).await;
    observe(&reconciler, Event::Added(mirror)).await;

    let patches = cluster.patch_count();
    assert!(patches > 0);

    // the source revokes reflection and changes its payload
    let source = secret(
        "ns-src",
        "s",
        "2",
        &[("a", "Mg==")],
        &[(REFLECTION_ALLOWED, "false")],
    );
    cluster.insert(source.clone());
    observe(&reconciler, Event::Modified(source)).await;

    // a mirror-side edit cannot sneak a sync through either
    let mirror = cluster.get("ns-dst", "s").unwrap();
    observe(&reconciler, Event::Modified(mirror)).await;

    assert_eq!(cluster.patch_count(), patches);
    let stale = cluster.get("ns-dst", "s").unwrap();
    assert_eq!(stale.data.get("a").map(String::as_str), Some("MQ=="));
}

#[tokio::test]
async fn auto_create_never_overwrites_foreign_objects() {
    let cluster = MockCluster::<ConfigMap>::new();
    let reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "a"]).await;

    // someone already owns a/cm
    let foreign = configmap("a", "cm", "50", &[("k", "theirs")], &[]);
    cluster.insert(foreign);

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
    ];
    let source = configmap("ns-src", "cm", "1", &[("k", "ours")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source)).await;

    let untouched = cluster.get("a", "cm").unwrap();
    assert_eq!(untouched.data.get("k").map(String::as_str), Some("theirs"));
    assert!(untouched.metadata.annotations.get(REFLECTS).is_none());
    assert!(reconciler
        .indices()
        .auto_mirrors(&QualifiedName::new("ns-src", "cm"))
        .is_empty());
}

#[tokio::test]
async fn new_namespace_receives_auto_mirrors() {
    let cluster = MockCluster::<ConfigMap>::new();
    let reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "a"]).await;

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
    ];
    let source = configmap("ns-src", "cm", "1", &[("k", "v")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source)).await;
    assert!(cluster.get("a", "cm").is_some());

    add_namespaces(&namespaces, &["b"]).await;

    let mirror = cluster.get("b", "cm").unwrap();
    assert_eq!(
        mirror.metadata.annotations.get(AUTO_REFLECTS).map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn deleted_namespace_drops_auto_records() {
    let cluster = MockCluster::<ConfigMap>::new();
    let reconciler = Arc::new(Reconciler::<ConfigMap, _>::new(cluster.clone()));
    let namespaces = NamespaceHandler::new(reconciler.clone());
    add_namespaces(&namespaces, &["ns-src", "a", "b"]).await;

    let annotations = [
        (REFLECTION_ALLOWED, "true"),
        (REFLECTION_AUTO_ENABLED, "true"),
    ];
    let source = configmap("ns-src", "cm", "1", &[("k", "v")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source.clone())).await;

    namespaces
        .on_event(&Event::Deleted(namespace_obj("b")))
        .await
        .unwrap();

    let name = QualifiedName::new("ns-src", "cm");
    assert_eq!(
        reconciler.indices().auto_mirrors(&name),
        vec![QualifiedName::new("a", "cm")]
    );

    // a later source event does not resurrect the namespace
    let source = configmap("ns-src", "cm", "2", &[("k", "v2")], &annotations);
    cluster.insert(source.clone());
    observe(&reconciler, Event::Modified(source)).await;
    assert_eq!(
        reconciler.indices().auto_mirrors(&name),
        vec![QualifiedName::new("a", "cm")]
    );
}

#[tokio::test]
async fn deleted_mirror_is_forgotten() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));

    let source = secret(
        "ns-src",
        "s",
        "1",
        &[("a", "MQ==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    let mirror = secret("ns-dst", "s", "9", &[], &[(REFLECTS, "ns-src/s")]);
    cluster.insert(source.clone());
    cluster.insert(mirror.clone());
    observe(&reconciler, Event::Added(source)).await;
    observe(&reconciler, Event::Added(mirror.clone())).await;

    let name = QualifiedName::new("ns-src", "s");
    assert_eq!(reconciler.indices().direct_mirrors(&name).len(), 1);

    observe(&reconciler, Event::Deleted(mirror)).await;
    assert!(reconciler.indices().direct_mirrors(&name).is_empty());
    // the source itself is unaffected
    assert!(cluster.get("ns-src", "s").is_some());
}

#[tokio::test]
async fn missing_source_is_cached_until_it_appears() {
    let cluster = MockCluster::<Secret>::new();
    let reconciler = Arc::new(Reconciler::<Secret, _>::new(cluster.clone()));

    let mirror = secret("ns-dst", "s", "9", &[], &[(REFLECTS, "ns-src/s")]);
    cluster.insert(mirror.clone());
    observe(&reconciler, Event::Added(mirror.clone())).await;

    let name = QualifiedName::new("ns-src", "s");
    assert!(reconciler.indices().is_not_found(&name));

    // the source shows up; its event clears the cache and syncs the mirror
    let source = secret(
        "ns-src",
        "s",
        "1",
        &[("a", "MQ==")],
        &[(REFLECTION_ALLOWED, "true")],
    );
    cluster.insert(source.clone());
    observe(&reconciler, Event::Added(source)).await;

    assert!(!reconciler.indices().is_not_found(&name));
    let synced = cluster.get("ns-dst", "s").unwrap();
    assert_eq!(synced.data.get("a").map(String::as_str), Some("MQ=="));
}
