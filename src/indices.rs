//! In-memory indices binding sources to their mirrors.
//!
//! All state here is rebuilt from watch events; nothing survives a session
//! restart. Single-key operations are atomic, cross-key reads are not: a
//! fan-out that races a concurrent update converges on the next event.

use dashmap::{DashMap, DashSet};

use crate::annotations::{QualifiedName, ReflectionProperties};

/// Last observed state of a resource: its server revision and the parse of
/// its reflection annotations.
#[derive(Clone, Debug, Default)]
pub struct ObservedProperties {
    pub version: Option<String>,
    pub reflection: ReflectionProperties,
}

/// The four per-kind indices. One instance exists per mirrored kind, so a
/// session wipe of one kind never disturbs the other.
#[derive(Default)]
pub struct ReflectionIndices {
    /// source -> user-created mirrors that name it in `reflects`
    direct: DashMap<QualifiedName, DashSet<QualifiedName>>,

    /// source -> mirrors the engine created on its behalf
    auto: DashMap<QualifiedName, DashSet<QualifiedName>>,

    /// last-seen parse for any observed resource, sources and mirrors alike
    properties: DashMap<QualifiedName, ObservedProperties>,

    /// sources a mirror references but which do not exist; suppresses
    /// repeated lookups until a source event invalidates the entry
    not_found: DashSet<QualifiedName>,
}

impl ReflectionIndices {
    pub fn record_properties(&self, name: QualifiedName, observed: ObservedProperties) {
        self.properties.insert(name, observed);
    }

    pub fn remove_properties(&self, name: &QualifiedName) {
        self.properties.remove(name);
    }

    pub fn properties(&self, name: &QualifiedName) -> Option<ObservedProperties> {
        self.properties.get(name).map(|entry| entry.value().clone())
    }

    /// Every observed resource without a `reflects` annotation.
    pub fn sources(&self) -> Vec<(QualifiedName, ObservedProperties)> {
        self.properties
            .iter()
            .filter(|entry| entry.value().reflection.reflects.is_none())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// A mirror is direct or auto, never both; linking one way unlinks the
    /// other.
    pub fn link_direct(&self, source: QualifiedName, mirror: QualifiedName) {
        self.unlink_auto(&source, &mirror);
        self.direct.entry(source).or_default().insert(mirror);
    }

    pub fn unlink_direct(&self, source: &QualifiedName, mirror: &QualifiedName) {
        if let Some(mirrors) = self.direct.get(source) {
            mirrors.remove(mirror);
        }
    }

    pub fn direct_mirrors(&self, source: &QualifiedName) -> Vec<QualifiedName> {
        self.direct
            .get(source)
            .map(|mirrors| mirrors.iter().map(|m| m.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn link_auto(&self, source: QualifiedName, mirror: QualifiedName) {
        self.unlink_direct(&source, &mirror);
        self.auto.entry(source).or_default().insert(mirror);
    }

    pub fn unlink_auto(&self, source: &QualifiedName, mirror: &QualifiedName) {
        if let Some(mirrors) = self.auto.get(source) {
            mirrors.remove(mirror);
        }
    }

    pub fn auto_mirrors(&self, source: &QualifiedName) -> Vec<QualifiedName> {
        self.auto
            .get(source)
            .map(|mirrors| mirrors.iter().map(|m| m.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Forget auto-mirror records living in a deleted namespace. The
    /// cluster removes the objects themselves.
    pub fn drop_auto_mirrors_in(&self, namespace: &str) {
        for entry in self.auto.iter() {
            entry.value().retain(|mirror| mirror.namespace != namespace);
        }
    }

    pub fn mark_not_found(&self, source: QualifiedName) {
        self.not_found.insert(source);
    }

    pub fn clear_not_found(&self, source: &QualifiedName) {
        self.not_found.remove(source);
    }

    pub fn is_not_found(&self, source: &QualifiedName) -> bool {
        self.not_found.contains(source)
    }

    /// Drop everything recorded about a deleted source.
    pub fn remove_source(&self, source: &QualifiedName) {
        self.direct.remove(source);
        self.auto.remove(source);
        self.properties.remove(source);
        self.not_found.remove(source);
    }

    /// Session-close wipe. The owning reconciler runs serially, so from its
    /// perspective the wipe is atomic; namespace-driven writers racing this
    /// converge on the next session's events.
    pub fn clear_all(&self) {
        self.direct.clear();
        self.auto.clear();
        self.properties.clear();
        self.not_found.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qn(namespace: &str, name: &str) -> QualifiedName {
        QualifiedName::new(namespace, name)
    }

    #[test]
    fn direct_and_auto_links_are_disjoint() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "s");
        let mirror = qn("ns-dst", "s");

        indices.link_direct(source.clone(), mirror.clone());
        assert_eq!(indices.direct_mirrors(&source), vec![mirror.clone()]);
        assert!(indices.auto_mirrors(&source).is_empty());

        // re-linking as auto moves the mirror over
        indices.link_auto(source.clone(), mirror.clone());
        assert!(indices.direct_mirrors(&source).is_empty());
        assert_eq!(indices.auto_mirrors(&source), vec![mirror.clone()]);

        indices.link_direct(source.clone(), mirror.clone());
        assert_eq!(indices.direct_mirrors(&source), vec![mirror]);
        assert!(indices.auto_mirrors(&source).is_empty());
    }

    #[test]
    fn unlink() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "s");
        let a = qn("a", "s");
        let b = qn("b", "s");

        indices.link_auto(source.clone(), a.clone());
        indices.link_auto(source.clone(), b.clone());
        indices.unlink_auto(&source, &a);
        assert_eq!(indices.auto_mirrors(&source), vec![b]);
    }

    #[test]
    fn drop_auto_mirrors_in_namespace() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "cm");

        indices.link_auto(source.clone(), qn("a", "cm"));
        indices.link_auto(source.clone(), qn("b", "cm"));
        indices.drop_auto_mirrors_in("a");

        assert_eq!(indices.auto_mirrors(&source), vec![qn("b", "cm")]);
    }

    #[test]
    fn not_found_tracking() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "gone");

        assert!(!indices.is_not_found(&source));
        indices.mark_not_found(source.clone());
        assert!(indices.is_not_found(&source));
        indices.clear_not_found(&source);
        assert!(!indices.is_not_found(&source));
    }

    #[test]
    fn clear_all_empties_every_index() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "s");
        let mirror = qn("ns-dst", "s");

        indices.link_direct(source.clone(), mirror.clone());
        indices.link_auto(source.clone(), qn("a", "s"));
        indices.record_properties(source.clone(), ObservedProperties::default());
        indices.mark_not_found(qn("ns-src", "gone"));

        indices.clear_all();

        assert!(indices.direct_mirrors(&source).is_empty());
        assert!(indices.auto_mirrors(&source).is_empty());
        assert!(indices.properties(&source).is_none());
        assert!(!indices.is_not_found(&qn("ns-src", "gone")));
        assert!(indices.sources().is_empty());
    }

    #[test]
    fn sources_excludes_mirrors() {
        let indices = ReflectionIndices::default();
        let source = qn("ns-src", "s");
        let mirror = qn("ns-dst", "s");

        indices.record_properties(source.clone(), ObservedProperties::default());
        indices.record_properties(
            mirror,
            ObservedProperties {
                version: Some("3".into()),
                reflection: crate::annotations::ReflectionProperties {
                    reflects: Some(source.clone()),
                    ..Default::default()
                },
            },
        );

        let sources = indices.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, source);
    }
}
