//! The reflection control annotations.
//!
//! Every key shares the `reflector.v1.k8s.emberstack.com/` prefix. The keys
//! and their value formats are a wire contract with user manifests; changing
//! them breaks deployed clusters.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Prefix shared by all reflection annotations.
pub const PREFIX: &str = "reflector.v1.k8s.emberstack.com/";

/// On a source: permits reflection of this object.
pub const REFLECTION_ALLOWED: &str = "reflector.v1.k8s.emberstack.com/reflection-allowed";

/// On a source: namespaces mirrors may live in.
pub const REFLECTION_ALLOWED_NAMESPACES: &str =
    "reflector.v1.k8s.emberstack.com/reflection-allowed-namespaces";

/// On a source: requests automatic creation of mirrors.
pub const REFLECTION_AUTO_ENABLED: &str =
    "reflector.v1.k8s.emberstack.com/reflection-auto-enabled";

/// On a source: restricts automatic creation beyond the allowed list.
pub const REFLECTION_AUTO_NAMESPACES: &str =
    "reflector.v1.k8s.emberstack.com/reflection-auto-namespaces";

/// On a mirror: the `namespace/name` of the source it tracks.
pub const REFLECTS: &str = "reflector.v1.k8s.emberstack.com/reflects";

/// On a mirror: the source resourceVersion at the last successful sync.
pub const REFLECTED_VERSION: &str = "reflector.v1.k8s.emberstack.com/reflected-version";

/// On a mirror: wall-clock timestamp of the last successful sync.
pub const REFLECTED_AT: &str = "reflector.v1.k8s.emberstack.com/reflected-at";

/// On a mirror: set by the engine on mirrors it created itself.
pub const AUTO_REFLECTS: &str = "reflector.v1.k8s.emberstack.com/auto-reflects";

/// A `<namespace, name>` pair, the only identity resources have here.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    pub namespace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        QualifiedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse the `<namespace>/<name>` string form. Both parts must be
    /// non-empty and the value must contain exactly one slash.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }

        Some(QualifiedName::new(namespace, name))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One clause of a namespace list annotation: an exact namespace name or a
/// full-anchored regular expression.
#[derive(Clone, Debug)]
pub enum Matcher {
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    /// A token is a regex only when it carries a character a namespace name
    /// cannot; plain tokens stay literal so that e.g. `prod-1` never
    /// pattern-matches `prod-x`. This heuristic is part of the annotation
    /// contract.
    fn parse(token: &str) -> Option<Matcher> {
        let literal = token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if literal {
            return Some(Matcher::Literal(token.to_string()));
        }

        match Regex::new(&format!("^(?:{token})$")) {
            Ok(pattern) => Some(Matcher::Pattern(pattern)),
            Err(err) => {
                warn!(message = "invalid namespace pattern, skipping", token, %err);
                None
            }
        }
    }

    pub fn matches(&self, namespace: &str) -> bool {
        match self {
            Matcher::Literal(literal) => literal == namespace,
            Matcher::Pattern(pattern) => pattern.is_match(namespace),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Matcher::Literal(a), Matcher::Literal(b)) => a == b,
            (Matcher::Pattern(a), Matcher::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// True when any matcher accepts the namespace. An empty list accepts
/// nothing.
pub fn matches(namespace: &str, matchers: &[Matcher]) -> bool {
    matchers.iter().any(|matcher| matcher.matches(namespace))
}

/// Split a comma-separated matcher list, dropping empty and invalid tokens.
fn parse_matchers(value: &str) -> Vec<Matcher> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(Matcher::parse)
        .collect()
}

/// The reflection state a resource declares through its annotations.
#[derive(Clone, Debug, Default)]
pub struct ReflectionProperties {
    /// Source permits reflection.
    pub allowed: bool,

    /// Namespaces mirrors may live in. `None` (annotation absent) leaves
    /// every namespace permitted; an explicitly empty list permits none
    /// beyond the source's own namespace.
    pub allowed_namespaces: Option<Vec<Matcher>>,

    /// Source requests auto-creation of mirrors.
    pub auto_enabled: bool,

    /// Namespaces auto-mirrors may be created in; falls back to
    /// `allowed_namespaces` when the annotation is absent.
    pub auto_namespaces: Option<Vec<Matcher>>,

    /// On a mirror: the source it tracks.
    pub reflects: Option<QualifiedName>,

    /// On a mirror: source resourceVersion at the last successful sync.
    pub reflected_version: Option<String>,

    /// On a mirror: wall-clock of the last successful sync.
    pub reflected_at: Option<DateTime<Utc>>,

    /// On a mirror: created by the auto mechanism.
    pub auto_reflects: bool,
}

impl ReflectionProperties {
    pub fn parse(annotations: &BTreeMap<String, String>) -> Self {
        let allowed = parse_bool(annotations, REFLECTION_ALLOWED);
        let allowed_namespaces = annotations
            .get(REFLECTION_ALLOWED_NAMESPACES)
            .map(|value| parse_matchers(value));
        let auto_enabled = parse_bool(annotations, REFLECTION_AUTO_ENABLED);
        let auto_namespaces = annotations
            .get(REFLECTION_AUTO_NAMESPACES)
            .map(|value| parse_matchers(value));

        let reflects = annotations.get(REFLECTS).and_then(|value| {
            let parsed = QualifiedName::parse(value);
            if parsed.is_none() {
                warn!(message = "malformed reflects annotation, ignoring", value);
            }

            parsed
        });
        let reflected_version = annotations.get(REFLECTED_VERSION).cloned();
        let reflected_at = annotations.get(REFLECTED_AT).and_then(|value| {
            match DateTime::parse_from_rfc3339(value) {
                Ok(at) => Some(at.with_timezone(&Utc)),
                Err(err) => {
                    warn!(message = "malformed reflected-at annotation, ignoring", value, %err);
                    None
                }
            }
        });
        let auto_reflects = parse_bool(annotations, AUTO_REFLECTS);

        ReflectionProperties {
            allowed,
            allowed_namespaces,
            auto_enabled,
            auto_namespaces,
            reflects,
            reflected_version,
            reflected_at,
            auto_reflects,
        }
    }

    /// May a mirror of this source live in `namespace`? The source's own
    /// namespace is always permitted.
    pub fn allows(&self, namespace: &str, source_namespace: &str) -> bool {
        if namespace == source_namespace {
            return true;
        }

        match &self.allowed_namespaces {
            None => true,
            Some(matchers) => matches(namespace, matchers),
        }
    }

    /// Should an auto-mirror exist in `namespace`? Auto-mirrors never live
    /// beside their source.
    pub fn auto_allows(&self, namespace: &str, source_namespace: &str) -> bool {
        if namespace == source_namespace {
            return false;
        }

        match self
            .auto_namespaces
            .as_ref()
            .or(self.allowed_namespaces.as_ref())
        {
            None => true,
            Some(matchers) => matches(namespace, matchers),
        }
    }
}

/// Absent means false; only a (case-insensitive) `true` enables.
fn parse_bool(annotations: &BTreeMap<String, String>, key: &str) -> bool {
    match annotations.get(key) {
        None => false,
        Some(value) if value.eq_ignore_ascii_case("true") => true,
        Some(value) => {
            if !value.is_empty() {
                warn!(message = "unrecognized boolean annotation value", key, value);
            }

            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn qualified_name_parse() {
        assert_eq!(
            QualifiedName::parse("default/registry-auth"),
            Some(QualifiedName::new("default", "registry-auth"))
        );
        assert_eq!(QualifiedName::parse("no-slash"), None);
        assert_eq!(QualifiedName::parse("/name"), None);
        assert_eq!(QualifiedName::parse("ns/"), None);
        assert_eq!(QualifiedName::parse("a/b/c"), None);
    }

    #[test]
    fn qualified_name_display() {
        let qn = QualifiedName::new("kube-system", "ca-bundle");
        assert_eq!(qn.to_string(), "kube-system/ca-bundle");
    }

    #[test]
    fn booleans() {
        let props = ReflectionProperties::parse(&annotations(&[(REFLECTION_ALLOWED, "true")]));
        assert!(props.allowed);

        let props = ReflectionProperties::parse(&annotations(&[(REFLECTION_ALLOWED, "TRUE")]));
        assert!(props.allowed);

        let props = ReflectionProperties::parse(&annotations(&[(REFLECTION_ALLOWED, "yes")]));
        assert!(!props.allowed);

        let props = ReflectionProperties::parse(&annotations(&[]));
        assert!(!props.allowed);
        assert!(!props.auto_enabled);
        assert!(!props.auto_reflects);
    }

    #[test]
    fn matcher_heuristic() {
        // plain names stay literal, even when they would be valid regexes
        let props = ReflectionProperties::parse(&annotations(&[(
            REFLECTION_ALLOWED_NAMESPACES,
            "prod-1, team_a",
        )]));
        assert_eq!(
            props.allowed_namespaces,
            Some(vec![
                Matcher::Literal("prod-1".into()),
                Matcher::Literal("team_a".into())
            ])
        );

        // metacharacters switch a token to pattern matching
        let props = ReflectionProperties::parse(&annotations(&[(
            REFLECTION_ALLOWED_NAMESPACES,
            "team-.*",
        )]));
        let matchers = props.allowed_namespaces.unwrap();
        assert!(matches("team-red", &matchers));
        assert!(matches("team-blue", &matchers));
        assert!(!matches("infra", &matchers));
        // full-anchored: no partial matches
        assert!(!matches("x-team-red", &matchers));
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let props = ReflectionProperties::parse(&annotations(&[(
            REFLECTION_ALLOWED_NAMESPACES,
            "team-(, dev",
        )]));
        assert_eq!(
            props.allowed_namespaces,
            Some(vec![Matcher::Literal("dev".into())])
        );
    }

    #[test]
    fn empty_tokens_are_dropped() {
        let props = ReflectionProperties::parse(&annotations(&[(
            REFLECTION_ALLOWED_NAMESPACES,
            " , dev, ,staging, ",
        )]));
        assert_eq!(
            props.allowed_namespaces,
            Some(vec![
                Matcher::Literal("dev".into()),
                Matcher::Literal("staging".into())
            ])
        );
    }

    #[test]
    fn absent_namespace_list_permits_everywhere() {
        let props = ReflectionProperties::parse(&annotations(&[(REFLECTION_ALLOWED, "true")]));
        assert!(props.allows("ns-dst", "ns-src"));
        assert!(props.auto_allows("ns-dst", "ns-src"));
    }

    #[test]
    fn empty_namespace_list_permits_same_namespace_only() {
        let props = ReflectionProperties::parse(&annotations(&[
            (REFLECTION_ALLOWED, "true"),
            (REFLECTION_ALLOWED_NAMESPACES, ""),
        ]));
        assert!(props.allows("ns-src", "ns-src"));
        assert!(!props.allows("ns-dst", "ns-src"));
    }

    #[test]
    fn auto_namespaces_default_to_allowed() {
        let props = ReflectionProperties::parse(&annotations(&[
            (REFLECTION_ALLOWED, "true"),
            (REFLECTION_ALLOWED_NAMESPACES, "dev,staging"),
            (REFLECTION_AUTO_ENABLED, "true"),
        ]));
        assert!(props.auto_allows("dev", "ns-src"));
        assert!(!props.auto_allows("prod", "ns-src"));

        // an explicit auto list narrows further
        let props = ReflectionProperties::parse(&annotations(&[
            (REFLECTION_ALLOWED_NAMESPACES, "dev,staging"),
            (REFLECTION_AUTO_NAMESPACES, "dev"),
        ]));
        assert!(props.auto_allows("dev", "ns-src"));
        assert!(!props.auto_allows("staging", "ns-src"));
    }

    #[test]
    fn own_namespace_rules() {
        let props = ReflectionProperties::parse(&annotations(&[
            (REFLECTION_ALLOWED, "true"),
            (REFLECTION_ALLOWED_NAMESPACES, "dev"),
        ]));
        // a mirror beside its source is always permitted
        assert!(props.allows("ns-src", "ns-src"));
        assert!(!props.allows("staging", "ns-src"));

        // auto never targets the source namespace
        assert!(!props.auto_allows("ns-src", "ns-src"));
    }

    #[test]
    fn malformed_reflects_is_absent() {
        let props = ReflectionProperties::parse(&annotations(&[(REFLECTS, "not-qualified")]));
        assert_eq!(props.reflects, None);

        let props = ReflectionProperties::parse(&annotations(&[(REFLECTS, "ns-src/s")]));
        assert_eq!(props.reflects, Some(QualifiedName::new("ns-src", "s")));
    }

    #[test]
    fn reflected_at_parse() {
        let props = ReflectionProperties::parse(&annotations(&[(
            REFLECTED_AT,
            "2024-02-12T09:31:05+00:00",
        )]));
        assert!(props.reflected_at.is_some());

        let props = ReflectionProperties::parse(&annotations(&[(REFLECTED_AT, "last tuesday")]));
        assert_eq!(props.reflected_at, None);
    }
}
