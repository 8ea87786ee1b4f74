//! Policy store: ordered host/path rules swapped atomically.
//!
//! Readers take an [`Arc`] snapshot without locking; the watcher publishes a
//! complete replacement with a single pointer swap. Glob patterns are compiled
//! once at replace time; a pattern that fails to compile matches nothing.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Error;

const SPEC_FIELDS: &[&str] = &["name", "rules"];
const RULE_FIELDS: &[&str] = &["host", "path", "public", "scopes"];

/// Policy spec decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The spec (or a rule) is not a mapping.
    #[error("{0} is not an object")]
    NotAnObject(String),

    /// Strict decoding met a field it does not know.
    #[error("unknown field '{field}' in {location}")]
    UnknownField {
        /// Offending field
        field: String,
        /// `spec` or `rules[i]`
        location: String,
    },

    /// Field types do not match.
    #[error("invalid policy spec: {0}")]
    Invalid(#[from] serde_json::Error),
}

impl From<PolicyError> for Error {
    fn from(e: PolicyError) -> Self {
        Self::Config(e.to_string())
    }
}

/// One host/path matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Host glob (`*.example.com`); matched against the `Host` header value
    pub host: String,
    /// Path glob (`/api/*`)
    pub path: String,
    /// Admit without a credential
    #[serde(default)]
    pub public: bool,
    /// Scopes a token may carry on this rule, in request order
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Rule {
    /// Rule with no scopes.
    #[must_use]
    pub fn new(host: impl Into<String>, path: impl Into<String>, public: bool) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            public,
            scopes: Vec::new(),
        }
    }
}

/// A rule with its globs compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: Rule,
    host: Option<Pattern>,
    path: Option<Pattern>,
    scope_set: BTreeSet<String>,
}

impl CompiledRule {
    /// Compile a rule; invalid globs are logged and never match.
    #[must_use]
    pub fn compile(rule: Rule) -> Self {
        let host = compile_glob(&rule.host);
        let path = compile_glob(&rule.path);
        let scope_set = rule.scopes.iter().cloned().collect();
        Self {
            rule,
            host,
            path,
            scope_set,
        }
    }

    /// The rule as written.
    #[must_use]
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Whether the rule admits without a credential.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.rule.public
    }

    /// Scopes in their configured order.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.rule.scopes
    }

    /// Both globs match.
    #[must_use]
    pub fn matches(&self, host: &str, path: &str) -> bool {
        match (&self.host, &self.path) {
            (Some(h), Some(p)) => h.matches(host) && p.matches(path),
            _ => false,
        }
    }

    /// Every space-separated token of a `scope` claim is allowed here.
    #[must_use]
    pub fn allows_scopes(&self, scope_claim: &str) -> bool {
        scope_claim
            .split_whitespace()
            .all(|s| self.scope_set.contains(s))
    }
}

fn compile_glob(pattern: &str) -> Option<Pattern> {
    match Pattern::new(pattern) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid glob, rule will never match");
            None
        }
    }
}

/// Named, ordered rule list as delivered by a resource source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Source identity, for logging
    pub name: String,
    /// Ordered rules
    pub rules: Vec<Rule>,
}

#[derive(Deserialize)]
struct RawSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Decode a `{rules: [...]}` object.
///
/// In strict mode unknown fields on the spec or any rule are rejected; in
/// lenient mode they are ignored. A `name` field overrides `name`.
pub fn decode_policy_spec(
    name: &str,
    value: &serde_json::Value,
    strict: bool,
) -> Result<PolicySpec, PolicyError> {
    let object = value
        .as_object()
        .ok_or_else(|| PolicyError::NotAnObject(format!("policy '{name}'")))?;

    if strict {
        reject_unknown(object, SPEC_FIELDS, "spec")?;
        if let Some(rules) = object.get("rules").and_then(serde_json::Value::as_array) {
            for (i, rule) in rules.iter().enumerate() {
                let location = format!("rules[{i}]");
                let rule = rule
                    .as_object()
                    .ok_or_else(|| PolicyError::NotAnObject(location.clone()))?;
                reject_unknown(rule, RULE_FIELDS, &location)?;
            }
        }
    }

    let raw: RawSpec = serde_json::from_value(value.clone())?;
    Ok(PolicySpec {
        name: raw.name.unwrap_or_else(|| name.to_string()),
        rules: raw.rules,
    })
}

fn reject_unknown(
    object: &serde_json::Map<String, serde_json::Value>,
    known: &[&str],
    location: &str,
) -> Result<(), PolicyError> {
    match object.keys().find(|k| !known.contains(&k.as_str())) {
        Some(field) => Err(PolicyError::UnknownField {
            field: field.clone(),
            location: location.to_string(),
        }),
        None => Ok(()),
    }
}

/// Published rule list.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    rules: Vec<Arc<CompiledRule>>,
    sources: Vec<String>,
}

impl PolicySnapshot {
    /// First rule matching `host` and `path`.
    #[must_use]
    pub fn find(&self, host: &str, path: &str) -> Option<Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.matches(host, path)).cloned()
    }

    /// All rules in match order.
    #[must_use]
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    /// Names of the specs this snapshot was built from.
    #[must_use]
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// No rules installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Lock-free policy store.
#[derive(Debug)]
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Empty store (every lookup yields no rule).
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(PolicySnapshot::default()),
        }
    }

    /// Publish `rules` as the complete list.
    pub fn replace(&self, rules: Vec<Rule>) {
        self.publish(rules, Vec::new());
    }

    /// Publish the concatenation of `specs`, in order.
    pub fn replace_specs(&self, specs: Vec<PolicySpec>) {
        let mut sources = Vec::with_capacity(specs.len());
        let mut rules = Vec::new();
        for spec in specs {
            sources.push(spec.name);
            rules.extend(spec.rules);
        }
        self.publish(rules, sources);
    }

    /// Current list; never a partial mix of two replacements.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    fn publish(&self, rules: Vec<Rule>, sources: Vec<String>) {
        let rules: Vec<_> = rules
            .into_iter()
            .map(|r| Arc::new(CompiledRule::compile(r)))
            .collect();
        debug!(rules = rules.len(), sources = ?sources, "Publishing policy snapshot");
        self.current.store(Arc::new(PolicySnapshot { rules, sources }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_match_wins() {
        let store = PolicyStore::new();
        store.replace(vec![
            Rule::new("*", "/public/*", true),
            Rule::new("*", "*", false),
        ]);

        let snap = store.snapshot();
        assert!(snap.find("app.example.com", "/public/index.html").unwrap().is_public());
        assert!(!snap.find("app.example.com", "/private").unwrap().is_public());
    }

    #[test]
    fn no_rule_when_nothing_matches() {
        let store = PolicyStore::new();
        assert!(store.snapshot().find("a", "/").is_none());

        store.replace(vec![Rule::new("api.example.com", "/*", true)]);
        assert!(store.snapshot().find("www.example.com", "/").is_none());
    }

    #[test]
    fn star_spans_path_separators() {
        let rule = CompiledRule::compile(Rule::new("*", "/api/*", false));
        assert!(rule.matches("h", "/api/v1/users"));
        assert!(!rule.matches("h", "/other"));
    }

    #[test]
    fn shell_glob_classes_and_single_char() {
        let rule = CompiledRule::compile(Rule::new("app?.example.com", "/v[12]/*", false));
        assert!(rule.matches("app1.example.com", "/v2/x"));
        assert!(!rule.matches("app10.example.com", "/v2/x"));
        assert!(!rule.matches("app1.example.com", "/v3/x"));
    }

    #[test]
    fn host_glob_sees_port() {
        let rule = CompiledRule::compile(Rule::new("localhost:*", "*", true));
        assert!(rule.matches("localhost:8080", "/"));
        assert!(!rule.matches("localhost", "/"));
    }

    #[test]
    fn invalid_glob_matches_nothing() {
        let rule = CompiledRule::compile(Rule::new("*", "/[unclosed", true));
        assert!(!rule.matches("h", "/[unclosed"));
        assert!(!rule.matches("h", "/"));
    }

    #[test]
    fn scope_claim_must_be_subset() {
        let mut rule = Rule::new("*", "*", false);
        rule.scopes = vec!["read".into(), "write".into()];
        let rule = CompiledRule::compile(rule);

        assert!(rule.allows_scopes("read"));
        assert!(rule.allows_scopes("read  write"));
        assert!(rule.allows_scopes(""));
        assert!(!rule.allows_scopes("read admin"));
    }

    #[test]
    fn replace_is_observed_whole() {
        let store = PolicyStore::new();
        store.replace(vec![Rule::new("*", "/x", false)]);
        let before = store.snapshot();

        store.replace(vec![Rule::new("*", "/x", true), Rule::new("*", "/y", true)]);

        // An old reader keeps its complete list.
        assert_eq!(before.len(), 1);
        assert!(!before.find("h", "/x").unwrap().is_public());
        let after = store.snapshot();
        assert_eq!(after.len(), 2);
        assert!(after.find("h", "/x").unwrap().is_public());
    }

    #[test]
    fn concurrent_readers_never_see_torn_lists() {
        let store = Arc::new(PolicyStore::new());
        let a = vec![Rule::new("*", "/a", false); 3];
        let b = vec![Rule::new("*", "/b", true); 5];
        store.replace(a.clone());

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let snap = store.snapshot();
                    let paths: Vec<_> = snap.rules().iter().map(|r| r.rule().path.clone()).collect();
                    let all_a = paths.len() == 3 && paths.iter().all(|p| p == "/a");
                    let all_b = paths.len() == 5 && paths.iter().all(|p| p == "/b");
                    assert!(all_a || all_b, "torn snapshot: {paths:?}");
                }
            })
        };
        for i in 0..1_000 {
            store.replace(if i % 2 == 0 { b.clone() } else { a.clone() });
        }
        reader.join().unwrap();
    }

    #[test]
    fn specs_concatenate_in_delivery_order() {
        let store = PolicyStore::new();
        store.replace_specs(vec![
            PolicySpec {
                name: "first".into(),
                rules: vec![Rule::new("*", "/x", true)],
            },
            PolicySpec {
                name: "second".into(),
                rules: vec![Rule::new("*", "*", false)],
            },
        ]);

        let snap = store.snapshot();
        assert_eq!(snap.sources(), ["first".to_string(), "second".to_string()]);
        assert!(snap.find("h", "/x").unwrap().is_public());
        assert!(!snap.find("h", "/y").unwrap().is_public());
    }

    #[test]
    fn lenient_decode_ignores_unknown_fields() {
        let value = json!({
            "rules": [{"host": "*", "path": "/x", "public": true, "comment": "hi"}],
            "owner": "team-a"
        });
        let spec = decode_policy_spec("ns/default", &value, false).unwrap();
        assert_eq!(spec.name, "ns/default");
        assert_eq!(spec.rules, vec![Rule::new("*", "/x", true)]);
    }

    #[test]
    fn strict_decode_rejects_unknown_fields() {
        let value = json!({"rules": [{"host": "*", "path": "/x", "comment": "hi"}]});
        let err = decode_policy_spec("p", &value, true).unwrap_err();
        assert!(
            matches!(err, PolicyError::UnknownField { ref field, ref location } if field == "comment" && location == "rules[0]")
        );

        let value = json!({"rules": [], "owner": "x"});
        assert!(matches!(
            decode_policy_spec("p", &value, true),
            Err(PolicyError::UnknownField { .. })
        ));
    }

    #[test]
    fn decode_defaults_and_type_errors() {
        let spec = decode_policy_spec(
            "p",
            &json!({"name": "named", "rules": [{"host": "*", "path": "*"}]}),
            true,
        )
        .unwrap();
        assert_eq!(spec.name, "named");
        assert!(!spec.rules[0].public);
        assert!(spec.rules[0].scopes.is_empty());

        assert!(matches!(
            decode_policy_spec("p", &json!({"rules": [{"host": 1}]}), false),
            Err(PolicyError::Invalid(_))
        ));
        assert!(matches!(
            decode_policy_spec("p", &json!([1, 2]), false),
            Err(PolicyError::NotAnObject(_))
        ));
    }
}
