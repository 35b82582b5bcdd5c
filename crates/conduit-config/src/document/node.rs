//! Configuration nodes: one per key of a pipeline document.

use serde_json::{Map, Value};
use std::time::Duration;

use super::entry::{Entry, HIDDEN, ScalarKind, Shape};
use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult, Problem};
use conduit_core::When;

/// Limits applied by semantic checks.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub max_timeout: Duration,
    pub max_glob_paths: usize,
    pub max_tags: usize,
    pub max_start_in: Duration,
}

impl Default for ValidationContext {
    fn default() -> Self {
        Self {
            max_timeout: Duration::from_secs(24 * 3600),
            max_glob_paths: 50,
            max_tags: 50,
            max_start_in: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Problems reported by a semantic check.
#[derive(Debug, Default)]
pub struct Findings {
    errors: Vec<Problem>,
    warnings: Vec<Problem>,
}

impl Findings {
    pub fn error(&mut self, node: &ConfigNode, message: impl std::fmt::Display) {
        self.errors.push(Problem::config(node.path(), message));
    }

    pub fn error_at(&mut self, path: impl Into<String>, message: impl std::fmt::Display) {
        self.errors.push(Problem::config(path, message));
    }

    pub fn warning(&mut self, node: &ConfigNode, message: impl std::fmt::Display) {
        self.warnings.push(Problem::config(node.path(), message));
    }
}

/// A named entry in the document tree.
///
/// Children are built while the node validates; before that the node only
/// holds its raw value and `value()` reports `NotValidated`.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    key: String,
    path: Vec<String>,
    entry: &'static Entry,
    raw: Option<Value>,
    dynamic: bool,
    children: Vec<ConfigNode>,
    errors: Vec<Problem>,
    warnings: Vec<Problem>,
    value: Option<Value>,
    validated: bool,
}

impl ConfigNode {
    pub fn new(key: impl Into<String>, path: Vec<String>, entry: &'static Entry, raw: Option<Value>) -> Self {
        Self {
            key: key.into(),
            path,
            entry,
            raw,
            dynamic: false,
            children: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            value: None,
            validated: false,
        }
    }

    /// Root node of a pipeline document.
    pub fn root(raw: Value) -> Self {
        Self::new("root", Vec::new(), &super::entry::ROOT, Some(raw))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Location from the root, e.g. `jobs:rspec:rules:0`.
    pub fn path(&self) -> String {
        if self.path.is_empty() {
            "root".to_string()
        } else {
            self.path.join(":")
        }
    }

    pub fn entry(&self) -> &'static Entry {
        self.entry
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    /// Whether the key was written in the document rather than defaulted.
    pub fn is_specified(&self) -> bool {
        self.raw.is_some()
    }

    /// Whether this node is a job (an undeclared key of the root).
    pub fn is_job(&self) -> bool {
        self.dynamic
    }

    pub fn is_hidden(&self) -> bool {
        self.key.starts_with('.')
    }

    pub fn children(&self) -> &[ConfigNode] {
        &self.children
    }

    pub fn child(&self, key: &str) -> Option<&ConfigNode> {
        self.children.iter().find(|c| c.key == key)
    }

    /// Composed value of a valid child.
    pub fn child_value(&self, key: &str) -> Option<&Value> {
        self.child(key).and_then(|c| c.value.as_ref())
    }

    /// Jobs in document order, hidden ones included.
    pub fn jobs(&self) -> impl Iterator<Item = &ConfigNode> {
        self.children.iter().filter(|c| c.dynamic)
    }

    pub fn errors(&self) -> &[Problem] {
        &self.errors
    }

    pub fn warnings(&self) -> &[Problem] {
        &self.warnings
    }

    /// Errors of this node and every descendant, in document order.
    pub fn all_errors(&self) -> Vec<Problem> {
        let mut out = Vec::new();
        self.collect(&mut out, |n| &n.errors);
        out
    }

    pub fn all_warnings(&self) -> Vec<Problem> {
        let mut out = Vec::new();
        self.collect(&mut out, |n| &n.warnings);
        out
    }

    fn collect(&self, out: &mut Vec<Problem>, pick: fn(&ConfigNode) -> &Vec<Problem>) {
        out.extend(pick(self).iter().cloned());
        for child in &self.children {
            child.collect(out, pick);
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validated && self.value.is_some()
    }

    /// The composed, normalized value.
    pub fn value(&self) -> ConfigResult<&Value> {
        if !self.validated {
            return Err(ConfigError::NotValidated(self.path()));
        }
        self.value.as_ref().ok_or_else(|| ConfigError::Invalid {
            path: self.path(),
            errors: self.all_errors().into_iter().map(|p| p.message).collect(),
        })
    }

    /// Validate this node and its descendants, returning every error found.
    pub fn validate(&mut self, ctx: &ValidationContext) -> Vec<Problem> {
        self.children.clear();
        self.errors.clear();
        self.warnings.clear();

        let composed = match self.raw.clone() {
            Some(raw) => self.compose(raw, ctx),
            None => self.entry.default.map(|d| Value::String(d.to_string())),
        };
        self.validated = true;
        self.value = composed;

        let check = self.entry.check.filter(|_| self.value.is_some());
        if let Some(check) = check {
            let mut findings = Findings::default();
            check(self, ctx, &mut findings);
            self.warnings.extend(findings.warnings);
            if !findings.errors.is_empty() {
                self.errors.extend(findings.errors);
                self.value = None;
            }
        }

        self.all_errors()
    }

    fn error(&mut self, message: impl std::fmt::Display) -> Option<Value> {
        self.errors.push(Problem::config(self.path(), message));
        None
    }

    fn compose(&mut self, raw: Value, ctx: &ValidationContext) -> Option<Value> {
        let entry = self.entry;
        match (&entry.shape, raw) {
            (Shape::Any, raw) => Some(raw),
            (Shape::Scalar(kind), raw) => self.scalar(*kind, raw),
            (Shape::Mapping, Value::Object(map)) => self.mapping(map, ctx),
            (Shape::Mapping, _) => self.error("should be a hash"),
            (Shape::ScalarOrMapping(_), Value::Object(map)) => self.mapping(map, ctx),
            (Shape::ScalarOrMapping(kind), raw) => {
                let value = self.scalar(*kind, raw)?;
                Some(match entry.scalar_key {
                    Some(key) => {
                        let mut map = Map::new();
                        map.insert(key.to_string(), value);
                        Value::Object(map)
                    }
                    None => value,
                })
            }
            (Shape::Sequence(item), Value::Array(items)) => self.sequence(*item, items, ctx),
            (Shape::Sequence(_), _) => self.error("should be an array"),
            (Shape::NestedSequence { item, max_depth }, Value::Array(items)) => {
                let (item, max_depth) = (*item, *max_depth);
                match flatten(items, max_depth) {
                    Some(flat) => self.sequence(item, flat, ctx),
                    None => self.error(format!(
                        "should be an array containing hashes and arrays of hashes up to {} levels deep",
                        max_depth
                    )),
                }
            }
            (Shape::NestedSequence { .. }, _) => {
                self.error("should be an array containing hashes and arrays of hashes")
            }
            (Shape::MapOf(item), Value::Object(map)) => {
                let item = *item;
                let mut out = Map::new();
                let mut valid = true;
                for (key, raw) in map {
                    let child = self.add_child(&key, self.child_path(&key), item, Some(raw), ctx);
                    match &child.value {
                        Some(v) => {
                            out.insert(key, v.clone());
                        }
                        None => valid = false,
                    }
                }
                valid.then_some(Value::Object(out))
            }
            (Shape::MapOf(_), _) => self.error("should be a hash"),
            (Shape::OneOrMany(item), Value::Array(items)) => self.sequence(*item, items, ctx),
            (Shape::OneOrMany(item), raw) => {
                let item = *item;
                let path = self.path.clone();
                let value = self.add_child("0", path, item, Some(raw), ctx).value.clone()?;
                Some(Value::Array(vec![value]))
            }
        }
    }

    fn mapping(&mut self, map: Map<String, Value>, ctx: &ValidationContext) -> Option<Value> {
        let entry = self.entry;

        let missing: Vec<&str> = entry
            .required
            .iter()
            .copied()
            .filter(|k| !map.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            self.error(format!("missing required keys: {}", missing.join(", ")));
        }

        if entry.strict {
            let unknown: Vec<&str> = map
                .keys()
                .filter(|k| entry.child(k).is_none())
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                let message = format!("contains unknown keys: {}", unknown.join(", "));
                self.error(message);
            }
        }

        let mut out = Map::new();
        let mut valid = self.errors.is_empty();
        for (key, raw) in map {
            let child = if let Some(declared) = entry.child(&key) {
                self.add_child(&key, self.child_path(&key), declared, Some(raw), ctx)
            } else if let Some(dynamic) = entry.dynamic {
                // Jobs are reported under `jobs:<name>`.
                let path = vec!["jobs".to_string(), key.clone()];
                let job_entry = if key.starts_with('.') { &HIDDEN } else { dynamic };
                let child = self.add_child(&key, path, job_entry, Some(raw), ctx);
                child.dynamic = true;
                child
            } else if !entry.strict {
                out.insert(key, raw);
                continue;
            } else {
                continue;
            };
            match &child.value {
                Some(v) => {
                    out.insert(key, v.clone());
                }
                None => valid = false,
            }
        }

        for (key, declared) in entry.children {
            if declared.default.is_some() && !out.contains_key(*key) && self.child(key).is_none() {
                let child = self.add_child(key, self.child_path(key), *declared, None, ctx);
                if let Some(v) = &child.value {
                    out.insert(key.to_string(), v.clone());
                }
            }
        }

        valid.then_some(Value::Object(out))
    }

    fn sequence(&mut self, item: &'static Entry, items: Vec<Value>, ctx: &ValidationContext) -> Option<Value> {
        let mut out = Vec::with_capacity(items.len());
        let mut valid = true;
        for (index, raw) in items.into_iter().enumerate() {
            let key = index.to_string();
            let child = self.add_child(&key, self.child_path(&key), item, Some(raw), ctx);
            match &child.value {
                Some(v) => out.push(v.clone()),
                None => valid = false,
            }
        }
        valid.then_some(Value::Array(out))
    }

    fn child_path(&self, key: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(key.to_string());
        path
    }

    fn add_child(
        &mut self,
        key: &str,
        path: Vec<String>,
        entry: &'static Entry,
        raw: Option<Value>,
        ctx: &ValidationContext,
    ) -> &mut ConfigNode {
        let mut child = ConfigNode::new(key, path, entry, raw);
        child.validate(ctx);
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    fn scalar(&mut self, kind: ScalarKind, raw: Value) -> Option<Value> {
        let composed = match (kind, raw) {
            (ScalarKind::String, Value::String(s)) => Some(Value::String(s)),
            (ScalarKind::Boolean, Value::Bool(b)) => Some(Value::Bool(b)),
            (ScalarKind::Integer, Value::Number(n)) if n.is_i64() => Some(Value::Number(n)),
            (ScalarKind::IntegerList, Value::Number(n)) if n.is_i64() => {
                Some(Value::Array(vec![Value::Number(n)]))
            }
            (ScalarKind::IntegerList, Value::Array(items))
                if items.iter().all(|v| v.is_i64()) =>
            {
                Some(Value::Array(items))
            }
            (ScalarKind::Duration, raw) => parse_duration(&raw).map(|d| Value::from(d.as_secs())),
            (ScalarKind::When, Value::String(s)) => s
                .parse::<When>()
                .ok()
                .map(|w| Value::String(w.to_string())),
            (ScalarKind::When, _) => None,
            (ScalarKind::StringList, Value::String(s)) => Some(Value::Array(vec![Value::String(s)])),
            (ScalarKind::StringList, Value::Array(items)) if items.iter().all(Value::is_string) => {
                Some(Value::Array(items))
            }
            (ScalarKind::Script, Value::String(s)) => Some(Value::Array(vec![Value::String(s)])),
            (ScalarKind::Script, Value::Array(items)) => flatten(items, super::entry::MAX_NESTING)
                .filter(|lines| lines.iter().all(Value::is_string))
                .map(Value::Array),
            (ScalarKind::VariableValue, Value::String(s)) => Some(Value::String(s)),
            (ScalarKind::VariableValue, Value::Number(n)) => Some(Value::String(n.to_string())),
            (ScalarKind::VariableValue, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (ScalarKind::CacheFlag, Value::Bool(b)) => Some(Value::Bool(b)),
            (ScalarKind::CacheFlag, raw) => parse_duration(&raw).map(|d| Value::from(d.as_secs())),
            _ => None,
        };

        if composed.is_none() {
            let message = match kind {
                ScalarKind::When => format!("should be one of: {}", When::TOKENS.join(", ")),
                other => format!("should be {}", other.describe()),
            };
            return self.error(message);
        }
        composed
    }
}

/// Flatten nested arrays, allowing `max_depth` levels of nesting.
///
/// Returns `None` when the input nests deeper than allowed.
pub fn flatten(items: Vec<Value>, max_depth: usize) -> Option<Vec<Value>> {
    fn walk(items: Vec<Value>, depth: usize, max_depth: usize, out: &mut Vec<Value>) -> bool {
        if depth > max_depth {
            return false;
        }
        for item in items {
            match item {
                Value::Array(nested) => {
                    if !walk(nested, depth + 1, max_depth, out) {
                        return false;
                    }
                }
                other => out.push(other),
            }
        }
        true
    }

    let mut out = Vec::new();
    walk(items, 1, max_depth, &mut out).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validated(raw: Value) -> (ConfigNode, Vec<String>) {
        let mut node = ConfigNode::root(raw);
        let errors = node
            .validate(&ValidationContext::default())
            .into_iter()
            .map(|p| p.message)
            .collect();
        (node, errors)
    }

    #[test]
    fn test_value_before_validation() {
        let node = ConfigNode::root(json!({"rspec": {"script": "rake"}}));
        assert!(matches!(node.value(), Err(ConfigError::NotValidated(_))));
    }

    #[test]
    fn test_valid_document_composes_defaults() {
        let (node, errors) = validated(json!({
            "rspec": {"script": "rake spec", "variables": {"RETRIES": 3}}
        }));
        assert!(errors.is_empty(), "{:?}", errors);

        let value = node.value().unwrap();
        assert_eq!(value["rspec"]["script"], json!(["rake spec"]));
        assert_eq!(value["rspec"]["stage"], json!("test"));
        assert_eq!(value["rspec"]["when"], json!("on_success"));
        assert_eq!(value["rspec"]["variables"]["RETRIES"], json!({"value": "3"}));
    }

    #[test]
    fn test_unknown_keys_use_job_path() {
        let (node, errors) = validated(json!({"rspec": {"script": "rake", "foo": 1}}));
        assert_eq!(errors, vec!["jobs:rspec config contains unknown keys: foo"]);
        assert!(matches!(node.value(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_errors_are_aggregated() {
        let (_, errors) = validated(json!({
            "rspec": {"script": {"a": 1}, "when": "sometimes"},
            "lint": {"script": "ok", "rules": [{"when": "always", "bogus": true}]}
        }));
        assert_eq!(
            errors,
            vec![
                "jobs:rspec:script config should be a string or a nested array of strings up to 10 levels deep",
                "jobs:rspec:when config should be one of: on_success, on_failure, always, manual, delayed, never",
                "jobs:lint:rules:0 config contains unknown keys: bogus",
            ]
        );
    }

    #[test]
    fn test_nested_rules_are_flattened() {
        let (node, errors) = validated(json!({
            "rspec": {"script": "x", "rules": [[{"if": "$A"}], {"when": "never"}]}
        }));
        assert!(errors.is_empty(), "{:?}", errors);
        let rules = &node.value().unwrap()["rspec"]["rules"];
        assert_eq!(rules.as_array().unwrap().len(), 2);
        assert_eq!(rules[1]["when"], json!("never"));
    }

    #[test]
    fn test_scalar_forms_are_normalized() {
        let (node, errors) = validated(json!({
            "image": "ruby:3.3",
            "rspec": {
                "script": ["a", ["b", ["c"]]],
                "timeout": "1h 30m",
                "rules": [{"changes": "src/**/*.rs", "when": "run"}]
            }
        }));
        assert!(errors.is_empty(), "{:?}", errors);
        let value = node.value().unwrap();
        assert_eq!(value["image"], json!({"name": "ruby:3.3"}));
        assert_eq!(value["rspec"]["script"], json!(["a", "b", "c"]));
        assert_eq!(value["rspec"]["timeout"], json!(5400));
        assert_eq!(value["rspec"]["rules"][0]["changes"], json!({"paths": ["src/**/*.rs"]}));
        assert_eq!(value["rspec"]["rules"][0]["when"], json!("on_success"));
    }

    #[test]
    fn test_hidden_jobs_accept_any_keys() {
        let (node, errors) = validated(json!({
            ".template": {"services": ["postgres"]},
            "rspec": {"script": "x"}
        }));
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(node.jobs().count(), 2);
        assert!(node.jobs().next().unwrap().is_hidden());
    }

    #[test]
    fn test_hidden_keys_hold_any_value() {
        let (node, errors) = validated(json!({
            ".setup": ["bundle install", "rake db:create"],
            ".registry": "registry.example.com",
            "rspec": {"script": "x"}
        }));
        assert!(errors.is_empty(), "{:?}", errors);
        let value = node.value().unwrap();
        assert_eq!(value[".setup"], json!(["bundle install", "rake db:create"]));
        assert_eq!(value[".registry"], json!("registry.example.com"));
    }

    #[test]
    fn test_warnings_do_not_block_value() {
        let (node, errors) = validated(json!({
            "rspec": {"script": "x", "rules": [{"when": "always"}, {"if": "$A"}]}
        }));
        assert!(errors.is_empty());
        assert_eq!(node.all_warnings().len(), 1);
        assert!(node.value().is_ok());
    }

    #[test]
    fn test_flatten_depth() {
        assert_eq!(flatten(vec![json!([[1]]), json!(2)], 3), Some(vec![json!(1), json!(2)]));
        assert_eq!(flatten(vec![json!([[1]])], 2), None);
    }
}
