//! Rule evaluation: the first rule whose conditions all hold decides.

pub mod expression;

pub use expression::Expression;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult, RuleError};
use crate::variables::{VariableDef, interpolate};
use conduit_core::{JobVariable, When};

/// Default bound on path-against-pattern comparisons for `exists`.
pub const DEFAULT_MAX_EXISTS_COMPARISONS: usize = 10_000;

/// `changes` clause.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Changes {
    pub paths: Vec<String>,
    #[serde(default)]
    pub compare_to: Option<String>,
}

/// `exists` clause.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Exists {
    pub paths: Vec<String>,
}

/// One conditional rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    #[serde(default, rename = "if")]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub changes: Option<Changes>,
    #[serde(default)]
    pub exists: Option<Exists>,
    #[serde(default)]
    pub when: Option<When>,
    #[serde(default)]
    pub allow_failure: Option<bool>,
    /// Seconds.
    #[serde(default)]
    pub start_in: Option<u64>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDef>,
}

impl Rule {
    /// A rule without conditions matches unconditionally.
    pub fn is_unconditional(&self) -> bool {
        self.if_expr.is_none() && self.changes.is_none() && self.exists.is_none()
    }

    /// Whether every condition present on this rule holds.
    pub fn matches(&self, ctx: &EvalContext<'_>) -> Result<bool, RuleError> {
        if let Some(source) = &self.if_expr {
            if !Expression::parse(source)?.evaluate(ctx.variables)? {
                return Ok(false);
            }
        }

        if let Some(changes) = &self.changes {
            if !changes_satisfied(changes, ctx)? {
                return Ok(false);
            }
        }

        if let Some(exists) = &self.exists {
            if !exists_satisfied(&exists.paths, ctx)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn decision(&self, default_when: When) -> Decision {
        Decision {
            when: self.when.unwrap_or(default_when),
            allow_failure: self.allow_failure,
            start_in: self.start_in.map(Duration::from_secs),
            variables: self
                .variables
                .iter()
                .map(|(name, def)| {
                    (
                        name.clone(),
                        JobVariable {
                            value: def.value.clone(),
                            expand: def.expand,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Ordered rules of one job, workflow or include.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Read a validated `rules` value.
    pub fn from_value(value: &Value) -> ConfigResult<Self> {
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
            field: "rules".to_string(),
            message: e.to_string(),
        })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First matching rule, with `on_success` for rules without `when`.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Option<Decision>, RuleError> {
        evaluate(&self.rules, ctx, When::OnSuccess)
    }
}

/// Outcome of the first matching rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub when: When,
    /// Set only when the rule says so.
    pub allow_failure: Option<bool>,
    pub start_in: Option<Duration>,
    pub variables: BTreeMap<String, JobVariable>,
}

impl Decision {
    /// Whether the decided job is part of the pipeline.
    pub fn includes_job(&self) -> bool {
        self.when.includes_job()
    }
}

/// Everything a rule can look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub variables: &'a BTreeMap<String, String>,
    /// Changed paths against the default comparison ref; `None` when no diff exists.
    pub changed_paths: Option<&'a [String]>,
    pub changed_by_ref: &'a BTreeMap<String, Vec<String>>,
    /// File listing of the current tree.
    pub tree: &'a [String],
    pub max_exists_comparisons: usize,
}

/// Scan `rules` top to bottom and return the first match.
///
/// Rules without `when` take `default_when`. `None` means no rule matched.
pub fn evaluate(
    rules: &[Rule],
    ctx: &EvalContext<'_>,
    default_when: When,
) -> Result<Option<Decision>, RuleError> {
    for rule in rules {
        if rule.matches(ctx)? {
            return Ok(Some(rule.decision(default_when)));
        }
    }
    Ok(None)
}

fn glob_set(patterns: &[String], variables: &BTreeMap<String, String>) -> Result<GlobSet, RuleError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let expanded = interpolate(pattern, variables).text;
        let glob = GlobBuilder::new(expanded.trim_start_matches('/'))
            .literal_separator(true)
            .build()
            .map_err(|e| RuleError::Pattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| RuleError::Pattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

fn changes_satisfied(changes: &Changes, ctx: &EvalContext<'_>) -> Result<bool, RuleError> {
    let changed: &[String] = match &changes.compare_to {
        Some(git_ref) => ctx
            .changed_by_ref
            .get(git_ref)
            .map(Vec::as_slice)
            .ok_or_else(|| RuleError::UnknownCompareRef(git_ref.clone()))?,
        None => match ctx.changed_paths {
            Some(paths) => paths,
            // No diff (scheduled or tag pipelines): treat as changed.
            None => return Ok(true),
        },
    };

    let set = glob_set(&changes.paths, ctx.variables)?;
    Ok(changed.iter().any(|path| set.is_match(path.trim_start_matches('/'))))
}

fn exists_satisfied(patterns: &[String], ctx: &EvalContext<'_>) -> Result<bool, RuleError> {
    let set = glob_set(patterns, ctx.variables)?;
    let mut comparisons = 0usize;
    for path in ctx.tree {
        comparisons += patterns.len();
        if comparisons > ctx.max_exists_comparisons {
            return Err(RuleError::TooManyPaths {
                limit: ctx.max_exists_comparisons,
            });
        }
        if set.is_match(path.as_str()) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        variables: BTreeMap<String, String>,
        changed: Option<Vec<String>>,
        by_ref: BTreeMap<String, Vec<String>>,
        tree: Vec<String>,
        limit: usize,
    }

    impl Fixture {
        fn new(pairs: &[(&str, &str)]) -> Self {
            Self {
                variables: pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                changed: None,
                by_ref: BTreeMap::new(),
                tree: Vec::new(),
                limit: DEFAULT_MAX_EXISTS_COMPARISONS,
            }
        }

        fn ctx(&self) -> EvalContext<'_> {
            EvalContext {
                variables: &self.variables,
                changed_paths: self.changed.as_deref(),
                changed_by_ref: &self.by_ref,
                tree: &self.tree,
                max_exists_comparisons: self.limit,
            }
        }
    }

    fn rules(value: Value) -> RuleSet {
        RuleSet::from_value(&value).unwrap()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_match_wins() {
        let rules = rules(json!([
            {"if": "$X == \"a\"", "when": "on_success"},
            {"when": "never"}
        ]));

        let decision = rules.evaluate(&Fixture::new(&[("X", "a")]).ctx()).unwrap().unwrap();
        assert_eq!(decision.when, When::OnSuccess);

        let decision = rules.evaluate(&Fixture::new(&[("X", "b")]).ctx()).unwrap().unwrap();
        assert_eq!(decision.when, When::Never);
        assert!(!decision.includes_job());
    }

    #[test]
    fn test_later_rules_are_not_evaluated_after_a_match() {
        // The second rule is malformed; reaching it would be an error.
        let rules = rules(json!([
            {"when": "manual"},
            {"if": "$X ==", "when": "always"}
        ]));
        let decision = rules.evaluate(&Fixture::new(&[]).ctx()).unwrap().unwrap();
        assert_eq!(decision.when, When::Manual);
    }

    #[test]
    fn test_no_match() {
        let rules = rules(json!([{"if": "$DEPLOY"}]));
        assert_eq!(rules.evaluate(&Fixture::new(&[]).ctx()).unwrap(), None);
        assert_eq!(RuleSet::default().evaluate(&Fixture::new(&[]).ctx()).unwrap(), None);
    }

    #[test]
    fn test_default_when_and_rule_fields() {
        let rules = rules(json!([{
            "if": "$A",
            "allow_failure": true,
            "variables": {"TARGET": {"value": "prod"}}
        }]));
        let fixture = Fixture::new(&[("A", "1")]);
        let decision = evaluate(rules.rules(), &fixture.ctx(), When::Manual)
            .unwrap()
            .unwrap();
        assert_eq!(decision.when, When::Manual);
        assert_eq!(decision.allow_failure, Some(true));
        assert_eq!(decision.variables["TARGET"], JobVariable::new("prod"));
    }

    #[test]
    fn test_changes() {
        let rules = rules(json!([{"changes": {"paths": ["src/*.rs", "docs/**/*.md"]}}]));

        let mut fixture = Fixture::new(&[]);
        // No diff available: satisfied.
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_some());

        fixture.changed = Some(strings(&["src/lib.rs"]));
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_some());

        fixture.changed = Some(strings(&["src/nested/mod.rs", "README.md"]));
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_none());

        fixture.changed = Some(strings(&["docs/guide/intro.md"]));
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_some());

        fixture.changed = Some(Vec::new());
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_none());
    }

    #[test]
    fn test_changes_compare_to() {
        let rules = rules(json!([{"changes": {"paths": ["Dockerfile"], "compare_to": "refs/heads/main"}}]));

        let mut fixture = Fixture::new(&[]);
        let err = rules.evaluate(&fixture.ctx()).unwrap_err();
        assert_eq!(err, RuleError::UnknownCompareRef("refs/heads/main".to_string()));

        fixture
            .by_ref
            .insert("refs/heads/main".to_string(), strings(&["Dockerfile"]));
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_some());
    }

    #[test]
    fn test_exists_with_variables() {
        let rules = rules(json!([{"exists": {"paths": ["$SERVICE/Cargo.toml"]}}]));
        let mut fixture = Fixture::new(&[("SERVICE", "api")]);
        fixture.tree = strings(&["api/Cargo.toml", "web/package.json"]);
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_some());

        fixture.variables.insert("SERVICE".to_string(), "worker".to_string());
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_none());
    }

    #[test]
    fn test_exists_comparison_limit() {
        let rules = rules(json!([{"exists": {"paths": ["*.lock", "*.toml"]}}]));
        let mut fixture = Fixture::new(&[]);
        fixture.tree = (0..10).map(|i| format!("file{}.txt", i)).collect();
        fixture.limit = 10;

        let err = rules.evaluate(&fixture.ctx()).unwrap_err();
        assert_eq!(err, RuleError::TooManyPaths { limit: 10 });

        fixture.limit = 20;
        assert!(rules.evaluate(&fixture.ctx()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_expression_is_an_error() {
        let rules = rules(json!([{"if": "$A === 'x'"}]));
        let err = rules.evaluate(&Fixture::new(&[]).ctx()).unwrap_err();
        assert!(matches!(err, RuleError::Expression { .. }));
    }
}
