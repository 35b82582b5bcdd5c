//! Run-time context and variable interpolation for pipeline compilation.
//!
//! The context supplies the predefined variables:
//! - `CI_COMMIT_SHA` / `CI_COMMIT_SHORT_SHA` - Commit being built
//! - `CI_COMMIT_BRANCH` - Branch name (branch pipelines only)
//! - `CI_COMMIT_TAG` - Tag name (tag pipelines only)
//! - `CI_COMMIT_REF_NAME` - Branch or tag name
//! - `CI_COMMIT_MESSAGE` - Commit message (first line)
//! - `CI_PIPELINE_SOURCE` - What triggered the pipeline (`push`, `schedule`, ...)
//! - `CI_PROJECT_PATH` - Project the pipeline runs for
//! - `CI_DEFAULT_BRANCH` - The project's default branch
//!
//! References are written `$NAME` or `${NAME}`; `$$` is a literal `$`.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([a-zA-Z0-9_]+)\}|\$([a-zA-Z0-9_]+)").unwrap()
});

/// Everything about one pipeline run that rules and substitution look at.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Project the pipeline runs for.
    pub project: String,
    /// Ref the configuration is read at.
    pub git_ref: String,
    pub sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub message: String,
    /// What triggered the pipeline (`push`, `schedule`, `web`, ...).
    pub source: String,
    pub default_branch: String,
    /// Caller-supplied variables; they override predefined ones.
    pub variables: BTreeMap<String, String>,
    /// Paths changed relative to the default comparison ref, when a diff exists.
    pub changed_paths: Option<Vec<String>>,
    /// Paths changed relative to other refs, for `changes:compare_to`.
    pub changed_by_ref: BTreeMap<String, Vec<String>>,
    /// File listing of the current tree; read from the repository when absent.
    pub tree: Option<Vec<String>>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self {
            project: String::new(),
            git_ref: "HEAD".to_string(),
            sha: String::new(),
            branch: None,
            tag: None,
            message: String::new(),
            source: "push".to_string(),
            default_branch: "main".to_string(),
            variables: BTreeMap::new(),
            changed_paths: None,
            changed_by_ref: BTreeMap::new(),
            tree: None,
        }
    }
}

impl PipelineContext {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            ..Default::default()
        }
    }

    /// Populate commit details by running git commands in a checkout.
    pub fn populate_from_checkout(&mut self, repo_path: &std::path::Path) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.sha = sha;
        }

        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git_ref = branch.clone();
                self.branch = Some(branch);
            }
        }

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            if self.branch.is_none() {
                self.git_ref = tag.clone();
            }
            self.tag = Some(tag);
        }

        if let Some(message) = run_git(&["log", "-1", "--format=%s"]) {
            self.message = message;
        }
    }

    /// Branch or tag name of the pipeline.
    pub fn ref_name(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.branch.as_deref())
            .unwrap_or(&self.git_ref)
    }

    /// Predefined variables, overridden by caller-supplied ones.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let mut set = |name: &str, value: &str| {
            vars.insert(name.to_string(), value.to_string());
        };

        set("CI", "true");
        set("CI_COMMIT_SHA", &self.sha);
        set(
            "CI_COMMIT_SHORT_SHA",
            &self.sha.chars().take(8).collect::<String>(),
        );
        set("CI_COMMIT_REF_NAME", self.ref_name());
        set("CI_COMMIT_MESSAGE", &self.message);
        set("CI_PIPELINE_SOURCE", &self.source);
        set("CI_PROJECT_PATH", &self.project);
        set("CI_DEFAULT_BRANCH", &self.default_branch);
        if let Some(branch) = &self.branch {
            set("CI_COMMIT_BRANCH", branch);
        }
        if let Some(tag) = &self.tag {
            set("CI_COMMIT_TAG", tag);
        }

        vars.extend(self.variables.clone());
        vars
    }
}

/// Builder for creating PipelineContext.
pub struct PipelineContextBuilder {
    ctx: PipelineContext,
}

impl PipelineContextBuilder {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            ctx: PipelineContext::new(project),
        }
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.ctx.sha = sha.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        let branch = branch.into();
        self.ctx.git_ref = branch.clone();
        self.ctx.branch = Some(branch);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.ctx.git_ref = tag.clone();
        self.ctx.tag = Some(tag);
        self
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.ctx.git_ref = git_ref.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.ctx.source = source.into();
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.default_branch = branch.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx.changed_paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_changes_against<I, S>(mut self, git_ref: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx
            .changed_by_ref
            .insert(git_ref.into(), paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tree<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ctx.tree = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> PipelineContext {
        self.ctx
    }
}

/// Result of interpolating one string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolated {
    pub text: String,
    /// Referenced names that were not defined; they are left as written.
    pub missing: Vec<String>,
}

/// Substitute `$NAME` and `${NAME}` references in one pass.
///
/// Substituted values are not expanded again.
pub fn interpolate(input: &str, variables: &BTreeMap<String, String>) -> Interpolated {
    let mut missing = Vec::new();
    let text = VAR_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let Some(name) = caps.get(1).or_else(|| caps.get(2)) else {
                return "$".to_string();
            };
            match variables.get(name.as_str()) {
                Some(value) => value.clone(),
                None => {
                    missing.push(name.as_str().to_string());
                    caps[0].to_string()
                }
            }
        })
        .to_string();
    Interpolated { text, missing }
}

/// A declared variable after validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariableDef {
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_expand")]
    pub expand: bool,
}

fn default_expand() -> bool {
    true
}

/// Read a validated `variables` value.
pub fn variable_defs(value: Option<&Value>) -> BTreeMap<String, VariableDef> {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_interpolation() {
        let result = interpolate(
            "ruby:${RUBY_VERSION}-$DISTRO",
            &vars(&[("RUBY_VERSION", "3.3"), ("DISTRO", "slim")]),
        );
        assert_eq!(result.text, "ruby:3.3-slim");
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let result = interpolate("out/${MISSING}/$ALSO_MISSING", &vars(&[]));
        assert_eq!(result.text, "out/${MISSING}/$ALSO_MISSING");
        assert_eq!(result.missing, vec!["MISSING", "ALSO_MISSING"]);
    }

    #[test]
    fn test_single_pass() {
        let result = interpolate("$A", &vars(&[("A", "$B"), ("B", "deep")]));
        assert_eq!(result.text, "$B");
    }

    #[test]
    fn test_escaped_dollar() {
        let result = interpolate("cost: $$HOME", &vars(&[("HOME", "/root")]));
        assert_eq!(result.text, "cost: $HOME");
    }

    #[test]
    fn test_nested_braces() {
        let result = interpolate(r#"{"sha": "${SHA}"}"#, &vars(&[("SHA", "abc123")]));
        assert_eq!(result.text, r#"{"sha": "abc123"}"#);
    }

    #[test]
    fn test_predefined_variables() {
        let ctx = PipelineContextBuilder::new("group/app")
            .with_sha("abc1234567890def")
            .with_branch("main")
            .with_variable("DEPLOY", "yes")
            .build();

        let vars = ctx.variables();
        assert_eq!(vars["CI_COMMIT_SHORT_SHA"], "abc12345");
        assert_eq!(vars["CI_COMMIT_BRANCH"], "main");
        assert_eq!(vars["CI_COMMIT_REF_NAME"], "main");
        assert_eq!(vars["CI_PROJECT_PATH"], "group/app");
        assert_eq!(vars["DEPLOY"], "yes");
        assert!(!vars.contains_key("CI_COMMIT_TAG"));
    }

    #[test]
    fn test_tag_pipeline() {
        let ctx = PipelineContextBuilder::new("app").with_tag("v1.0").build();
        let vars = ctx.variables();
        assert_eq!(vars["CI_COMMIT_TAG"], "v1.0");
        assert_eq!(vars["CI_COMMIT_REF_NAME"], "v1.0");
        assert_eq!(ctx.git_ref, "v1.0");
        assert!(!vars.contains_key("CI_COMMIT_BRANCH"));
    }

    #[test]
    fn test_caller_variables_override_predefined() {
        let ctx = PipelineContextBuilder::new("app")
            .with_branch("main")
            .with_variable("CI_COMMIT_BRANCH", "override")
            .build();
        assert_eq!(ctx.variables()["CI_COMMIT_BRANCH"], "override");
    }

    #[test]
    fn test_variable_defs() {
        let defs = variable_defs(Some(&json!({
            "A": {"value": "1"},
            "B": {"value": "$A", "expand": false, "description": "raw"}
        })));
        assert_eq!(defs["A"], VariableDef { value: "1".into(), expand: true });
        assert!(!defs["B"].expand);
        assert!(variable_defs(None).is_empty());
    }
}
