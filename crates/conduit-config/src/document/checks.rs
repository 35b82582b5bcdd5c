//! Semantic checks attached to registry entries.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::node::{ConfigNode, Findings, ValidationContext};
use super::pipeline_stages;
use crate::duration::parse_duration_str;

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

const INCLUDE_LOCATIONS: &[&str] = &["local", "remote", "template", "project", "artifact"];

static NULL: Value = Value::Null;

fn value_of(node: &ConfigNode) -> &Value {
    node.value().unwrap_or(&NULL)
}

fn has_condition(rule: &Value) -> bool {
    ["if", "changes", "exists"]
        .iter()
        .any(|key| rule.get(key).is_some())
}

pub fn root(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let stages = pipeline_stages(node.child_value("stages"));

    let mut visible = 0;
    for job in node.jobs().filter(|j| !j.is_hidden()) {
        visible += 1;
        let stage = job.child_value("stage").and_then(Value::as_str);
        if let Some(stage) = stage {
            if !stages.iter().any(|s| s == stage) {
                findings.error(
                    job,
                    format!(
                        "chosen stage {} does not exist; available stages are {}",
                        stage,
                        stages.join(", ")
                    ),
                );
            }
        }
    }

    if visible == 0 {
        findings.error_at("jobs", "should contain at least one visible job");
    }
}

pub fn job(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    if node.key().trim().is_empty() {
        findings.error(node, "job name can't be blank");
    }
    timeout(node, ctx, findings);
    delayed(node, ctx, findings);
}

/// `start_in` goes with `when: delayed` and nothing else.
fn delayed(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    let delayed = node.child_value("when").and_then(Value::as_str) == Some("delayed");
    let start_in = node.child_value("start_in").and_then(Value::as_u64);

    match (delayed, start_in) {
        (true, None) => findings.error(node, "start_in should be specified for delayed job"),
        (false, Some(_)) => findings.error(node, "start_in must be blank when not delayed job"),
        (true, Some(secs)) if secs > ctx.max_start_in.as_secs() => {
            findings.error(node, "start_in should not exceed the limit of one week")
        }
        _ => {}
    }
}

pub fn timeout(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    let secs = node.child_value("timeout").and_then(Value::as_u64);
    if secs.is_some_and(|secs| secs > ctx.max_timeout.as_secs()) {
        findings.error(
            node,
            format!(
                "timeout should not exceed the limit of {}",
                humantime::format_duration(ctx.max_timeout)
            ),
        );
    }
}

pub fn tags(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    let count = value_of(node).as_array().map_or(0, Vec::len);
    if count > ctx.max_tags {
        findings.error(
            node,
            format!("must be less than the limit of {} tags", ctx.max_tags),
        );
    }
}

pub fn stages(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let mut seen = HashSet::new();
    for stage in value_of(node).as_array().into_iter().flatten() {
        if let Some(name) = stage.as_str() {
            if !seen.insert(name) {
                findings.error(node, format!("contains duplicate stage: {}", name));
            }
        }
    }
}

pub fn variables(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let Some(map) = value_of(node).as_object() else {
        return;
    };
    for name in map.keys() {
        if !VARIABLE_NAME.is_match(name) {
            findings.error(node, format!("contains invalid variable name: {:?}", name));
        }
    }
}

pub fn artifacts(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let when = node.child_value("when").and_then(Value::as_str);
    if let Some(when) = when {
        if !matches!(when, "on_success" | "on_failure" | "always") {
            findings.error(node, "when should be on_success, on_failure or always");
        }
    }

    let expire_in = node.child_value("expire_in").and_then(Value::as_str);
    if let Some(expire_in) = expire_in {
        if expire_in != "never" && parse_duration_str(expire_in).is_none() {
            findings.error(node, "expire_in should be a duration");
        }
    }
}

pub fn glob_list(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    let count = value_of(node)
        .get("paths")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    if count > ctx.max_glob_paths {
        findings.error(
            node,
            format!("has too many entries (maximum {})", ctx.max_glob_paths),
        );
    }
}

pub fn rule(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    delayed_rule(node, ctx, findings);
}

fn delayed_rule(node: &ConfigNode, ctx: &ValidationContext, findings: &mut Findings) {
    let delayed = node.child_value("when").and_then(Value::as_str) == Some("delayed");
    let start_in = node.child_value("start_in").and_then(Value::as_u64);

    match (delayed, start_in) {
        (true, None) => findings.error(node, "start_in should be specified for delayed rule"),
        (false, Some(_)) => findings.error(node, "start_in must be blank when not delayed rule"),
        (true, Some(secs)) if secs > ctx.max_start_in.as_secs() => {
            findings.error(node, "start_in should not exceed the limit of one week")
        }
        _ => {}
    }
}

pub fn rules(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let Some(rules) = value_of(node).as_array() else {
        return;
    };
    let catch_all = rules.iter().position(|rule| !has_condition(rule));
    if let Some(index) = catch_all {
        if index + 1 < rules.len() {
            findings.warning(
                node,
                format!(
                    "rule {} always matches; the rules after it are never evaluated",
                    index
                ),
            );
        }
    }
}

pub fn include_entry(node: &ConfigNode, _ctx: &ValidationContext, findings: &mut Findings) {
    let Some(map) = value_of(node).as_object() else {
        return;
    };

    let locations: Vec<&str> = INCLUDE_LOCATIONS
        .iter()
        .copied()
        .filter(|key| map.contains_key(*key))
        .collect();
    if locations.len() != 1 {
        findings.error(
            node,
            format!("needs exactly one of: {}", INCLUDE_LOCATIONS.join(", ")),
        );
        return;
    }

    match locations[0] {
        "project" if !map.contains_key("file") => {
            findings.error(node, "missing required keys: file")
        }
        "artifact" if !map.contains_key("job") => {
            findings.error(node, "missing required keys: job")
        }
        _ => {}
    }

    if locations[0] != "project" && (map.contains_key("file") || map.contains_key("ref")) {
        findings.error(node, "file and ref can only be used with project includes");
    }
    if locations[0] != "artifact" && map.contains_key("job") {
        findings.error(node, "job can only be used with artifact includes");
    }
    if !matches!(locations[0], "remote" | "template") && map.contains_key("cache") {
        findings.error(node, "cache can only be used with remote or template includes");
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::{ConfigNode, ValidationContext};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn errors(raw: Value) -> Vec<String> {
        errors_with(raw, &ValidationContext::default())
    }

    fn errors_with(raw: Value, ctx: &ValidationContext) -> Vec<String> {
        ConfigNode::root(raw)
            .validate(ctx)
            .into_iter()
            .map(|p| p.message)
            .collect()
    }

    #[test]
    fn test_stage_must_be_declared() {
        let errors = errors(json!({
            "stages": ["build"],
            "rspec": {"script": "x", "stage": "test"}
        }));
        assert_eq!(
            errors,
            vec!["jobs:rspec config chosen stage test does not exist; available stages are .pre, build, .post"]
        );
    }

    #[test]
    fn test_visible_job_required() {
        let errors = errors(json!({".hidden": {"script": "x"}}));
        assert_eq!(errors, vec!["jobs config should contain at least one visible job"]);
    }

    #[test]
    fn test_script_required_for_visible_jobs() {
        let errors = errors(json!({"rspec": {"stage": "test"}}));
        assert_eq!(errors, vec!["jobs:rspec config missing required keys: script"]);
    }

    #[test]
    fn test_delayed_requires_start_in() {
        let errors = errors(json!({
            "a": {"script": "x", "when": "delayed"},
            "b": {"script": "x", "start_in": "5m"},
            "c": {"script": "x", "when": "delayed", "start_in": "2 weeks"},
            "d": {"script": "x", "when": "delayed", "start_in": "30 minutes"}
        }));
        assert_eq!(
            errors,
            vec![
                "jobs:a config start_in should be specified for delayed job",
                "jobs:b config start_in must be blank when not delayed job",
                "jobs:c config start_in should not exceed the limit of one week",
            ]
        );
    }

    #[test]
    fn test_timeout_limit() {
        let ctx = ValidationContext {
            max_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let errors = errors_with(json!({"a": {"script": "x", "timeout": "2h"}}), &ctx);
        assert_eq!(errors, vec!["jobs:a config timeout should not exceed the limit of 1h"]);
    }

    #[test]
    fn test_glob_list_limit_is_fatal() {
        let paths: Vec<String> = (0..51).map(|i| format!("dir{}/**", i)).collect();
        let errors = errors(json!({
            "a": {"script": "x", "rules": [{"changes": paths}]}
        }));
        assert_eq!(
            errors,
            vec!["jobs:a:rules:0:changes config has too many entries (maximum 50)"]
        );
    }

    #[test]
    fn test_tags_limit() {
        let tags: Vec<String> = (0..51).map(|i| format!("t{}", i)).collect();
        let errors = errors(json!({"a": {"script": "x", "tags": tags}}));
        assert_eq!(errors, vec!["jobs:a:tags config must be less than the limit of 50 tags"]);
    }

    #[test]
    fn test_duplicate_stages_and_bad_variable_names() {
        let errors = errors(json!({
            "stages": ["build", "build"],
            "variables": {"GOOD_NAME": "1", "bad name": "2"},
            "a": {"script": "x", "stage": "build"}
        }));
        assert_eq!(
            errors,
            vec![
                "stages config contains duplicate stage: build",
                "variables config contains invalid variable name: \"bad name\"",
            ]
        );
    }

    #[test]
    fn test_artifacts_checks() {
        let errors = errors(json!({
            "a": {"script": "x", "artifacts": {"paths": ["out/"], "when": "sometimes", "expire_in": "later"}}
        }));
        assert_eq!(
            errors,
            vec![
                "jobs:a:artifacts config when should be on_success, on_failure or always",
                "jobs:a:artifacts config expire_in should be a duration",
            ]
        );
    }

    #[test]
    fn test_include_entry_locations() {
        let errors = errors(json!({
            "include": [
                "ci/a.yml",
                {"local": "b.yml", "remote": "https://example.com/c.yml"},
                {"project": "group/lib"},
                {"local": "d.yml", "cache": true},
            ],
            "a": {"script": "x"}
        }));
        assert_eq!(
            errors,
            vec![
                "include:1 config needs exactly one of: local, remote, template, project, artifact",
                "include:2 config missing required keys: file",
                "include:3 config cache can only be used with remote or template includes",
            ]
        );
    }
}
