//! `extends`: job inheritance.

use serde_json::{Map, Value};

use crate::document::entry::is_reserved_key;
use crate::error::Problem;
use crate::merge::deep_merge;

/// Deepest chain of `extends` a job may build on, the job itself included.
pub const MAX_EXTENDS_DEPTH: usize = 11;

const EXTENDS_KEY: &str = "extends";

/// Expand `extends` in every top-level job of `document`.
///
/// Parents merge in listed order, then the job's own keys apply on top.
/// The `extends` key is removed from expanded jobs.
pub fn expand_extends(document: &Value) -> Result<Value, Vec<Problem>> {
    let Some(entries) = document.as_object() else {
        return Ok(document.clone());
    };

    let mut problems = Vec::new();
    let mut expanded = Map::with_capacity(entries.len());
    for (key, value) in entries {
        if is_reserved_key(key) || !value.is_object() {
            expanded.insert(key.clone(), value.clone());
            continue;
        }
        let mut chain = Vec::new();
        match resolve(entries, key, &mut chain) {
            Ok(job) => {
                expanded.insert(key.clone(), job);
            }
            Err(problem) => problems.push(problem),
        }
    }

    if problems.is_empty() {
        Ok(Value::Object(expanded))
    } else {
        Err(problems)
    }
}

fn parents(name: &str, job: &Value) -> Result<Vec<String>, Problem> {
    let invalid = || Problem::config(format!("jobs:{}:extends", name), "should be an array of strings or a string");
    match job.get(EXTENDS_KEY) {
        None => Ok(Vec::new()),
        Some(Value::String(parent)) => Ok(vec![parent.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        Some(_) => Err(invalid()),
    }
}

fn resolve(entries: &Map<String, Value>, name: &str, chain: &mut Vec<String>) -> Result<Value, Problem> {
    // Errors are reported against the job expansion started from.
    let origin = chain.first().cloned().unwrap_or_else(|| name.to_string());
    let path = format!("jobs:{}", origin);

    if chain.iter().any(|seen| seen == name) {
        return Err(Problem::config(
            path,
            format!("circular dependency detected in `extends`: {} -> {}", chain.join(" -> "), name),
        ));
    }
    if chain.len() >= MAX_EXTENDS_DEPTH {
        return Err(Problem::config(
            path,
            format!("`extends` nesting too deep, the limit is {}", MAX_EXTENDS_DEPTH),
        ));
    }

    let job = entries.get(name).filter(|value| value.is_object());
    let Some(job) = job else {
        let child = chain.last().cloned().unwrap_or_default();
        return Err(Problem::config(
            path,
            format!("{}: unknown key in `extends` ({})", child, name),
        ));
    };

    let parents = parents(name, job)?;
    if parents.is_empty() {
        return Ok(job.clone());
    }

    chain.push(name.to_string());
    let mut merged = Value::Object(Map::new());
    for parent in &parents {
        if is_reserved_key(parent) {
            chain.pop();
            return Err(Problem::config(
                path,
                format!("{}: `extends` cannot refer to the reserved key {}", name, parent),
            ));
        }
        let resolved = resolve(entries, parent, chain)?;
        deep_merge(&mut merged, &resolved);
    }
    chain.pop();

    let mut own = job.clone();
    if let Value::Object(map) = &mut own {
        map.shift_remove(EXTENDS_KEY);
    }
    deep_merge(&mut merged, &own);
    if let Value::Object(map) = &mut merged {
        map.shift_remove(EXTENDS_KEY);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_inherits_from_hidden_template() {
        let document = json!({
            ".ruby": {"image": "ruby:3.3", "variables": {"A": "1"}, "script": ["bundle"]},
            "rspec": {"extends": ".ruby", "script": ["rspec"], "variables": {"B": "2"}}
        });
        let expanded = expand_extends(&document).unwrap();

        assert_eq!(
            expanded["rspec"],
            json!({"image": "ruby:3.3", "variables": {"A": "1", "B": "2"}, "script": ["rspec"]})
        );
    }

    #[test]
    fn test_parents_merge_in_listed_order() {
        let document = json!({
            ".a": {"image": "a", "tags": ["a"]},
            ".b": {"image": "b"},
            "job": {"extends": [".a", ".b"], "script": "x"}
        });
        let expanded = expand_extends(&document).unwrap();
        assert_eq!(expanded["job"]["image"], json!("b"));
        assert_eq!(expanded["job"]["tags"], json!(["a"]));
        assert!(expanded["job"].get("extends").is_none());
    }

    #[test]
    fn test_multi_level_inheritance() {
        let document = json!({
            ".base": {"stage": "build"},
            ".middle": {"extends": ".base", "image": "alpine"},
            "job": {"extends": ".middle", "script": "x"}
        });
        let expanded = expand_extends(&document).unwrap();
        assert_eq!(expanded["job"], json!({"stage": "build", "image": "alpine", "script": "x"}));
    }

    #[test]
    fn test_cycle_is_reported() {
        let document = json!({
            ".a": {"extends": ".b"},
            ".b": {"extends": ".a"},
            "job": {"extends": ".a", "script": "x"}
        });
        let problems = expand_extends(&document).unwrap_err();
        assert!(problems.iter().any(|p| p.path == "jobs:job"
            && p.message.contains("circular dependency detected in `extends`")));
    }

    #[test]
    fn test_unknown_parent() {
        let document = json!({"job": {"extends": ".missing", "script": "x"}});
        let problems = expand_extends(&document).unwrap_err();
        assert_eq!(
            problems[0].message,
            "jobs:job config job: unknown key in `extends` (.missing)"
        );
    }

    #[test]
    fn test_depth_limit() {
        let mut document = Map::new();
        for i in 0..12 {
            document.insert(format!(".t{}", i), json!({"extends": format!(".t{}", i + 1)}));
        }
        document.insert(".t12".to_string(), json!({"image": "x"}));
        document.insert("job".to_string(), json!({"extends": ".t0", "script": "x"}));

        let problems = expand_extends(&Value::Object(document)).unwrap_err();
        assert!(problems.iter().any(|p| p.message.contains("nesting too deep")));
    }

    #[test]
    fn test_reserved_keys_are_untouched() {
        let document = json!({"variables": {"extends": "not a job"}, "job": {"script": "x"}});
        let expanded = expand_extends(&document).unwrap();
        assert_eq!(expanded, document);
    }
}
