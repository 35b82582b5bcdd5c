//! Document model for pipeline configuration.
//!
//! A pipeline document is parsed into a raw `serde_json::Value`, then walked
//! into a tree of [`ConfigNode`]s whose shape comes from the static entry
//! registry in [`entry`]. Validation aggregates every problem in the tree.

pub mod checks;
pub mod entry;
pub mod node;

pub use entry::{Entry, ScalarKind, Shape};
pub use node::{ConfigNode, Findings, ValidationContext};

use serde_json::Value;

use crate::error::{ConfigError, ConfigResult, Problem};

/// Stages used when a document declares none.
pub const DEFAULT_STAGES: &[&str] = &["build", "test", "deploy"];

/// Parse YAML text into a raw document, resolving anchors and merge keys.
pub fn parse_yaml(text: &str) -> ConfigResult<Value> {
    let mut yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
    yaml.apply_merge()?;
    serde_json::to_value(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Full stage order of a pipeline: `.pre`, the declared stages, `.post`.
pub fn pipeline_stages(declared: Option<&Value>) -> Vec<String> {
    let declared: Vec<String> = match declared.and_then(Value::as_array) {
        Some(stages) => stages
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
    };

    let mut stages = vec![".pre".to_string()];
    stages.extend(declared.into_iter().filter(|s| s != ".pre" && s != ".post"));
    stages.push(".post".to_string());
    stages
}

/// Validate a raw document, returning the validated tree or every error.
pub fn validate_document(raw: Value, ctx: &ValidationContext) -> Result<ConfigNode, Vec<Problem>> {
    let mut root = ConfigNode::root(raw);
    let errors = root.validate(ctx);
    if errors.is_empty() {
        Ok(root)
    } else {
        Err(errors)
    }
}
