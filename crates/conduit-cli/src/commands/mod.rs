//! CLI command implementations.

pub mod pipeline;

use anyhow::{Context, Result};
use conduit_config::SchemaCatalogue;
use conduit_core::build_workload;
use std::path::Path;
use std::time::Duration;

/// Parse a `KEY=VALUE` argument.
pub fn parse_key_value(arg: &str) -> std::result::Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", arg)),
    }
}

pub fn workload(
    image: &str,
    commands: Vec<String>,
    variables: Vec<(String, String)>,
    artifacts: Vec<String>,
    timeout: Option<Duration>,
) -> Result<()> {
    let artifacts = if artifacts.is_empty() { None } else { Some(artifacts) };
    let spec = build_workload(image, commands, variables.into_iter().collect(), artifacts, timeout)
        .context("Failed to build workload")?;
    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}

pub fn check_report(document_type: &str, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read report: {}", path.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse report: {}", path.display()))?;

    let catalogue = SchemaCatalogue::builtin().context("Failed to load bundled schemas")?;
    let report = catalogue.validate(document_type, &payload);

    for warning in &report.warnings {
        println!("Warning: {}", warning);
    }
    if report.is_valid() {
        println!(
            "Report is valid ({} {})",
            document_type,
            report.version.as_deref().unwrap_or("unversioned")
        );
        Ok(())
    } else {
        for error in &report.errors {
            println!("Schema error {}", error);
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_key_value("EMPTY=").unwrap().1, "");
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
