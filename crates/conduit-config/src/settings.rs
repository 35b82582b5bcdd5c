//! Compiler settings (`conduit.kdl`).
//!
//! ```kdl
//! limits {
//!     max-includes 150
//!     max-depth 100
//!     max-exists-comparisons 10000
//!     concurrency 8
//! }
//! remote {
//!     timeout "10s"
//!     min-cache-ttl "1m"
//! }
//! jobs {
//!     default-timeout "1h"
//!     max-timeout "24h"
//! }
//! cache {
//!     capacity 1000
//! }
//! ```
//!
//! Every section and field is optional.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::document::ValidationContext;
use crate::duration::parse_duration_str;
use crate::include::ResolverOptions;
use crate::{ConfigError, ConfigResult};

/// File name looked up next to the pipeline document.
pub const SETTINGS_FILE: &str = "conduit.kdl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_includes: usize,
    pub max_depth: usize,
    pub max_exists_comparisons: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub timeout: Duration,
    pub min_cache_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Timeout of jobs that set none, directly or through `default`.
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub capacity: u64,
}

/// Settings of the configuration compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub limits: Limits,
    pub remote: RemoteSettings,
    pub jobs: JobSettings,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let resolver = ResolverOptions::default();
        Self {
            limits: Limits {
                max_includes: resolver.max_includes,
                max_depth: resolver.max_depth,
                max_exists_comparisons: resolver.max_exists_comparisons,
                concurrency: resolver.concurrency,
            },
            remote: RemoteSettings {
                timeout: resolver.remote_timeout,
                min_cache_ttl: resolver.min_cache_ttl,
            },
            jobs: JobSettings {
                default_timeout: Duration::from_secs(3600),
                max_timeout: ValidationContext::default().max_timeout,
            },
            cache: CacheSettings { capacity: 1000 },
        }
    }
}

impl Settings {
    /// Load settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => parse_settings(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            max_includes: self.limits.max_includes,
            max_depth: self.limits.max_depth,
            concurrency: self.limits.concurrency,
            remote_timeout: self.remote.timeout,
            min_cache_ttl: self.remote.min_cache_ttl,
            max_exists_comparisons: self.limits.max_exists_comparisons,
        }
    }

    pub fn validation_context(&self) -> ValidationContext {
        ValidationContext {
            max_timeout: self.jobs.max_timeout,
            ..ValidationContext::default()
        }
    }
}

/// Parse settings from KDL text.
pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for section in doc.nodes() {
        let Some(children) = section.children() else {
            continue;
        };
        let section_name = section.name().value();
        for node in children.nodes() {
            let field = node.name().value();
            match (section_name, field) {
                ("limits", "max-includes") => settings.limits.max_includes = count(section_name, node)?,
                ("limits", "max-depth") => settings.limits.max_depth = count(section_name, node)?,
                ("limits", "max-exists-comparisons") => {
                    settings.limits.max_exists_comparisons = count(section_name, node)?
                }
                ("limits", "concurrency") => settings.limits.concurrency = count(section_name, node)?,
                ("remote", "timeout") => settings.remote.timeout = duration(section_name, node)?,
                ("remote", "min-cache-ttl") => settings.remote.min_cache_ttl = duration(section_name, node)?,
                ("jobs", "default-timeout") => settings.jobs.default_timeout = duration(section_name, node)?,
                ("jobs", "max-timeout") => settings.jobs.max_timeout = duration(section_name, node)?,
                ("cache", "capacity") => settings.cache.capacity = count::<u64>(section_name, node)?,
                _ => {} // Ignore unknown nodes
            }
        }
    }

    if settings.jobs.default_timeout > settings.jobs.max_timeout {
        return Err(ConfigError::InvalidValue {
            field: "jobs.default-timeout".to_string(),
            message: "must not exceed jobs.max-timeout".to_string(),
        });
    }
    Ok(settings)
}

fn invalid(section: &str, node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("{}.{}", section, node.name().value()),
        message: message.to_string(),
    }
}

fn first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn count<T: TryFrom<i128>>(section: &str, node: &KdlNode) -> ConfigResult<T> {
    let value = first_arg(node)
        .and_then(|v| v.as_integer())
        .ok_or_else(|| invalid(section, node, "expected an integer"))?;
    if value <= 0 {
        return Err(invalid(section, node, "must be greater than zero"));
    }
    T::try_from(value).map_err(|_| invalid(section, node, "is out of range"))
}

/// A duration: a string such as `"10s"` or an integer number of seconds.
fn duration(section: &str, node: &KdlNode) -> ConfigResult<Duration> {
    let value = first_arg(node).ok_or_else(|| invalid(section, node, "expected a duration"))?;
    let parsed = match (value.as_string(), value.as_integer()) {
        (Some(text), _) => parse_duration_str(text),
        (None, Some(secs)) => u64::try_from(secs).ok().map(Duration::from_secs),
        _ => None,
    };
    match parsed {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(invalid(section, node, "expected a duration")),
    }
}
