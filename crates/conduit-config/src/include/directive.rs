//! `include` directives.

use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::document::entry::INCLUDE;
use crate::document::{ConfigNode, ValidationContext};
use crate::error::IncludeError;
use crate::rules::RuleSet;

/// Cache lifetime used for `cache: true`.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Ref used for project includes that do not name one.
pub const DEFAULT_REF: &str = "HEAD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IncludeKind {
    Local,
    Remote,
    Template,
    ProjectFile,
    Artifact,
}

impl IncludeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncludeKind::Local => "local",
            IncludeKind::Remote => "remote",
            IncludeKind::Template => "template",
            IncludeKind::ProjectFile => "project",
            IncludeKind::Artifact => "artifact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Disabled,
    Ttl(Duration),
}

/// What makes two directives the same include.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncludeIdentity {
    pub kind: IncludeKind,
    pub location: String,
    pub project: Option<String>,
    pub git_ref: Option<String>,
    pub job: Option<String>,
}

impl std::fmt::Display for IncludeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, &self.project, &self.git_ref, &self.job) {
            (IncludeKind::ProjectFile, Some(project), Some(git_ref), _) => {
                write!(f, "{}@{}:{}", project, git_ref, self.location)
            }
            (IncludeKind::Artifact, _, _, Some(job)) => {
                write!(f, "artifact {} of job {}", self.location, job)
            }
            (IncludeKind::Local, _, _, _) | (IncludeKind::Remote, _, _, _) => {
                f.write_str(&self.location)
            }
            (kind, _, _, _) => write!(f, "{} {}", kind.as_str(), self.location),
        }
    }
}

/// One `include` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    pub kind: IncludeKind,
    /// Path, URL or template name.
    pub location: String,
    /// Project of a project include, or the project a local include reads from.
    pub project: Option<String>,
    pub git_ref: Option<String>,
    /// Job whose artifact is included.
    pub job: Option<String>,
    pub cache: CachePolicy,
    pub rules: RuleSet,
}

impl IncludeDirective {
    pub fn local(path: impl Into<String>) -> Self {
        let path: String = path.into();
        Self::new(IncludeKind::Local, path.trim_start_matches('/'))
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::new(IncludeKind::Remote, url)
    }

    fn new(kind: IncludeKind, location: impl Into<String>) -> Self {
        Self {
            kind,
            location: location.into(),
            project: None,
            git_ref: None,
            job: None,
            cache: CachePolicy::Disabled,
            rules: RuleSet::default(),
        }
    }

    pub fn identity(&self) -> IncludeIdentity {
        IncludeIdentity {
            kind: self.kind,
            location: self.location.clone(),
            project: self.project.clone(),
            git_ref: self.git_ref.clone(),
            job: self.job.clone(),
        }
    }

    /// Whether the location is a wildcard over local paths.
    pub fn is_wildcard(&self) -> bool {
        self.kind == IncludeKind::Local && self.location.contains('*')
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.cache {
            CachePolicy::Ttl(ttl) => Some(ttl),
            CachePolicy::Disabled => None,
        }
    }

    /// Parse the `include` value of a document.
    ///
    /// The value is validated with the document registry first, so every
    /// shape problem is reported at once.
    pub fn parse_all(raw: &Value, min_cache_ttl: Duration) -> Result<Vec<Self>, IncludeError> {
        let mut node = ConfigNode::new("include", vec!["include".to_string()], &INCLUDE, Some(raw.clone()));
        let errors = node.validate(&ValidationContext::default());
        if !errors.is_empty() {
            let messages: Vec<String> = errors.into_iter().map(|p| p.message).collect();
            return Err(IncludeError::InvalidDirective(messages.join("; ")));
        }
        let composed = node
            .value()
            .map_err(|e| IncludeError::InvalidDirective(e.to_string()))?;

        let mut directives = Vec::new();
        for entry in composed.as_array().into_iter().flatten() {
            directives.extend(Self::parse_entry(entry, min_cache_ttl)?);
        }
        Ok(directives)
    }

    fn parse_entry(entry: &Value, min_cache_ttl: Duration) -> Result<Vec<Self>, IncludeError> {
        if let Some(location) = entry.as_str() {
            let directive = if location.starts_with("http://") || location.starts_with("https://") {
                Self::remote(location)
            } else {
                Self::local(location)
            };
            directive.check_location()?;
            return Ok(vec![directive]);
        }

        let text = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);

        let mut directives: Vec<Self> = if let Some(path) = text("local") {
            vec![Self::local(path)]
        } else if let Some(url) = text("remote") {
            vec![Self::remote(url)]
        } else if let Some(name) = text("template") {
            vec![Self::new(IncludeKind::Template, name)]
        } else if let Some(project) = text("project") {
            let git_ref = text("ref").unwrap_or_else(|| DEFAULT_REF.to_string());
            entry
                .get("file")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(|file| {
                    let mut directive = Self::new(
                        IncludeKind::ProjectFile,
                        file.trim_start_matches('/'),
                    );
                    directive.project = Some(project.clone());
                    directive.git_ref = Some(git_ref.clone());
                    directive
                })
                .collect()
        } else if let Some(path) = text("artifact") {
            let mut directive = Self::new(IncludeKind::Artifact, path.trim_start_matches('/'));
            directive.job = text("job");
            vec![directive]
        } else {
            return Err(IncludeError::InvalidDirective(format!(
                "include entry {} has no location",
                entry
            )));
        };

        let rules = match entry.get("rules") {
            Some(rules) => RuleSet::from_value(rules)
                .map_err(|e| IncludeError::InvalidDirective(e.to_string()))?,
            None => RuleSet::default(),
        };

        for directive in &mut directives {
            directive.cache = cache_policy(entry.get("cache"), &directive.location, min_cache_ttl)?;
            directive.rules = rules.clone();
            directive.check_location()?;
        }
        Ok(directives)
    }

    fn check_location(&self) -> Result<(), IncludeError> {
        if self.location.trim().is_empty() {
            return Err(IncludeError::InvalidLocation {
                location: self.location.clone(),
                message: "location must not be empty".to_string(),
            });
        }
        if self.kind == IncludeKind::Remote {
            let url = Url::parse(&self.location).map_err(|e| IncludeError::InvalidLocation {
                location: self.location.clone(),
                message: e.to_string(),
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(IncludeError::InvalidLocation {
                    location: self.location.clone(),
                    message: format!("unsupported scheme `{}`", url.scheme()),
                });
            }
        }
        Ok(())
    }
}

fn cache_policy(
    value: Option<&Value>,
    location: &str,
    min_ttl: Duration,
) -> Result<CachePolicy, IncludeError> {
    let ttl = match value {
        None | Some(Value::Bool(false)) => return Ok(CachePolicy::Disabled),
        Some(Value::Bool(true)) => DEFAULT_CACHE_TTL,
        Some(other) => other
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| IncludeError::InvalidCacheDuration {
                location: location.to_string(),
                message: format!("{} is not a duration", other),
            })?,
    };

    if ttl < min_ttl {
        return Err(IncludeError::InvalidCacheDuration {
            location: location.to_string(),
            message: format!(
                "{} is below the minimum of {}",
                humantime::format_duration(ttl),
                humantime::format_duration(min_ttl)
            ),
        });
    }
    Ok(CachePolicy::Ttl(ttl))
}
