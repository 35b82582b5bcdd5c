//! Configuration compiler errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("KDL parse error: {0}")]
    Kdl(#[from] kdl::KdlError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{0} has not been validated")]
    NotValidated(String),

    #[error("{path} is invalid: {}", errors.join("; "))]
    Invalid { path: String, errors: Vec<String> },

    #[error("schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Include(#[from] IncludeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Which fan-out limit an include expansion ran into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOutLimit {
    TotalIncludes(usize),
    Depth(usize),
}

impl std::fmt::Display for FanOutLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanOutLimit::TotalIncludes(max) => {
                write!(f, "maximum of {} included files", max)
            }
            FanOutLimit::Depth(max) => write!(f, "maximum include depth of {}", max),
        }
    }
}

/// Fatal include failures, attributed to the directive that caused them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncludeError {
    #[error("included file `{location}` does not exist")]
    NotFound { location: String },

    #[error("remote file `{location}` could not be fetched: {reason}")]
    FetchError { location: String, reason: String },

    #[error("project `{project}` is not accessible for include `{location}`")]
    AccessDenied { project: String, location: String },

    #[error("circular include detected: {}", chain.join(" -> "))]
    CircularInclude { chain: Vec<String> },

    #[error("include fan-out exceeded: {limit}")]
    FanOutExceeded { limit: FanOutLimit },

    #[error("include `{location}` cache duration is invalid: {message}")]
    InvalidCacheDuration { location: String, message: String },

    #[error("include `{location}` has an invalid location: {message}")]
    InvalidLocation { location: String, message: String },

    #[error("included file `{location}` is invalid: {message}")]
    InvalidContent { location: String, message: String },

    #[error("{0}")]
    InvalidDirective(String),

    #[error("include expansion was cancelled")]
    Cancelled,
}

/// Job-scoped rule failures. They never abort unrelated jobs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("invalid expression `{expression}`: {message}")]
    Expression { expression: String, message: String },

    #[error("invalid pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },

    #[error("changes compare_to ref `{0}` is not available")]
    UnknownCompareRef(String),

    #[error("too many paths compared for `exists` (limit {limit})")]
    TooManyPaths { limit: usize },
}

/// One user-facing problem: where it is and what is wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub path: String,
    pub message: String,
}

impl Problem {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// A document problem, worded `<path> config <message>`.
    pub fn config(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        let path = path.into();
        let message = format!("{} config {}", path, message);
        Self { path, message }
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Every fatal problem found while compiling one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("pipeline configuration is invalid: {}", self.summary())]
pub struct CompileError {
    pub errors: Vec<Problem>,
}

impl CompileError {
    pub fn new(errors: Vec<Problem>) -> Self {
        Self { errors }
    }

    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![Problem::new(path, message)],
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|p| p.to_string()).collect()
    }

    /// Whether any problem message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.errors.iter().any(|p| p.to_string().contains(needle))
    }

    fn summary(&self) -> String {
        self.messages().join("; ")
    }
}

impl From<IncludeError> for CompileError {
    fn from(err: IncludeError) -> Self {
        CompileError::single("include", err.to_string())
    }
}
