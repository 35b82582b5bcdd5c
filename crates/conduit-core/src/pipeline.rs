//! Compiled pipeline output.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::job::JobSpec;

/// Outcome token of a rule, and the run condition of a job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Run when all earlier stages succeeded.
    #[default]
    #[display("on_success")]
    OnSuccess,
    /// Run only when an earlier stage failed.
    #[display("on_failure")]
    OnFailure,
    /// Run regardless of earlier stages.
    #[display("always")]
    Always,
    /// Wait for a person to start the job.
    #[display("manual")]
    Manual,
    /// Start after `start_in` has elapsed.
    #[display("delayed")]
    Delayed,
    /// Never run; the job is left out of the pipeline.
    #[display("never")]
    Never,
}

impl When {
    /// Tokens accepted in documents, in the order they are reported.
    pub const TOKENS: &'static [&'static str] =
        &["on_success", "on_failure", "always", "manual", "delayed", "never"];

    /// Whether a job with this outcome is part of the pipeline at all.
    pub fn includes_job(&self) -> bool {
        !matches!(self, When::Never)
    }
}

impl std::str::FromStr for When {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_success" | "run" => Ok(When::OnSuccess),
            "on_failure" => Ok(When::OnFailure),
            "always" => Ok(When::Always),
            "manual" => Ok(When::Manual),
            "delayed" => Ok(When::Delayed),
            "never" | "skip" => Ok(When::Never),
            _ => Err(format!("unknown when token: {}", s)),
        }
    }
}

/// Severity of a compiler diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A job-attributed problem that did not abort compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Job the problem belongs to.
    pub job: String,
    pub message: String,
}

/// The compiled pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGraph {
    /// Declared stages in execution order.
    pub stages: Vec<String>,
    /// Jobs ordered by stage, then by declaration order.
    pub jobs: Vec<JobSpec>,
    /// True when `workflow:rules` kept the pipeline from being created.
    pub workflow_excluded: bool,
    /// Job-scoped errors and warnings.
    pub diagnostics: Vec<Diagnostic>,
}

impl JobGraph {
    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether any job was dropped because of a job-scoped error.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}
