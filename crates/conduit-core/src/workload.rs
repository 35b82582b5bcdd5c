//! Ad-hoc jobs generated by the system rather than authored in a repository.
//!
//! Workloads never pass through includes or rules, so nothing a repository
//! contains can influence them. Their variables are always raw: values are
//! never expanded, which keeps injected values from referencing other
//! variables.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::job::{Artifacts, JobSpec, JobVariable, Step};
use crate::pipeline::When;
use crate::{Error, Result};

/// Timeout used when the caller does not set one.
pub const DEFAULT_WORKLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

const WORKLOAD_NAME: &str = "workload";
const WORKLOAD_STAGE: &str = "workload";

/// Builder for a single workload job.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    name: String,
    image: String,
    commands: Vec<String>,
    variables: BTreeMap<String, String>,
    artifact_paths: Vec<String>,
    timeout: Duration,
}

impl WorkloadBuilder {
    pub fn new(image: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: WORKLOAD_NAME.to_string(),
            image: image.into(),
            commands,
            variables: BTreeMap::new(),
            artifact_paths: Vec::new(),
            timeout: DEFAULT_WORKLOAD_TIMEOUT,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn variables<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variables
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn artifact_paths(mut self, paths: Vec<String>) -> Self {
        self.artifact_paths = paths;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidArgument("image must not be empty".to_string()));
        }
        if self.commands.is_empty() {
            return Err(Error::InvalidArgument(
                "commands must not be empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let artifacts = if self.artifact_paths.is_empty() {
            None
        } else {
            Some(Artifacts {
                paths: self.artifact_paths,
                ..Default::default()
            })
        };

        Ok(JobSpec {
            name: self.name,
            stage: WORKLOAD_STAGE.to_string(),
            image: Some(self.image),
            steps: vec![Step {
                name: "script".to_string(),
                script: self.commands,
                when: When::OnSuccess,
                timeout: self.timeout,
                allow_failure: false,
            }],
            artifacts,
            variables: self
                .variables
                .into_iter()
                .map(|(k, v)| (k, JobVariable::raw(v)))
                .collect(),
            when: When::OnSuccess,
            allow_failure: false,
            allowed_exit_codes: Vec::new(),
            start_in: None,
            tags: Vec::new(),
            timeout: self.timeout,
        })
    }
}

/// Build a workload job in one call.
pub fn build_workload(
    image: &str,
    commands: Vec<String>,
    variables: BTreeMap<String, String>,
    artifact_paths: Option<Vec<String>>,
    timeout: Option<Duration>,
) -> Result<JobSpec> {
    WorkloadBuilder::new(image, commands)
        .variables(variables)
        .artifact_paths(artifact_paths.unwrap_or_default())
        .timeout(timeout.unwrap_or(DEFAULT_WORKLOAD_TIMEOUT))
        .build()
}
