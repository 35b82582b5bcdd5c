//! Job specifications handed to the scheduler.
//!
//! Both the configuration compiler and the workload builder produce
//! `JobSpec` values, so the scheduler sees one contract regardless of origin.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::pipeline::When;

/// Specification for a job to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name, unique within a pipeline.
    pub name: String,
    /// Stage this job belongs to.
    pub stage: String,
    /// Container image to run.
    pub image: Option<String>,
    /// Ordered execution steps.
    pub steps: Vec<Step>,
    /// Files kept after the job finishes.
    pub artifacts: Option<Artifacts>,
    /// Variables exposed to the job, sorted by name.
    pub variables: BTreeMap<String, JobVariable>,
    /// When the job runs relative to earlier stages.
    pub when: When,
    /// Whether a failure of this job fails the pipeline.
    pub allow_failure: bool,
    /// Exit codes that are tolerated even when `allow_failure` is false.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_exit_codes: Vec<i32>,
    /// Delay before a `delayed` job starts.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_secs_opt")]
    pub start_in: Option<Duration>,
    /// Runner tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Maximum execution time.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl JobSpec {
    /// Look up the step with the given name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Whether the job waits for a person to start it.
    pub fn is_manual(&self) -> bool {
        self.when == When::Manual
    }
}

/// One execution step of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (`script`, `after_script`).
    pub name: String,
    /// Shell lines run in order.
    pub script: Vec<String>,
    /// Condition under which the step runs.
    pub when: When,
    /// Step timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Whether a failure of this step is tolerated.
    pub allow_failure: bool,
}

/// Artifact declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub name: Option<String>,
    pub paths: Vec<String>,
    pub expire_in: Option<String>,
    /// Upload condition (`on_success`, `on_failure`, `always`).
    pub when: Option<String>,
}

/// A job variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobVariable {
    pub value: String,
    /// When false, `$NAME` references inside `value` are never expanded.
    pub expand: bool,
}

impl JobVariable {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expand: true,
        }
    }

    /// A variable whose value is used verbatim.
    pub fn raw(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expand: false,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
