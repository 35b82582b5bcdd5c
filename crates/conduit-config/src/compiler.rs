//! Pipeline compilation: from authored YAML to a job graph.
//!
//! Structural validation of the merged document goes through the entry
//! registry in [`crate::document`], which reports `<path> config <message>`
//! problems and composes normalized values. The `ci-config` schema in
//! [`crate::schema::SchemaCatalogue`] publishes the same shape for external
//! tooling and is not consulted here.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::document::{parse_yaml, pipeline_stages, validate_document};
use crate::error::{CompileError, Problem};
use crate::extends::expand_extends;
use crate::include::{CancellationFlag, Clock, FragmentCache, IncludeResolver};
use crate::merge::merge_fragments;
use crate::rules::{Decision, EvalContext, RuleSet, evaluate};
use crate::settings::Settings;
use crate::variables::{PipelineContext, interpolate, variable_defs};
use conduit_core::http::HttpClient;
use conduit_core::repository::Repository;
use conduit_core::{Artifacts, Diagnostic, JobGraph, JobSpec, JobVariable, Severity, Step, When};

/// Compiles pipeline documents against a repository.
pub struct Compiler {
    resolver: IncludeResolver,
    settings: Settings,
}

impl Compiler {
    pub fn new(
        repository: Arc<dyn Repository>,
        http: Arc<dyn HttpClient>,
        cache: Arc<dyn FragmentCache>,
    ) -> Self {
        let settings = Settings::default();
        Self {
            resolver: IncludeResolver::new(repository, http, cache)
                .with_options(settings.resolver_options()),
            settings,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.resolver = self.resolver.with_options(settings.resolver_options());
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.resolver = self.resolver.with_clock(clock);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compile YAML source.
    pub async fn compile(&self, source: &str, ctx: &PipelineContext) -> Result<JobGraph, CompileError> {
        self.compile_with_cancel(source, ctx, &CancellationFlag::new()).await
    }

    pub async fn compile_with_cancel(
        &self,
        source: &str,
        ctx: &PipelineContext,
        cancel: &CancellationFlag,
    ) -> Result<JobGraph, CompileError> {
        let document = parse_yaml(source).map_err(|e| CompileError::new(vec![Problem::config("root", e)]))?;
        self.compile_value(&document, ctx, cancel).await
    }

    /// Compile an already parsed document.
    pub async fn compile_value(
        &self,
        document: &Value,
        ctx: &PipelineContext,
        cancel: &CancellationFlag,
    ) -> Result<JobGraph, CompileError> {
        let fragments = self.resolver.resolve_document(document, ctx, cancel).await?;
        let merged = merge_fragments(document, &fragments);
        let expanded = expand_extends(&merged).map_err(CompileError::new)?;

        let root = validate_document(expanded, &self.settings.validation_context())
            .map_err(CompileError::new)?;
        let composed = root
            .value()
            .map_err(|e| CompileError::new(vec![Problem::new("root", e.to_string())]))?;

        let mut diagnostics: Vec<Diagnostic> = root
            .all_warnings()
            .into_iter()
            .map(|problem| Diagnostic {
                severity: Severity::Warning,
                job: job_of(&problem.path).to_string(),
                message: problem.message,
            })
            .collect();

        let tree = self.tree(ctx).await;
        let stages = pipeline_stages(composed.get("stages"));
        let context_vars = ctx.variables();
        let mut globals = declared_variables(composed.get("variables"));

        if let Some(rules) = composed.get("workflow").and_then(|w| w.get("rules")) {
            let workflow_problem = |e: &dyn std::fmt::Display| CompileError::new(vec![Problem::config("workflow:rules", e)]);
            let rules = RuleSet::from_value(rules).map_err(|e| workflow_problem(&e))?;
            let env = environment(&context_vars, &globals);
            let eval = self.eval_context(ctx, &env, &tree);
            let decision = evaluate(rules.rules(), &eval, When::Always).map_err(|e| workflow_problem(&e))?;
            match decision {
                Some(decision) if decision.includes_job() => globals.extend(decision.variables),
                _ => {
                    info!(project = %ctx.project, "Pipeline excluded by workflow rules");
                    return Ok(JobGraph {
                        stages,
                        jobs: Vec::new(),
                        workflow_excluded: true,
                        diagnostics,
                    });
                }
            }
        }

        let materializer = Materializer {
            compiler: self,
            ctx,
            tree: &tree,
            context_vars: &context_vars,
            globals: &globals,
            defaults: Defaults::new(composed),
        };

        let mut jobs = Vec::new();
        for node in root.jobs().filter(|job| !job.is_hidden()) {
            let Some(job) = composed.get(node.key()) else {
                continue;
            };
            if let Some(spec) = materializer.job(node.key(), job, &mut diagnostics) {
                jobs.push(spec);
            }
        }
        jobs.sort_by_key(|job| {
            stages
                .iter()
                .position(|stage| *stage == job.stage)
                .unwrap_or(usize::MAX)
        });

        info!(
            project = %ctx.project,
            git_ref = %ctx.git_ref,
            includes = fragments.len(),
            jobs = jobs.len(),
            diagnostics = diagnostics.len(),
            "Compiled pipeline"
        );
        Ok(JobGraph {
            stages,
            jobs,
            workflow_excluded: false,
            diagnostics,
        })
    }

    async fn tree(&self, ctx: &PipelineContext) -> Vec<String> {
        if let Some(tree) = &ctx.tree {
            return tree.clone();
        }
        match self
            .resolver
            .repository()
            .list_files(&ctx.project, &ctx.git_ref)
            .await
        {
            Ok(tree) => tree,
            Err(e) => {
                warn!(project = %ctx.project, error = %e, "Could not list the tree, `exists` rules see no files");
                Vec::new()
            }
        }
    }

    fn eval_context<'a>(
        &self,
        ctx: &'a PipelineContext,
        variables: &'a BTreeMap<String, String>,
        tree: &'a [String],
    ) -> EvalContext<'a> {
        EvalContext {
            variables,
            changed_paths: ctx.changed_paths.as_deref(),
            changed_by_ref: &ctx.changed_by_ref,
            tree,
            max_exists_comparisons: self.settings.limits.max_exists_comparisons,
        }
    }
}

/// Job a diagnostic path belongs to: `jobs:<name>:...` names the job.
fn job_of(path: &str) -> &str {
    match path.strip_prefix("jobs:") {
        Some(rest) => rest.split(':').next().unwrap_or(rest),
        None => path.split(':').next().unwrap_or(path),
    }
}

fn declared_variables(value: Option<&Value>) -> BTreeMap<String, JobVariable> {
    variable_defs(value)
        .into_iter()
        .map(|(name, def)| {
            (
                name,
                JobVariable {
                    value: def.value,
                    expand: def.expand,
                },
            )
        })
        .collect()
}

/// Context variables overlaid with declared values, unexpanded.
fn environment(
    context: &BTreeMap<String, String>,
    declared: &BTreeMap<String, JobVariable>,
) -> BTreeMap<String, String> {
    let mut env = context.clone();
    env.extend(declared.iter().map(|(name, var)| (name.clone(), var.value.clone())));
    env
}

/// Value of `name` below the highest layer that declares it.
///
/// A variable referring to its own name sees this value.
fn inherited(
    context: &BTreeMap<String, String>,
    layers: &[&BTreeMap<String, JobVariable>],
    name: &str,
) -> Option<String> {
    let defining = layers.iter().rposition(|layer| layer.contains_key(name))?;
    layers[..defining]
        .iter()
        .rev()
        .find_map(|layer| layer.get(name))
        .map(|var| var.value.clone())
        .or_else(|| context.get(name).cloned())
}

/// Values jobs inherit when they do not set them.
///
/// `default` wins over the top-level `image`, `before_script` and
/// `after_script` keys.
struct Defaults<'a> {
    image: Option<&'a Value>,
    before_script: Option<&'a Value>,
    after_script: Option<&'a Value>,
    timeout: Option<&'a Value>,
    artifacts: Option<&'a Value>,
    tags: Option<&'a Value>,
    allow_failure: Option<&'a Value>,
}

impl<'a> Defaults<'a> {
    fn new(root: &'a Value) -> Self {
        let default = root.get("default");
        let declared = |key: &str| default.and_then(|d| d.get(key));
        Self {
            image: declared("image").or_else(|| root.get("image")),
            before_script: declared("before_script").or_else(|| root.get("before_script")),
            after_script: declared("after_script").or_else(|| root.get("after_script")),
            timeout: declared("timeout"),
            artifacts: declared("artifacts"),
            tags: declared("tags"),
            allow_failure: declared("allow_failure"),
        }
    }
}

/// Collects substitution warnings for one job.
struct Substitution<'a> {
    job: &'a str,
    env: BTreeMap<String, String>,
    reported: BTreeSet<(String, String)>,
    diagnostics: Vec<Diagnostic>,
}

impl Substitution<'_> {
    fn apply(&mut self, field: &str, text: &str) -> String {
        let result = interpolate(text, &self.env);
        for name in result.missing {
            self.warn(field, name);
        }
        result.text
    }

    /// Apply with `name` bound to `value` instead of its own declaration.
    fn apply_shadowed(&mut self, field: &str, text: &str, name: &str, value: Option<String>) -> String {
        let own = match value {
            Some(value) => self.env.insert(name.to_string(), value),
            None => self.env.remove(name),
        };
        let result = self.apply(field, text);
        match own {
            Some(own) => self.env.insert(name.to_string(), own),
            None => self.env.remove(name),
        };
        result
    }

    fn warn(&mut self, field: &str, name: String) {
        if self.reported.insert((field.to_string(), name.clone())) {
            self.diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                job: self.job.to_string(),
                message: format!("variable `{}` referenced in {} is not defined", name, field),
            });
        }
    }
}

struct Materializer<'a> {
    compiler: &'a Compiler,
    ctx: &'a PipelineContext,
    tree: &'a [String],
    context_vars: &'a BTreeMap<String, String>,
    globals: &'a BTreeMap<String, JobVariable>,
    defaults: Defaults<'a>,
}

impl Materializer<'_> {
    /// Build the `JobSpec` of one job, or `None` when the job is left out.
    fn job(&self, name: &str, job: &Value, diagnostics: &mut Vec<Diagnostic>) -> Option<JobSpec> {
        let job_vars = declared_variables(job.get("variables"));
        let job_when = job
            .get("when")
            .and_then(Value::as_str)
            .and_then(|w| w.parse::<When>().ok())
            .unwrap_or_default();

        let decision = match job.get("rules") {
            Some(rules) => {
                let mut env = environment(self.context_vars, self.globals);
                env.extend(job_vars.iter().map(|(k, v)| (k.clone(), v.value.clone())));
                match self.decide(rules, &env, job_when) {
                    Ok(Some(decision)) => decision,
                    Ok(None) => {
                        debug!(job = name, "No rule matched, job left out");
                        return None;
                    }
                    Err(message) => {
                        diagnostics.push(Diagnostic {
                            severity: Severity::Error,
                            job: name.to_string(),
                            message,
                        });
                        return None;
                    }
                }
            }
            None => Decision {
                when: job_when,
                allow_failure: None,
                start_in: None,
                variables: BTreeMap::new(),
            },
        };
        if !decision.includes_job() {
            debug!(job = name, "Job left out by `when: never`");
            return None;
        }

        // Rule variables > job variables > global variables
        let layers = [self.globals, &job_vars, &decision.variables];
        let mut declared = BTreeMap::new();
        for layer in layers {
            declared.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let raw_env = environment(self.context_vars, &declared);
        let mut substitution = Substitution {
            job: name,
            env: raw_env,
            reported: BTreeSet::new(),
            diagnostics: Vec::new(),
        };
        let variables: BTreeMap<String, JobVariable> = declared
            .into_iter()
            .map(|(key, var)| {
                let value = if var.expand {
                    let below = inherited(self.context_vars, &layers, &key);
                    substitution.apply_shadowed(&format!("variable {}", key), &var.value, &key, below)
                } else {
                    var.value
                };
                (
                    key,
                    JobVariable {
                        value,
                        expand: var.expand,
                    },
                )
            })
            .collect();
        // Image and artifacts see the expanded values.
        substitution
            .env
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.value.clone())));

        let defaults = &self.defaults;
        let image = job
            .get("image")
            .or(defaults.image)
            .and_then(|image| image.get("name"))
            .and_then(Value::as_str)
            .map(|image| substitution.apply("image", image));

        let artifacts = job
            .get("artifacts")
            .or(defaults.artifacts)
            .map(|artifacts| Artifacts {
                name: artifacts
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|name| substitution.apply("artifacts:name", name)),
                paths: lines(artifacts.get("paths"))
                    .iter()
                    .map(|path| substitution.apply("artifacts:paths", path))
                    .collect(),
                expire_in: text(artifacts.get("expire_in")),
                when: text(artifacts.get("when")),
            });

        let timeout = job
            .get("timeout")
            .or(defaults.timeout)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.compiler.settings.jobs.default_timeout);

        let (configured_failure, allowed_exit_codes) = allow_failure(job.get("allow_failure").or(defaults.allow_failure));
        let allow_failure = decision
            .allow_failure
            .or(configured_failure)
            .unwrap_or(decision.when == When::Manual);

        let start_in = match decision.when {
            When::Delayed => decision.start_in.or_else(|| {
                job.get("start_in")
                    .and_then(Value::as_u64)
                    .map(Duration::from_secs)
            }),
            _ => None,
        };

        let mut script = lines(job.get("before_script").or(defaults.before_script));
        script.extend(lines(job.get("script")));
        let mut steps = vec![Step {
            name: "script".to_string(),
            script,
            when: When::OnSuccess,
            timeout,
            allow_failure: false,
        }];
        let after_script = lines(job.get("after_script").or(defaults.after_script));
        if !after_script.is_empty() {
            steps.push(Step {
                name: "after_script".to_string(),
                script: after_script,
                when: When::Always,
                timeout,
                allow_failure: true,
            });
        }

        diagnostics.extend(substitution.diagnostics);
        Some(JobSpec {
            name: name.to_string(),
            stage: text(job.get("stage")).unwrap_or_else(|| "test".to_string()),
            image,
            steps,
            artifacts,
            variables,
            when: decision.when,
            allow_failure,
            allowed_exit_codes,
            start_in,
            tags: lines(job.get("tags").or(defaults.tags)),
            timeout,
        })
    }

    fn decide(
        &self,
        rules: &Value,
        env: &BTreeMap<String, String>,
        default_when: When,
    ) -> Result<Option<Decision>, String> {
        let rules = RuleSet::from_value(rules).map_err(|e| e.to_string())?;
        let eval = self.compiler.eval_context(self.ctx, env, self.tree);
        evaluate(rules.rules(), &eval, default_when).map_err(|e| e.to_string())
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Lines of a composed string list.
fn lines(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `allow_failure: bool` or `allow_failure: {exit_codes: [...]}`.
fn allow_failure(value: Option<&Value>) -> (Option<bool>, Vec<i32>) {
    match value {
        Some(Value::Bool(allowed)) => (Some(*allowed), Vec::new()),
        Some(Value::Object(map)) => {
            let codes = map
                .get("exit_codes")
                .and_then(Value::as_array)
                .map(|codes| {
                    codes
                        .iter()
                        .filter_map(Value::as_i64)
                        .filter_map(|code| i32::try_from(code).ok())
                        .collect()
                })
                .unwrap_or_default();
            (Some(false), codes)
        }
        _ => (None, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_of_path() {
        assert_eq!(job_of("jobs:rspec:rules"), "rspec");
        assert_eq!(job_of("jobs:build"), "build");
        assert_eq!(job_of("workflow:rules"), "workflow");
        assert_eq!(job_of("root"), "root");
    }

    #[test]
    fn test_allow_failure_forms() {
        assert_eq!(allow_failure(Some(&json!(true))), (Some(true), vec![]));
        assert_eq!(
            allow_failure(Some(&json!({"exit_codes": [1, 137]}))),
            (Some(false), vec![1, 137])
        );
        assert_eq!(allow_failure(None), (None, vec![]));
    }

    #[test]
    fn test_defaults_prefer_default_section() {
        let root = json!({
            "image": {"name": "legacy"},
            "default": {"image": {"name": "ruby"}, "timeout": 600},
            "before_script": ["setup"]
        });
        let defaults = Defaults::new(&root);
        assert_eq!(defaults.image, Some(&json!({"name": "ruby"})));
        assert_eq!(defaults.before_script, Some(&json!(["setup"])));
        assert_eq!(defaults.timeout, Some(&json!(600)));
        assert!(defaults.tags.is_none());
    }

    #[test]
    fn test_substitution_reports_each_reference_once() {
        let mut substitution = Substitution {
            job: "build",
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            reported: BTreeSet::new(),
            diagnostics: Vec::new(),
        };
        assert_eq!(substitution.apply("image", "img:$A-$MISSING"), "img:1-$MISSING");
        substitution.apply("image", "$MISSING");
        assert_eq!(substitution.diagnostics.len(), 1);
        assert_eq!(
            substitution.diagnostics[0].message,
            "variable `MISSING` referenced in image is not defined"
        );
    }

    #[test]
    fn test_inherited_value_skips_the_defining_layer() {
        let context = BTreeMap::from([("OPTS".to_string(), "ctx".to_string())]);
        let globals = BTreeMap::from([("OPTS".to_string(), JobVariable::new("-v"))]);
        let job = BTreeMap::from([("OPTS".to_string(), JobVariable::new("$OPTS -x"))]);
        let rule = BTreeMap::new();
        let layers = [&globals, &job, &rule];

        assert_eq!(inherited(&context, &layers, "OPTS").as_deref(), Some("-v"));
        assert_eq!(inherited(&context, &layers[..1], "OPTS").as_deref(), Some("ctx"));
        assert_eq!(inherited(&BTreeMap::new(), &layers[..1], "OPTS"), None);
        assert_eq!(inherited(&context, &layers, "UNDECLARED"), None);
    }

    #[test]
    fn test_shadowed_binding_is_restored() {
        let mut substitution = Substitution {
            job: "build",
            env: BTreeMap::from([("OPTS".to_string(), "$OPTS -x".to_string())]),
            reported: BTreeSet::new(),
            diagnostics: Vec::new(),
        };
        let value = substitution.apply_shadowed("variable OPTS", "$OPTS -x", "OPTS", Some("-v".to_string()));
        assert_eq!(value, "-v -x");
        assert_eq!(substitution.env["OPTS"], "$OPTS -x");

        let value = substitution.apply_shadowed("variable OPTS", "$OPTS -x", "OPTS", None);
        assert_eq!(value, "$OPTS -x");
        assert_eq!(substitution.diagnostics.len(), 1);
        assert_eq!(substitution.env["OPTS"], "$OPTS -x");
    }
}
