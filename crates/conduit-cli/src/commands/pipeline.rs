//! Pipeline commands: validate and compile a document from a checkout.

use anyhow::{Context, Result};
use conduit_config::settings::SETTINGS_FILE;
use conduit_config::{CompileError, Compiler, MemoryCache, PipelineContext, Settings};
use conduit_core::JobGraph;
use conduit_core::http::ReqwestClient;
use conduit_core::repository::FsRepository;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::PipelineArgs;

pub async fn validate(args: &PipelineArgs) -> Result<()> {
    match run(args).await? {
        Ok(graph) => {
            for diagnostic in &graph.diagnostics {
                println!("{:?} in {}: {}", diagnostic.severity, diagnostic.job, diagnostic.message);
            }
            if graph.has_errors() {
                std::process::exit(1);
            }
            if graph.workflow_excluded {
                println!("Configuration is valid; workflow rules exclude this pipeline");
            } else {
                println!("Configuration is valid ({} jobs)", graph.jobs.len());
            }
            Ok(())
        }
        Err(e) => {
            for problem in &e.errors {
                println!("Configuration error: {}", problem);
            }
            std::process::exit(1);
        }
    }
}

pub async fn compile(args: &PipelineArgs, pretty: bool) -> Result<()> {
    match run(args).await? {
        Ok(graph) => {
            println!("{}", render(&graph, pretty)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", render(&e, pretty)?);
            std::process::exit(1);
        }
    }
}

fn render<T: Serialize>(value: &T, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

async fn run(args: &PipelineArgs) -> Result<std::result::Result<JobGraph, CompileError>> {
    let source = std::fs::read_to_string(&args.path)
        .with_context(|| format!("Failed to read pipeline document: {}", args.path.display()))?;
    let root = checkout_root(&args.path)?;

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(|| root.join(SETTINGS_FILE));
    let settings = Settings::load(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;

    let project = args
        .project
        .clone()
        .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "local".to_string());
    let ctx = context(args, &project, &root);
    debug!(project = %project, git_ref = %ctx.git_ref, root = %root.display(), "Compiling from checkout");

    let mut repository = FsRepository::new(&project, &root);
    if let Some(dir) = &args.templates {
        repository = repository.with_template_dir(dir);
    }
    let cache = MemoryCache::new(settings.cache.capacity);
    let compiler = Compiler::new(
        Arc::new(repository),
        Arc::new(ReqwestClient::new()),
        Arc::new(cache),
    )
    .with_settings(settings);

    Ok(compiler.compile(&source, &ctx).await)
}

/// Directory holding the document, which is read as the project tree.
fn checkout_root(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    parent
        .canonicalize()
        .context("Failed to resolve checkout directory")
}

fn context(args: &PipelineArgs, project: &str, root: &Path) -> PipelineContext {
    let mut ctx = PipelineContext::new(project);
    ctx.populate_from_checkout(root);

    if let Some(branch) = &args.branch {
        ctx.git_ref = branch.clone();
        ctx.branch = Some(branch.clone());
        ctx.tag = None;
    }
    if let Some(tag) = &args.tag {
        ctx.git_ref = tag.clone();
        ctx.tag = Some(tag.clone());
        ctx.branch = None;
    }
    ctx.source = args.source.clone();
    ctx.variables.extend(args.variables.iter().cloned());
    if !args.changed.is_empty() {
        ctx.changed_paths = Some(args.changed.clone());
    }
    ctx
}
