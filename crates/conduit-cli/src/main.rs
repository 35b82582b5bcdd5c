//! Conduit CLI tool.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit pipeline configuration compiler", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CONDUIT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline configuration
    Validate {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Compile a pipeline configuration into a job graph (JSON)
    Compile {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },
    /// Build a single-job workload
    Workload {
        /// Container image
        #[arg(long)]
        image: String,
        /// Command to run; repeat for several
        #[arg(long = "command", short = 'c', required = true)]
        commands: Vec<String>,
        /// Variable as KEY=VALUE; repeat for several
        #[arg(long = "var", value_parser = commands::parse_key_value)]
        variables: Vec<(String, String)>,
        /// Artifact path; repeat for several
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
        /// Job timeout (e.g. `30m`)
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<std::time::Duration>,
    },
    /// Validate a security report against its versioned schema
    CheckReport {
        /// Report type (`sast`, `dependency-scanning`, ...)
        #[arg(long = "type", short = 't')]
        document_type: String,
        /// Path to the JSON report
        path: PathBuf,
    },
}

#[derive(Args)]
struct PipelineArgs {
    /// Path to the pipeline document
    #[arg(default_value = ".conduit-ci.yml")]
    path: PathBuf,
    /// Project path; defaults to the checkout directory name
    #[arg(long, env = "CONDUIT_PROJECT")]
    project: Option<String>,
    /// Branch the pipeline runs for; read from git when omitted
    #[arg(long, conflicts_with = "tag")]
    branch: Option<String>,
    /// Tag the pipeline runs for
    #[arg(long)]
    tag: Option<String>,
    /// Pipeline source (`push`, `schedule`, `web`, ...)
    #[arg(long, default_value = "push")]
    source: String,
    /// Variable as KEY=VALUE; repeat for several
    #[arg(long = "var", value_parser = commands::parse_key_value)]
    variables: Vec<(String, String)>,
    /// Changed path for `changes` rules; repeat for several
    #[arg(long = "changed")]
    changed: Vec<String>,
    /// Directory of named templates
    #[arg(long, env = "CONDUIT_TEMPLATE_DIR")]
    templates: Option<PathBuf>,
    /// Compiler settings file; defaults to conduit.kdl next to the document
    #[arg(long, env = "CONDUIT_SETTINGS")]
    settings: Option<PathBuf>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { pipeline } => {
            commands::pipeline::validate(&pipeline).await?;
        }
        Commands::Compile { pipeline, pretty } => {
            commands::pipeline::compile(&pipeline, pretty).await?;
        }
        Commands::Workload {
            image,
            commands: lines,
            variables,
            artifacts,
            timeout,
        } => {
            commands::workload(&image, lines, variables, artifacts, timeout)?;
        }
        Commands::CheckReport {
            document_type,
            path,
        } => {
            commands::check_report(&document_type, &path)?;
        }
    }

    Ok(())
}
