//! Pipeline configuration compiler for Conduit CI/CD.
//!
//! This crate handles:
//! - The document model and its validation (`document`)
//! - Include resolution, caching and merging (`include`, `merge`)
//! - Job inheritance through `extends`
//! - Rule evaluation (`rules`)
//! - Variable interpolation and the run-time context
//! - Versioned JSON-schema validation of reports (`schema`)
//! - Compiler settings (`conduit.kdl`)

pub mod compiler;
pub mod document;
pub mod duration;
pub mod error;
pub mod extends;
pub mod include;
pub mod merge;
pub mod rules;
pub mod schema;
pub mod settings;
pub mod variables;

pub use compiler::Compiler;
pub use error::{CompileError, ConfigError, ConfigResult, IncludeError, Problem, RuleError};
pub use include::{CancellationFlag, MemoryCache, NoCache};
pub use schema::{SchemaCatalogue, SchemaError, SchemaReport};
pub use settings::{Settings, parse_settings};
pub use variables::{PipelineContext, PipelineContextBuilder};
