//! Core job types and collaborator traits for the Conduit pipeline compiler.
//!
//! This crate contains:
//! - The job contract handed to schedulers (`JobSpec`, `JobGraph`)
//! - Rule outcome tokens (`When`)
//! - Repository and HTTP capabilities the compiler calls out to
//! - The workload builder for system-generated jobs

pub mod error;
pub mod http;
pub mod job;
pub mod pipeline;
pub mod repository;
pub mod workload;

pub use error::{Error, Result};
pub use job::{Artifacts, JobSpec, JobVariable, Step};
pub use pipeline::{Diagnostic, JobGraph, Severity, When};
pub use workload::{WorkloadBuilder, build_workload};
