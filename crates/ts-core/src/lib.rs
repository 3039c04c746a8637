//! # ts-core
//!
//! Core types and traits for ToyStudy.
//!
//! This crate defines the data model shared by every layer of the toy-study
//! pipeline (per-toy [`ResultRecord`]s, the merged [`AggregateDataset`]) and
//! the error taxonomy used across the workspace. It has no knowledge of
//! clusters, files or concrete models.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy.
pub mod error;
/// Result-file reader/writer and atomic writes.
pub mod io;
/// Model trait consumed by the fitter.
pub mod traits;
/// Data model shared across the pipeline.
pub mod types;

pub use error::{Error, Result};
pub use traits::ToyModel;
pub use types::{
    AbandonedJob, AggregateDataset, FitStatus, JobDescriptor, JobKind, MergeIssue, MergeIssueKind,
    ParameterEstimate, ResultRecord, job_name,
};

/// Crate version, shared by all ToyStudy crates.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
