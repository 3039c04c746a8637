//! Error types for ToyStudy
//!
//! Every operator-visible variant names the batch and, where it applies, the
//! affected job indices and attempt counts.

use thiserror::Error;

use crate::types::{AbandonedJob, AggregateDataset, MergeIssue};

/// ToyStudy error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Bad batch parameters. Fatal, reported before any submission.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster adapter rejected a submission.
    #[error("Submission error: batch {batch_id}, index {index}, attempt {attempt}: {message}")]
    Submission {
        /// Batch identifier.
        batch_id: String,
        /// Job index within the batch.
        index: usize,
        /// Attempt that was being submitted.
        attempt: u32,
        /// Scheduler message.
        message: String,
    },

    /// The job payload could not execute.
    #[error("Run error: batch {batch_id}, index {index}: {message}")]
    Run {
        /// Batch identifier.
        batch_id: String,
        /// Job index within the batch.
        index: usize,
        /// What went wrong.
        message: String,
    },

    /// No status update was observed within the staleness timeout.
    #[error(
        "Lost job: batch {batch_id}, index {index}, attempt {attempt}: no status update for {stale_secs}s"
    )]
    LostJob {
        /// Batch identifier.
        batch_id: String,
        /// Job index within the batch.
        index: usize,
        /// Attempt that went silent.
        attempt: u32,
        /// Seconds since the last observed update.
        stale_secs: i64,
    },

    /// Schema mismatch or duplicate index while merging.
    ///
    /// `retained` holds everything that merged cleanly, so nothing already
    /// merged is lost.
    #[error("Merge error: batch {batch_id}: {} offending file(s): {}", .issues.len(), join_issues(.issues))]
    Merge {
        /// Batch identifier.
        batch_id: String,
        /// One entry per offending file.
        issues: Vec<MergeIssue>,
        /// Records that merged cleanly (first occurrence wins).
        retained: Box<AggregateDataset>,
    },

    /// Too few successful toys for a stable estimate.
    #[error(
        "Insufficient data: batch {batch_id}: {succeeded} usable toys of {requested} requested, at least {required} required"
    )]
    InsufficientData {
        /// Batch identifier.
        batch_id: String,
        /// Toys usable for the estimate.
        succeeded: usize,
        /// Toys requested for the batch.
        requested: usize,
        /// Configured minimum.
        required: usize,
    },

    /// Too many jobs were abandoned for the batch to be trusted.
    #[error("Batch exhausted: batch {batch_id}: {} of {requested} jobs abandoned: {}", .abandoned.len(), join_abandoned(.abandoned))]
    BatchExhausted {
        /// Batch identifier.
        batch_id: String,
        /// Jobs requested for the batch.
        requested: usize,
        /// Abandoned jobs with their attempt counts.
        abandoned: Vec<AbandonedJob>,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

const MAX_LISTED: usize = 20;

fn join_issues(issues: &[MergeIssue]) -> String {
    let mut parts: Vec<String> = issues.iter().take(MAX_LISTED).map(|i| i.to_string()).collect();
    if issues.len() > MAX_LISTED {
        parts.push(format!("... and {} more", issues.len() - MAX_LISTED));
    }
    parts.join("; ")
}

fn join_abandoned(jobs: &[AbandonedJob]) -> String {
    let mut parts: Vec<String> = jobs
        .iter()
        .take(MAX_LISTED)
        .map(|j| format!("index {} ({} attempts)", j.index, j.attempts))
        .collect();
    if jobs.len() > MAX_LISTED {
        parts.push(format!("... and {} more", jobs.len() - MAX_LISTED));
    }
    parts.join(", ")
}
