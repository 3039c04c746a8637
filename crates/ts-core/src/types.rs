//! Common data types for ToyStudy

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Schema version written into every aggregate file.
pub const AGGREGATE_SCHEMA_VERSION: &str = "toystudy.aggregate/1";

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Generate one pseudo-dataset and store it.
    Generate,
    /// Fit an existing dataset.
    Fit,
    /// Generate and fit in one go.
    GenerateAndFit,
}

impl JobKind {
    /// Whether the job draws a pseudo-dataset.
    pub fn generates(self) -> bool {
        matches!(self, JobKind::Generate | JobKind::GenerateAndFit)
    }

    /// Whether the job performs a fit.
    pub fn fits(self) -> bool {
        matches!(self, JobKind::Fit | JobKind::GenerateAndFit)
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Generate => "generate",
            JobKind::Fit => "fit",
            JobKind::GenerateAndFit => "generate_and_fit",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one unit of work.
///
/// `(batch_id, index)` is the job identity: resubmitting the same index
/// overwrites `output_path`, it never creates a second record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Batch identifier.
    pub batch_id: String,
    /// Index in `[0, n)`.
    pub index: usize,
    /// What the job does.
    pub kind: JobKind,
    /// Seed derived from `(batch_id, index)`.
    pub seed: u64,
    /// Payload configuration (model, generation, fit). Opaque to the pipeline.
    pub config: serde_json::Value,
    /// Where the job writes its result record.
    pub output_path: PathBuf,
    /// Dataset written by generating jobs or read by fit-only jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<PathBuf>,
}

impl JobDescriptor {
    /// Scheduler-visible name of one attempt: `{batch_id}-{index:05}-a{attempt}`.
    pub fn job_name(&self, attempt: u32) -> String {
        job_name(&self.batch_id, self.index, attempt)
    }
}

/// Unique job name from `(batch_id, index, attempt)`.
pub fn job_name(batch_id: &str, index: usize, attempt: u32) -> String {
    format!("{batch_id}-{index:05}-a{attempt}")
}

/// Outcome of the numerical fit of one toy.
///
/// Non-convergence is data, not an error: a job that fails to converge still
/// completes and produces a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// Minimizer converged.
    Converged,
    /// Minimizer stopped without meeting its convergence criteria.
    NotConverged,
    /// The minimizer itself errored out.
    FailedToRun,
    /// The fit-time budget was exhausted.
    TimedOut,
    /// No fit was requested (generation-only job).
    NotFitted,
}

impl FitStatus {
    /// Whether the fitted values can be used for bias/pull studies.
    pub fn is_usable(self) -> bool {
        matches!(self, FitStatus::Converged)
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            FitStatus::Converged => "converged",
            FitStatus::NotConverged => "not_converged",
            FitStatus::FailedToRun => "failed_to_run",
            FitStatus::TimedOut => "timed_out",
            FitStatus::NotFitted => "not_fitted",
        }
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fitted value and its (symmetric, Hessian-based) uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterEstimate {
    /// Point estimate
    #[serde(deserialize_with = "nan_from_null")]
    pub value: f64,
    /// Uncertainty (sqrt of covariance diagonal)
    #[serde(deserialize_with = "nan_from_null")]
    pub uncertainty: f64,
}

// JSON has no NaN; serde_json writes it as `null`.
fn nan_from_null<'de, D: serde::Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
}

impl ParameterEstimate {
    /// Create a new estimate
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Self { value, uncertainty }
    }
}

/// One row of physics output, produced exactly once per completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Batch the producing job belongs to.
    pub batch_id: String,
    /// Index of the producing job within its batch.
    pub source_job_index: usize,
    /// Seed used for generation.
    pub seed: u64,
    /// Attempt number that produced this record (1-based).
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Scheduler job name of that attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Fitted parameters keyed by name.
    #[serde(default)]
    pub fitted_parameters: BTreeMap<String, ParameterEstimate>,
    /// Fit outcome.
    pub fit_status: FitStatus,
    /// Wall time of the payload in seconds.
    pub wall_time_s: f64,
    /// Parameter values the toy was generated with (pull reference).
    #[serde(default)]
    pub generated_values: BTreeMap<String, f64>,
    /// Number of events in the fitted or generated dataset.
    #[serde(default)]
    pub n_events: usize,
    /// Negative log-likelihood at the minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nll: Option<f64>,
    /// Dataset written or read by the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_path: Option<PathBuf>,
}

fn default_attempt() -> u32 {
    1
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbandonedJob {
    /// Job index within the batch.
    pub index: usize,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error seen for the job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Why a file could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeIssueKind {
    /// A record for this index was already merged.
    DuplicateIndex,
    /// The file declares another schema version.
    SchemaMismatch {
        /// Version found in the file.
        found: String,
    },
    /// The file belongs to another batch.
    BatchMismatch {
        /// Batch id found in the file.
        found: String,
    },
    /// The record's index does not match the job that should have produced it.
    IndexMismatch {
        /// Index the job expected.
        expected: usize,
    },
    /// The index lies outside `[0, total_requested)`.
    IndexOutOfRange,
    /// The file could not be parsed.
    Corrupt {
        /// Parser message.
        message: String,
    },
}

/// One offending file reported by the merger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeIssue {
    /// File that was rejected.
    pub path: PathBuf,
    /// Index of the offending record, when known.
    pub index: Option<usize>,
    /// Reason.
    #[serde(flatten)]
    pub kind: MergeIssueKind,
}

impl fmt::Display for MergeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if let Some(i) = self.index {
            write!(f, " (index {i})")?;
        }
        match &self.kind {
            MergeIssueKind::DuplicateIndex => write!(f, ": duplicate index"),
            MergeIssueKind::SchemaMismatch { found } => {
                write!(f, ": unexpected schema version {found:?}")
            }
            MergeIssueKind::BatchMismatch { found } => write!(f, ": belongs to batch {found:?}"),
            MergeIssueKind::IndexMismatch { expected } => {
                write!(f, ": expected index {expected}")
            }
            MergeIssueKind::IndexOutOfRange => write!(f, ": index out of range"),
            MergeIssueKind::Corrupt { message } => write!(f, ": corrupt ({message})"),
        }
    }
}

/// Merged per-toy results of one batch plus batch-level bookkeeping.
///
/// Records are sorted by `source_job_index` and indices are unique. Toys that
/// never produced a record are counted in `total_abandoned` and listed in
/// `missing_indices` rather than silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDataset {
    /// Schema version of the aggregate file.
    pub schema_version: String,
    /// Batch identifier.
    pub batch_id: String,
    /// Number of toys requested.
    pub total_requested: usize,
    /// Number of records merged.
    pub total_succeeded: usize,
    /// `total_requested - total_succeeded`.
    pub total_abandoned: usize,
    /// Indices without a record, sorted.
    #[serde(default)]
    pub missing_indices: Vec<usize>,
    /// Records sorted by index.
    pub records: Vec<ResultRecord>,
}

impl AggregateDataset {
    /// Aggregate with no records: every requested toy counts as missing.
    pub fn empty(batch_id: &str, total_requested: usize) -> Self {
        Self::from_sorted(batch_id, total_requested, Vec::new())
    }

    /// Build from records already sorted by index and deduplicated.
    pub fn from_sorted(batch_id: &str, total_requested: usize, records: Vec<ResultRecord>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].source_job_index < w[1].source_job_index));
        let mut present = vec![false; total_requested];
        for r in &records {
            if let Some(slot) = present.get_mut(r.source_job_index) {
                *slot = true;
            }
        }
        let missing_indices: Vec<usize> =
            present.iter().enumerate().filter(|(_, p)| !**p).map(|(i, _)| i).collect();
        let total_succeeded = records.len();
        Self {
            schema_version: AGGREGATE_SCHEMA_VERSION.to_string(),
            batch_id: batch_id.to_string(),
            total_requested,
            total_succeeded,
            total_abandoned: total_requested.saturating_sub(total_succeeded),
            missing_indices,
            records,
        }
    }

    /// Fraction of requested toys that produced a record.
    pub fn effective_fraction(&self) -> f64 {
        if self.total_requested == 0 {
            return 0.0;
        }
        self.total_succeeded as f64 / self.total_requested as f64
    }

    /// True when every requested toy produced a record.
    pub fn is_complete(&self) -> bool {
        self.total_abandoned == 0
    }

    /// Record for a given index, if merged.
    pub fn record(&self, index: usize) -> Option<&ResultRecord> {
        self.records
            .binary_search_by_key(&index, |r| r.source_job_index)
            .ok()
            .map(|pos| &self.records[pos])
    }

    /// Names of all fitted parameters across records, sorted.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.records.iter().flat_map(|r| r.fitted_parameters.keys().cloned()).collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize) -> ResultRecord {
        ResultRecord {
            batch_id: "toyA".into(),
            source_job_index: index,
            seed: 1000 + index as u64,
            attempt: 1,
            job_name: None,
            fitted_parameters: BTreeMap::from([("mu".to_string(), ParameterEstimate::new(1.0, 0.1))]),
            fit_status: FitStatus::Converged,
            wall_time_s: 0.5,
            generated_values: BTreeMap::new(),
            n_events: 100,
            nll: Some(12.0),
            dataset_path: None,
        }
    }

    #[test]
    fn test_aggregate_counts_missing() {
        let agg = AggregateDataset::from_sorted("toyA", 5, vec![record(0), record(2), record(4)]);
        assert_eq!(agg.total_succeeded, 3);
        assert_eq!(agg.total_abandoned, 2);
        assert_eq!(agg.missing_indices, vec![1, 3]);
        assert!(!agg.is_complete());
        assert!(agg.record(2).is_some());
        assert!(agg.record(3).is_none());
        approx::assert_relative_eq!(agg.effective_fraction(), 0.6);
    }

    #[test]
    fn test_fit_status_serde_names() {
        let s = serde_json::to_string(&FitStatus::NotConverged).unwrap();
        assert_eq!(s, "\"not_converged\"");
        let back: FitStatus = serde_json::from_str("\"timed_out\"").unwrap();
        assert_eq!(back, FitStatus::TimedOut);
    }

    #[test]
    fn test_record_defaults_on_read() {
        let json = r#"{"batch_id":"b","source_job_index":3,"seed":7,
            "fit_status":"converged","wall_time_s":1.0}"#;
        let r: ResultRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.attempt, 1);
        assert!(r.fitted_parameters.is_empty());
        assert_eq!(r.nll, None);
    }

    #[test]
    fn test_nan_uncertainty_survives_json() {
        let json = serde_json::to_string(&ParameterEstimate::new(1.5, f64::NAN)).unwrap();
        assert_eq!(json, r#"{"value":1.5,"uncertainty":null}"#);
        let back: ParameterEstimate = serde_json::from_str(&json).unwrap();
        assert!(back.uncertainty.is_nan());
    }

    #[test]
    fn test_job_name_format() {
        assert_eq!(job_name("toyA", 7, 2), "toyA-00007-a2");
        assert_eq!(job_name("toyA", 123456, 1), "toyA-123456-a1");
    }
}
