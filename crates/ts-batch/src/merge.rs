//! Result merger: per-job result files into one aggregate.
//!
//! Policy on conflicts: the first record seen for an index is kept, every
//! later one is reported. Any reported file makes the merge fail with
//! [`Error::Merge`], which still carries everything that merged cleanly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use ts_core::io::{ResultFileError, read_result_file, write_json_atomic};
use ts_core::types::AGGREGATE_SCHEMA_VERSION;
use ts_core::{AggregateDataset, Error, MergeIssue, MergeIssueKind, Result, ResultRecord};

use crate::record::{JobRecord, JobStatus};

/// Where a record came from.
struct Sourced {
    path: PathBuf,
    expected_index: Option<usize>,
    record: ResultRecord,
}

fn reduce(
    batch_id: &str,
    total_requested: usize,
    inputs: Vec<Sourced>,
    mut issues: Vec<MergeIssue>,
) -> Result<AggregateDataset> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(inputs.len());
    for s in inputs {
        let index = s.record.source_job_index;
        let kind = if s.record.batch_id != batch_id {
            Some(MergeIssueKind::BatchMismatch { found: s.record.batch_id.clone() })
        } else if let Some(expected) = s.expected_index.filter(|&e| e != index) {
            Some(MergeIssueKind::IndexMismatch { expected })
        } else if index >= total_requested {
            Some(MergeIssueKind::IndexOutOfRange)
        } else if !seen.insert(index) {
            log::warn!("batch {batch_id}: duplicate index {index} in {}; keeping the first", s.path.display());
            Some(MergeIssueKind::DuplicateIndex)
        } else {
            None
        };
        match kind {
            Some(kind) => issues.push(MergeIssue { path: s.path, index: Some(index), kind }),
            None => kept.push(s.record),
        }
    }
    kept.sort_by_key(|r| r.source_job_index);
    let aggregate = AggregateDataset::from_sorted(batch_id, total_requested, kept);

    if aggregate.total_abandoned > 0 {
        log::info!(
            "batch {batch_id}: merged {} of {} toys, {} missing",
            aggregate.total_succeeded,
            total_requested,
            aggregate.total_abandoned
        );
    }
    if issues.is_empty() {
        Ok(aggregate)
    } else {
        Err(Error::Merge { batch_id: batch_id.to_string(), issues, retained: Box::new(aggregate) })
    }
}

/// Merge records already in memory. Positions in `records` stand in for file
/// names in reported issues.
pub fn merge_records(
    batch_id: &str,
    total_requested: usize,
    records: Vec<ResultRecord>,
) -> Result<AggregateDataset> {
    let inputs = records
        .into_iter()
        .enumerate()
        .map(|(pos, record)| Sourced { path: PathBuf::from(format!("<record {pos}>")), expected_index: None, record })
        .collect();
    reduce(batch_id, total_requested, inputs, Vec::new())
}

fn read_sources(files: impl IntoIterator<Item = (PathBuf, Option<usize>)>) -> (Vec<Sourced>, Vec<MergeIssue>) {
    let mut inputs = Vec::new();
    let mut issues = Vec::new();
    for (path, expected_index) in files {
        match read_result_file(&path) {
            Ok(record) => inputs.push(Sourced { path, expected_index, record }),
            Err(ResultFileError::Missing) => {
                log::warn!("{}: result file absent; counted as missing", path.display());
            }
            Err(ResultFileError::SchemaMismatch(found)) => {
                issues.push(MergeIssue { path, index: expected_index, kind: MergeIssueKind::SchemaMismatch { found } })
            }
            Err(ResultFileError::Corrupt(message)) => {
                issues.push(MergeIssue { path, index: expected_index, kind: MergeIssueKind::Corrupt { message } })
            }
        }
    }
    (inputs, issues)
}

/// Merge the outputs of the succeeded jobs among `job_records`.
///
/// Absent files are tolerated and show up as missing indices.
pub fn merge(batch_id: &str, total_requested: usize, job_records: &[JobRecord]) -> Result<AggregateDataset> {
    let files = job_records
        .iter()
        .filter(|r| r.status == JobStatus::Succeeded)
        .map(|r| (r.descriptor.output_path.clone(), Some(r.index())));
    let (inputs, issues) = read_sources(files);
    reduce(batch_id, total_requested, inputs, issues)
}

/// Merge arbitrary result files, in the given order.
pub fn merge_files(batch_id: &str, total_requested: usize, paths: &[PathBuf]) -> Result<AggregateDataset> {
    let (inputs, issues) = read_sources(paths.iter().map(|p| (p.clone(), None)));
    reduce(batch_id, total_requested, inputs, issues)
}

/// Write the aggregate atomically.
pub fn write_aggregate(path: &Path, aggregate: &AggregateDataset) -> Result<()> {
    write_json_atomic(path, aggregate)
}

/// Read an aggregate, rejecting other schema versions.
pub fn read_aggregate(path: &Path) -> Result<AggregateDataset> {
    let agg: AggregateDataset = ts_core::io::read_json(path)?;
    if agg.schema_version != AGGREGATE_SCHEMA_VERSION {
        return Err(Error::Validation(format!(
            "{}: unexpected aggregate schema version {:?}",
            path.display(),
            agg.schema_version
        )));
    }
    Ok(agg)
}
