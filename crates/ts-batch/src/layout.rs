//! On-disk layout of one batch under the study root.
//!
//! ```text
//! <root>/<batch_id>/
//!   batch.json                 frozen configuration
//!   aggregate.json             merged results
//!   aggregate.partial.json     records retained by a failed merge
//!   results/<batch_id>_<index:05>.json
//!   datasets/<batch_id>_<index:05>.json
//!   logs/<job_name>.log
//!   state/jobs/<index:05>.json one JobRecord per job
//!   state/descriptors/<index:05>.json
//!   state/CANCEL               cancellation request marker
//! ```

use std::path::{Path, PathBuf};

/// Paths of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    root: PathBuf,
    batch_id: String,
}

impl BatchLayout {
    /// Layout of `batch_id` under `root`.
    pub fn new(root: impl Into<PathBuf>, batch_id: &str) -> Self {
        Self { root: root.into(), batch_id: batch_id.to_string() }
    }

    /// Study root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Batch identifier.
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// `<root>/<batch_id>`.
    pub fn batch_dir(&self) -> PathBuf {
        self.root.join(&self.batch_id)
    }

    /// Frozen configuration.
    pub fn batch_config(&self) -> PathBuf {
        self.batch_dir().join("batch.json")
    }

    /// Merged output.
    pub fn aggregate(&self) -> PathBuf {
        self.batch_dir().join("aggregate.json")
    }

    /// What a failed merge managed to retain.
    pub fn partial_aggregate(&self) -> PathBuf {
        self.batch_dir().join("aggregate.partial.json")
    }

    /// Result record of job `index`.
    pub fn result_path(&self, index: usize) -> PathBuf {
        self.batch_dir().join("results").join(format!("{}_{index:05}.json", self.batch_id))
    }

    /// Default dataset location of job `index`.
    pub fn dataset_path(&self, index: usize) -> PathBuf {
        self.batch_dir().join("datasets").join(format!("{}_{index:05}.json", self.batch_id))
    }

    /// Scheduler log of one attempt.
    pub fn log_path(&self, job_name: &str) -> PathBuf {
        self.batch_dir().join("logs").join(format!("{job_name}.log"))
    }

    /// Tracker state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.batch_dir().join("state")
    }

    /// Directory of per-job records.
    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir().join("jobs")
    }

    /// Record of job `index`.
    pub fn job_record(&self, index: usize) -> PathBuf {
        self.jobs_dir().join(format!("{index:05}.json"))
    }

    /// Descriptor of job `index`, handed to the job on the command line.
    pub fn descriptor_path(&self, index: usize) -> PathBuf {
        self.state_dir().join("descriptors").join(format!("{index:05}.json"))
    }

    /// Cancellation marker.
    pub fn cancel_marker(&self) -> PathBuf {
        self.state_dir().join("CANCEL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_derive_from_batch_and_index() {
        let l = BatchLayout::new("/study", "toyA");
        assert_eq!(l.result_path(7), PathBuf::from("/study/toyA/results/toyA_00007.json"));
        assert_eq!(l.job_record(7), PathBuf::from("/study/toyA/state/jobs/00007.json"));
        assert_eq!(l.cancel_marker(), PathBuf::from("/study/toyA/state/CANCEL"));
        assert_eq!(l.log_path("toyA-00007-a1"), PathBuf::from("/study/toyA/logs/toyA-00007-a1.log"));
    }
}
