//! Persistent batch state.
//!
//! Every job record is its own file, replaced atomically on each transition,
//! so a crash leaves each job at its previous or its new state. Readers
//! (`status`, `merge`) take snapshots without coordinating with the driver.

use std::fs;
use std::path::Path;

use ts_core::io::{read_json, write_json_atomic};
use ts_core::{Error, JobDescriptor, Result};

use crate::config::BatchConfig;
use crate::layout::BatchLayout;
use crate::record::JobRecord;

/// State directory of one batch.
#[derive(Debug, Clone)]
pub struct JobStore {
    layout: BatchLayout,
}

/// What [`JobStore::init`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSummary {
    /// Records created now.
    pub created: usize,
    /// Records that already existed and were kept.
    pub kept: usize,
}

impl JobStore {
    /// Store at `layout`.
    pub fn new(layout: BatchLayout) -> Self {
        Self { layout }
    }

    /// Open an existing batch, failing if it was never built.
    pub fn open(root: &Path, batch_id: &str) -> Result<Self> {
        let store = Self::new(BatchLayout::new(root, batch_id));
        if !store.layout.batch_config().exists() {
            return Err(Error::Config(format!(
                "batch {batch_id}: not built under {} (no batch.json)",
                root.display()
            )));
        }
        Ok(store)
    }

    /// Paths of the batch.
    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    /// Freeze `config` and create one pending record per descriptor.
    ///
    /// Rebuilding is idempotent: existing records are never reset, and the
    /// new configuration must be compatible with the frozen one. A rebuild
    /// with a larger `n_toys` extends the batch with pending records for the
    /// new indices.
    pub fn init(&self, config: &BatchConfig, descriptors: &[JobDescriptor]) -> Result<InitSummary> {
        let cfg_path = self.layout.batch_config();
        if cfg_path.exists() {
            let frozen: BatchConfig = read_json(&cfg_path)?;
            frozen.check_compatible(config)?;
        }
        fs::create_dir_all(self.layout.jobs_dir())?;
        write_json_atomic(&cfg_path, config)?;

        let mut summary = InitSummary { created: 0, kept: 0 };
        for d in descriptors {
            write_json_atomic(&self.layout.descriptor_path(d.index), d)?;
            if self.layout.job_record(d.index).exists() {
                summary.kept += 1;
            } else {
                self.save(&JobRecord::new(d.clone()))?;
                summary.created += 1;
            }
        }
        log::info!(
            "batch {}: {} job records created, {} kept",
            self.layout.batch_id(),
            summary.created,
            summary.kept
        );
        Ok(summary)
    }

    /// Frozen configuration.
    pub fn load_config(&self) -> Result<BatchConfig> {
        read_json(&self.layout.batch_config())
    }

    /// Persist one record.
    pub fn save(&self, record: &JobRecord) -> Result<()> {
        write_json_atomic(&self.layout.job_record(record.index()), record)
    }

    /// Snapshot of every record, sorted by index.
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let dir = self.layout.jobs_dir();
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if name.starts_with('.') || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let record: JobRecord = read_json(&path)
                .map_err(|e| Error::Validation(format!("{}: {e}", path.display())))?;
            if record.descriptor.batch_id != self.layout.batch_id() {
                return Err(Error::Validation(format!(
                    "{}: record belongs to batch {:?}",
                    path.display(),
                    record.descriptor.batch_id
                )));
            }
            records.push(record);
        }
        records.sort_by_key(JobRecord::index);
        Ok(records)
    }

    /// Ask the driver to cancel the batch.
    pub fn request_cancel(&self) -> Result<()> {
        ts_core::io::write_atomic(&self.layout.cancel_marker(), b"cancel\n")
    }

    /// Whether a cancellation marker is present.
    pub fn cancel_requested(&self) -> bool {
        self.layout.cancel_marker().exists()
    }
}
