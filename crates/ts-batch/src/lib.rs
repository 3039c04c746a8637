//! # ts-batch
//!
//! The toy-study batch pipeline: fan a unit of statistical work out into
//! independent jobs, push them through an unreliable scheduler, track them
//! across driver restarts, and fan the per-job results back in.
//!
//! ## Flow
//!
//! 1. [`descriptor::build_batch`] turns a configuration into `n`
//!    [`ts_core::JobDescriptor`]s with deterministic seeds.
//! 2. [`store::JobStore::init`] freezes the configuration and writes one
//!    pending [`record::JobRecord`] per job.
//! 3. [`tracker::Tracker`] submits, polls, retries and cancels through a
//!    [`cluster::ClusterAdapter`].
//! 4. [`merge::merge`] reduces the succeeded jobs' result files into a
//!    [`ts_core::AggregateDataset`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Retry delay.
pub mod backoff;
/// Scheduler abstraction.
pub mod cluster;
/// Batch configuration file.
pub mod config;
/// Job descriptors and seed derivation.
pub mod descriptor;
/// On-disk layout of a batch.
pub mod layout;
/// Local child-process backend.
pub mod local;
/// Result merger.
pub mod merge;
/// Persistent per-job state.
pub mod record;
/// Slurm / Torque backends.
pub mod scheduler;
/// Crash-consistent state store.
pub mod store;
/// Scripted cluster for tests.
pub mod testing;
/// Submission tracker.
pub mod tracker;

pub use cluster::{ClusterAdapter, ClusterHandle, ClusterStatus, Resources, SubmitRequest};
pub use config::{Backend, BatchConfig, ClusterConfig, TrackerConfig, read_batch_config};
pub use descriptor::{build_batch, build_from_config, derive_seed};
pub use layout::BatchLayout;
pub use local::LocalCluster;
pub use merge::{merge, merge_files, merge_records, read_aggregate, write_aggregate};
pub use record::{JobRecord, JobStatus};
pub use scheduler::{SchedulerCli, SchedulerKind};
pub use store::JobStore;
pub use tracker::{BatchReport, JobLauncher, Tracker};
pub use ts_core::job_name;

use std::sync::Arc;

/// Adapter for the configured backend.
pub fn adapter_for(cluster: &ClusterConfig) -> Arc<dyn ClusterAdapter> {
    match cluster.backend {
        Backend::Local => Arc::new(match cluster.max_parallel {
            Some(n) => LocalCluster::new(n),
            None => LocalCluster::default(),
        }),
        Backend::Slurm => Arc::new(SchedulerCli::new(SchedulerKind::Slurm)),
        Backend::Torque => Arc::new(SchedulerCli::new(SchedulerKind::Torque)),
    }
}
