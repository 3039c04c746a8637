//! Submission tracker: the batch state machine.
//!
//! ```text
//! pending ─submit─▶ submitted ─▶ running ─▶ succeeded
//!    ▲                  │            │
//!    │ backoff          └────┬───────┘
//!    │                       ▼
//!    └──────────────── failed | lost ──(attempts exhausted)──▶ abandoned
//!
//! cancel: pending/failed/lost ─▶ abandoned
//!         submitted/running ─▶ cancelling ─▶ abandoned | succeeded
//! ```
//!
//! The tracker is the single writer of job state. Every transition is
//! persisted before the next record is looked at, so a restarted driver
//! continues from the last persisted state. Time is passed in explicitly
//! (`tick_at`) and only [`Tracker::run`] reads the wall clock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use ts_core::io::{ResultFileError, read_result_file};
use ts_core::{AbandonedJob, Error, JobDescriptor, Result};

use crate::backoff::retry_delay;
use crate::cluster::{ClusterAdapter, ClusterStatus, Resources, SubmitRequest};
use crate::config::{ClusterConfig, TrackerConfig};
use crate::layout::BatchLayout;
use crate::record::{Attempt, JobRecord, JobStatus};
use crate::store::JobStore;

/// Builds the scheduler request for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLauncher {
    /// Executable that runs `run-job`.
    pub program: String,
    /// Arguments placed before the per-job ones.
    pub base_args: Vec<String>,
    /// Resources requested for every job.
    pub resources: Resources,
    /// Working directory of the jobs.
    pub workdir: PathBuf,
}

impl JobLauncher {
    /// Launcher from the batch's cluster section; `default_program` is used
    /// when the configuration names none.
    pub fn from_config(cluster: &ClusterConfig, default_program: &str, workdir: PathBuf) -> Self {
        Self {
            program: cluster.program.clone().unwrap_or_else(|| default_program.to_string()),
            base_args: Vec::new(),
            resources: Resources {
                memory: cluster.memory.clone(),
                runtime: cluster.runtime.clone(),
                queue: cluster.queue.clone(),
            },
            workdir,
        }
    }

    /// Request for `attempt` of `descriptor`.
    pub fn request(&self, layout: &BatchLayout, descriptor: &JobDescriptor, attempt: u32) -> SubmitRequest {
        let job_name = descriptor.job_name(attempt);
        let mut args = self.base_args.clone();
        args.extend([
            "run-job".to_string(),
            "--descriptor".to_string(),
            layout.descriptor_path(descriptor.index).display().to_string(),
            "--attempt".to_string(),
            attempt.to_string(),
        ]);
        SubmitRequest {
            log_path: layout.log_path(&job_name),
            job_name,
            program: self.program.clone(),
            args,
            resources: self.resources.clone(),
            workdir: self.workdir.clone(),
        }
    }
}

/// Snapshot summary of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch identifier.
    pub batch_id: String,
    /// Number of jobs.
    pub total: usize,
    /// Jobs per state (states with no jobs omitted).
    pub counts: BTreeMap<JobStatus, usize>,
    /// Jobs given up on, with their attempt counts.
    pub abandoned: Vec<AbandonedJob>,
    /// Cancellation was requested.
    pub cancelled: bool,
}

impl BatchReport {
    /// Summarize `records`.
    pub fn from_records(batch_id: &str, records: &[JobRecord], cancelled: bool) -> Self {
        let mut counts = BTreeMap::new();
        for r in records {
            *counts.entry(r.status).or_insert(0) += 1;
        }
        let abandoned = records
            .iter()
            .filter(|r| r.status == JobStatus::Abandoned)
            .map(|r| AbandonedJob {
                index: r.index(),
                attempts: r.attempt_count,
                last_error: r.error_detail.clone(),
            })
            .collect();
        Self { batch_id: batch_id.to_string(), total: records.len(), counts, abandoned, cancelled }
    }

    /// Jobs in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Every job is terminal.
    pub fn is_finished(&self) -> bool {
        self.count(JobStatus::Succeeded) + self.count(JobStatus::Abandoned) == self.total
    }

    /// Fraction of jobs abandoned.
    pub fn abandoned_fraction(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.abandoned.len() as f64 / self.total as f64 }
    }

    /// [`Error::BatchExhausted`] if more than `max_fraction` of the jobs were
    /// abandoned without the batch being cancelled.
    pub fn check_exhaustion(&self, max_fraction: f64) -> Result<()> {
        if !self.cancelled && self.abandoned_fraction() > max_fraction {
            return Err(Error::BatchExhausted {
                batch_id: self.batch_id.clone(),
                requested: self.total,
                abandoned: self.abandoned.clone(),
            });
        }
        Ok(())
    }
}

/// Drives one batch to completion.
pub struct Tracker {
    store: JobStore,
    config: TrackerConfig,
    adapter: Arc<dyn ClusterAdapter>,
    launcher: JobLauncher,
    records: Vec<JobRecord>,
    cancel: Arc<AtomicBool>,
}

impl Tracker {
    /// Load the batch's records and resume from them.
    ///
    /// Submitted and running jobs keep their handles and are polled, not
    /// resubmitted; the staleness rule decides whether they were lost while
    /// no driver was watching.
    pub fn resume(store: JobStore, adapter: Arc<dyn ClusterAdapter>, launcher: JobLauncher) -> Result<Self> {
        let config = store.load_config()?.tracker;
        let records = store.load_all()?;
        if records.is_empty() {
            return Err(Error::Config(format!("batch {}: no job records", store.layout().batch_id())));
        }
        let in_flight = records.iter().filter(|r| r.status.is_dispatched()).count();
        log::info!(
            "batch {}: resuming {} jobs ({} in flight) on {}",
            store.layout().batch_id(),
            records.len(),
            in_flight,
            adapter.name()
        );
        Ok(Self { store, config, adapter, launcher, records, cancel: Arc::new(AtomicBool::new(false)) })
    }

    /// Token that cancels the batch when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Current records, sorted by index.
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    fn batch_id(&self) -> &str {
        self.store.layout().batch_id()
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || self.store.cancel_requested()
    }

    /// Summary of the current records.
    pub fn report(&self) -> BatchReport {
        let cancelled = self.cancel_requested();
        BatchReport::from_records(self.batch_id(), &self.records, cancelled)
    }

    /// One pass of the driving loop at time `now`.
    pub fn tick_at(&mut self, now: DateTime<Utc>) -> Result<BatchReport> {
        if self.cancel_requested() {
            self.begin_cancel(now)?;
        } else {
            self.release_retries(now)?;
            self.submit_pending(now)?;
        }
        self.poll_dispatched(now)?;
        Ok(self.report())
    }

    /// Drive until every job is terminal, sleeping `poll_interval_secs`
    /// between ticks. Fails with [`Error::BatchExhausted`] when too many jobs
    /// were abandoned.
    pub fn run(&mut self) -> Result<BatchReport> {
        let interval = std::time::Duration::from_secs(self.config.poll_interval_secs);
        loop {
            let report = self.tick_at(Utc::now())?;
            log::info!(
                "batch {}: {} succeeded, {} running, {} pending, {} abandoned of {}",
                report.batch_id,
                report.count(JobStatus::Succeeded),
                report.count(JobStatus::Submitted) + report.count(JobStatus::Running),
                report.count(JobStatus::Pending)
                    + report.count(JobStatus::Failed)
                    + report.count(JobStatus::Lost),
                report.count(JobStatus::Abandoned),
                report.total
            );
            if report.is_finished() {
                report.check_exhaustion(self.config.max_abandoned_fraction)?;
                return Ok(report);
            }
            std::thread::sleep(interval);
        }
    }

    /// Move failed/lost jobs whose backoff has elapsed back to pending, and
    /// abandon those already at the attempt limit.
    fn release_retries(&mut self, now: DateTime<Utc>) -> Result<()> {
        for i in 0..self.records.len() {
            let r = &mut self.records[i];
            if !matches!(r.status, JobStatus::Failed | JobStatus::Lost) {
                continue;
            }
            if r.attempt_count >= self.config.max_attempts {
                // The limit was lowered by a rebuild.
                log::warn!(
                    "index {}: abandoned, {} attempts reach the limit of {}",
                    r.index(),
                    r.attempt_count,
                    self.config.max_attempts
                );
                r.status = JobStatus::Abandoned;
                r.retry_not_before = None;
                self.store.save(&self.records[i])?;
            } else if r.retry_not_before.is_none_or(|t| now >= t) {
                r.status = JobStatus::Pending;
                r.retry_not_before = None;
                r.cluster_handle = None;
                self.store.save(&self.records[i])?;
            }
        }
        Ok(())
    }

    /// Submit every pending job.
    ///
    /// The attempt is persisted as `submitted` (job name, no handle) before the
    /// scheduler sees it, so a driver that dies mid-submission restarts into a
    /// job it waits on instead of one it dispatches again. The scheduler calls
    /// run in parallel and the outcomes are applied in index order.
    fn submit_pending(&mut self, now: DateTime<Utc>) -> Result<()> {
        let pending: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == JobStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut requests: Vec<(usize, SubmitRequest)> = Vec::with_capacity(pending.len());
        for i in pending {
            let r = &mut self.records[i];
            r.attempt_count += 1;
            let req = self.launcher.request(self.store.layout(), &r.descriptor, r.attempt_count);
            r.history.push(Attempt {
                attempt: r.attempt_count,
                job_name: req.job_name.clone(),
                handle: None,
                submitted_at: now,
                finished_at: None,
                outcome: None,
                error: None,
            });
            r.status = JobStatus::Submitted;
            r.cluster_handle = None;
            r.last_update_time = Some(now);
            self.store.save(&self.records[i])?;
            requests.push((i, req));
        }

        let adapter = &self.adapter;
        let outcomes: Vec<(usize, SubmitRequest, Result<_>)> = requests
            .into_par_iter()
            .map(|(i, req)| {
                let res = adapter.submit(&req);
                (i, req, res)
            })
            .collect();

        for (i, req, res) in outcomes {
            let max_attempts = self.config.max_attempts;
            let backoff = self.config.backoff.clone();
            let batch_id = self.batch_id().to_string();
            let r = &mut self.records[i];
            match res {
                Ok(handle) => {
                    log::debug!("{}: submitted as {handle}", req.job_name);
                    if let Some(a) = r.history.last_mut() {
                        a.handle = Some(handle.clone());
                    }
                    r.cluster_handle = Some(handle);
                    r.error_detail = None;
                }
                Err(e) => {
                    let err = Error::Submission {
                        batch_id,
                        index: r.index(),
                        attempt: r.attempt_count,
                        message: e.to_string(),
                    };
                    log::warn!("{err}");
                    fail(r, JobStatus::Failed, err.to_string(), now, max_attempts, &backoff);
                }
            }
            self.store.save(&self.records[i])?;
        }
        Ok(())
    }

    fn poll_dispatched(&mut self, now: DateTime<Utc>) -> Result<()> {
        for i in 0..self.records.len() {
            if !self.records[i].status.is_dispatched() {
                continue;
            }
            let changed = self.poll_one(i, now);
            if changed {
                self.store.save(&self.records[i])?;
            }
        }
        Ok(())
    }

    /// Poll one dispatched job and apply the transition. Returns whether the
    /// record changed.
    fn poll_one(&mut self, i: usize, now: DateTime<Utc>) -> bool {
        let staleness = Duration::seconds(self.config.staleness_timeout_secs as i64);
        let cancel_timeout = Duration::seconds(self.config.cancel_timeout_secs as i64);
        let max_attempts = self.config.max_attempts;
        let backoff = self.config.backoff.clone();
        let batch_id = self.batch_id().to_string();

        let Some(handle) = self.records[i].cluster_handle.clone() else {
            // The driver stopped between persisting the attempt and learning
            // its handle. The job may exist; only its output or the staleness
            // window settles it.
            let r = &mut self.records[i];
            if output_valid(&r.descriptor).is_ok() {
                succeed(r, now);
            } else if r.status == JobStatus::Cancelling {
                abandon(r, "cancelled", now);
            } else {
                let last = r.last_update_time.unwrap_or(now);
                if now - last <= staleness {
                    return false;
                }
                let err = Error::LostJob {
                    batch_id,
                    index: r.index(),
                    attempt: r.attempt_count,
                    stale_secs: (now - last).num_seconds(),
                };
                log::warn!("{err} (submission never confirmed)");
                fail(r, JobStatus::Lost, err.to_string(), now, max_attempts, &backoff);
            }
            return true;
        };
        let polled = self.adapter.poll(&handle);
        let r = &mut self.records[i];
        r.last_poll_time = Some(now);

        let status = match polled {
            Ok(ClusterStatus::Unknown) => None,
            Ok(s) => Some(s),
            Err(e) => {
                log::debug!("{}: poll failed: {e}", r.descriptor.job_name(r.attempt_count));
                None
            }
        };
        if status.is_some() {
            r.last_update_time = Some(now);
        }

        if r.status == JobStatus::Cancelling {
            match status {
                Some(ClusterStatus::Done) if output_valid(&r.descriptor).is_ok() => succeed(r, now),
                Some(ClusterStatus::Done | ClusterStatus::Failed) => abandon(r, "cancelled", now),
                _ if r.cancel_requested_at.is_some_and(|t| now - t > cancel_timeout) => {
                    abandon(r, "cancel not confirmed within timeout", now)
                }
                _ => {}
            }
            return true;
        }

        match status {
            Some(ClusterStatus::Queued) => {}
            Some(ClusterStatus::Running) => r.status = JobStatus::Running,
            Some(ClusterStatus::Done) => match output_valid(&r.descriptor) {
                Ok(()) => succeed(r, now),
                Err(why) => {
                    let msg = format!("scheduler reported done but {why}");
                    log::warn!("{}: {msg}", r.descriptor.job_name(r.attempt_count));
                    fail(r, JobStatus::Failed, msg, now, max_attempts, &backoff);
                }
            },
            Some(ClusterStatus::Failed) => {
                let msg = format!("scheduler reported failure (see {})", handle);
                fail(r, JobStatus::Failed, msg, now, max_attempts, &backoff);
            }
            Some(ClusterStatus::Unknown) | None => {
                let last = r.last_update_time.unwrap_or(now);
                if now - last > staleness {
                    let err = Error::LostJob {
                        batch_id,
                        index: r.index(),
                        attempt: r.attempt_count,
                        stale_secs: (now - last).num_seconds(),
                    };
                    log::warn!("{err}");
                    fail(r, JobStatus::Lost, err.to_string(), now, max_attempts, &backoff);
                }
            }
        }
        true
    }

    /// Enter cancellation: undispatched jobs are abandoned, dispatched ones
    /// get a scheduler cancel.
    fn begin_cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        for i in 0..self.records.len() {
            let status = self.records[i].status;
            match status {
                JobStatus::Pending | JobStatus::Failed | JobStatus::Lost => {
                    abandon(&mut self.records[i], "cancelled", now);
                }
                JobStatus::Submitted | JobStatus::Running => {
                    let handle = self.records[i].cluster_handle.clone();
                    let confirmed = match &handle {
                        Some(h) => self.adapter.cancel(h).unwrap_or_else(|e| {
                            log::warn!("cancel {h}: {e}");
                            false
                        }),
                        None => true,
                    };
                    let r = &mut self.records[i];
                    r.status = JobStatus::Cancelling;
                    r.cancel_requested_at = Some(now);
                    if confirmed {
                        // Anything the job managed to write is still good.
                        if output_valid(&r.descriptor).is_ok() {
                            succeed(r, now);
                        } else {
                            abandon(r, "cancelled", now);
                        }
                    }
                }
                _ => continue,
            }
            self.store.save(&self.records[i])?;
        }
        Ok(())
    }
}

fn output_valid(d: &JobDescriptor) -> std::result::Result<(), String> {
    match read_result_file(&d.output_path) {
        Ok(rec) if rec.batch_id != d.batch_id => Err(format!("output belongs to batch {:?}", rec.batch_id)),
        Ok(rec) if rec.source_job_index != d.index => {
            Err(format!("output carries index {}", rec.source_job_index))
        }
        Ok(_) => Ok(()),
        Err(ResultFileError::Missing) => Err(format!("output {} is missing", d.output_path.display())),
        Err(e) => Err(format!("output {} is invalid: {e}", d.output_path.display())),
    }
}

fn succeed(r: &mut JobRecord, now: DateTime<Utc>) {
    r.status = JobStatus::Succeeded;
    r.error_detail = None;
    r.close_attempt(JobStatus::Succeeded, None, now);
}

fn abandon(r: &mut JobRecord, why: &str, now: DateTime<Utc>) {
    r.status = JobStatus::Abandoned;
    r.retry_not_before = None;
    r.close_attempt(JobStatus::Abandoned, Some(why.to_string()), now);
    if r.error_detail.is_none() {
        r.error_detail = Some(why.to_string());
    }
}

/// Record a failed attempt; abandon once attempts are exhausted, otherwise
/// schedule the retry.
fn fail(
    r: &mut JobRecord,
    status: JobStatus,
    error: String,
    now: DateTime<Utc>,
    max_attempts: u32,
    backoff: &crate::config::BackoffConfig,
) {
    r.close_attempt(status, Some(error.clone()), now);
    r.error_detail = Some(error);
    r.cluster_handle = None;
    if r.attempt_count >= max_attempts {
        r.status = JobStatus::Abandoned;
        r.retry_not_before = None;
        log::warn!(
            "index {}: abandoned after {} attempts: {}",
            r.index(),
            r.attempt_count,
            r.error_detail.as_deref().unwrap_or("")
        );
    } else {
        r.status = status;
        r.retry_not_before = Some(now + retry_delay(backoff, r.attempt_count));
    }
}
