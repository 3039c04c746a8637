//! Scripted in-memory cluster for tests and dry runs.
//!
//! Each `(index, attempt)` gets a [`Behavior`]; unscripted attempts succeed.
//! A succeeding job writes a converged [`ResultRecord`] to its descriptor's
//! output path the first time it is polled as done.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use ts_core::{Error, FitStatus, JobDescriptor, ParameterEstimate, Result, ResultRecord};

use crate::cluster::{ClusterAdapter, ClusterHandle, ClusterStatus, SubmitRequest};

/// What one attempt does on the simulated cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Runs, then reports done with a valid result file.
    Succeed,
    /// Runs, then reports failed.
    Fail,
    /// Reports done but never writes its output.
    DoneWithoutOutput,
    /// Reports done after writing an unparsable file.
    CorruptOutput,
    /// Disappears: every poll answers `Unknown`.
    Vanish,
    /// The scheduler refuses the submission.
    RejectSubmit,
    /// Keeps running until cancelled.
    RunForever,
}

#[derive(Debug)]
struct SimJob {
    index: usize,
    attempt: u32,
    behavior: Behavior,
    polls: u32,
    cancelled: bool,
    written: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    jobs: HashMap<String, SimJob>,
    submissions: BTreeMap<usize, u32>,
    cancels: usize,
}

/// Deterministic fake scheduler.
#[derive(Debug)]
pub struct SimulatedCluster {
    descriptors: HashMap<usize, JobDescriptor>,
    scripts: HashMap<(usize, u32), Behavior>,
    persistent: HashMap<usize, Behavior>,
    polls_until_done: u32,
    confirm_cancel: bool,
    state: Mutex<SimState>,
}

/// `(index, attempt)` from `{batch_id}-{index:05}-a{attempt}`.
pub fn parse_job_name(name: &str) -> Option<(usize, u32)> {
    let (rest, attempt) = name.rsplit_once("-a")?;
    let (_, index) = rest.rsplit_once('-')?;
    Some((index.parse().ok()?, attempt.parse().ok()?))
}

impl SimulatedCluster {
    /// Cluster that knows the output paths of `descriptors`.
    pub fn new(descriptors: &[JobDescriptor]) -> Self {
        Self {
            descriptors: descriptors.iter().map(|d| (d.index, d.clone())).collect(),
            scripts: HashMap::new(),
            persistent: HashMap::new(),
            polls_until_done: 1,
            confirm_cancel: true,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Script one attempt (1-based).
    pub fn script(mut self, index: usize, attempt: u32, behavior: Behavior) -> Self {
        self.scripts.insert((index, attempt), behavior);
        self
    }

    /// Script every attempt of `index`.
    pub fn script_always(mut self, index: usize, behavior: Behavior) -> Self {
        self.persistent.insert(index, behavior);
        self
    }

    /// Number of `Running` polls before a job finishes.
    pub fn polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// Make `cancel` return `false` and leave jobs running.
    pub fn ignore_cancel(mut self) -> Self {
        self.confirm_cancel = false;
        self
    }

    fn behavior(&self, index: usize, attempt: u32) -> Behavior {
        self.scripts
            .get(&(index, attempt))
            .or_else(|| self.persistent.get(&index))
            .copied()
            .unwrap_or(Behavior::Succeed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|_| Error::Computation("simulated cluster state poisoned".into()))
    }

    /// Submissions seen for `index`.
    pub fn submissions(&self, index: usize) -> u32 {
        self.lock().map(|s| s.submissions.get(&index).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// Submissions seen in total.
    pub fn total_submissions(&self) -> u32 {
        self.lock().map(|s| s.submissions.values().sum()).unwrap_or(0)
    }

    /// `cancel` calls seen.
    pub fn cancel_requests(&self) -> usize {
        self.lock().map(|s| s.cancels).unwrap_or(0)
    }

    fn write_output(&self, job: &SimJob) -> Result<()> {
        let Some(d) = self.descriptors.get(&job.index) else {
            return Ok(());
        };
        match job.behavior {
            Behavior::Succeed => {
                let record = ResultRecord {
                    batch_id: d.batch_id.clone(),
                    source_job_index: d.index,
                    seed: d.seed,
                    attempt: job.attempt,
                    job_name: Some(d.job_name(job.attempt)),
                    fitted_parameters: BTreeMap::from([(
                        "mu".to_string(),
                        ParameterEstimate::new(1.0 + (d.seed % 1000) as f64 * 1e-4, 0.1),
                    )]),
                    fit_status: FitStatus::Converged,
                    wall_time_s: 0.01,
                    generated_values: BTreeMap::from([("mu".to_string(), 1.0)]),
                    n_events: 100,
                    nll: Some(-10.0),
                    dataset_path: None,
                };
                ts_core::io::write_result_file(&d.output_path, &record)
            }
            Behavior::CorruptOutput => ts_core::io::write_atomic(&d.output_path, b"{\"schema_version\": "),
            _ => Ok(()),
        }
    }
}

impl ClusterAdapter for SimulatedCluster {
    fn name(&self) -> &str {
        "simulated"
    }

    fn submit(&self, request: &SubmitRequest) -> Result<ClusterHandle> {
        let (index, attempt) = parse_job_name(&request.job_name)
            .ok_or_else(|| Error::Validation(format!("unparsable job name {:?}", request.job_name)))?;
        let behavior = self.behavior(index, attempt);
        let mut state = self.lock()?;
        *state.submissions.entry(index).or_insert(0) += 1;
        if behavior == Behavior::RejectSubmit {
            return Err(Error::Computation(format!("sim: submission of {} rejected", request.job_name)));
        }
        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        state.jobs.insert(
            id.clone(),
            SimJob { index, attempt, behavior, polls: 0, cancelled: false, written: false },
        );
        Ok(ClusterHandle(id))
    }

    fn poll(&self, handle: &ClusterHandle) -> Result<ClusterStatus> {
        let mut state = self.lock()?;
        let Some(job) = state.jobs.get_mut(handle.as_str()) else {
            return Ok(ClusterStatus::Unknown);
        };
        if job.cancelled {
            return Ok(ClusterStatus::Failed);
        }
        job.polls += 1;
        if job.behavior == Behavior::Vanish {
            return Ok(ClusterStatus::Unknown);
        }
        if job.behavior == Behavior::RunForever || job.polls <= self.polls_until_done {
            return Ok(ClusterStatus::Running);
        }
        if !job.written {
            job.written = true;
            self.write_output(job)?;
        }
        Ok(match job.behavior {
            Behavior::Fail => ClusterStatus::Failed,
            _ => ClusterStatus::Done,
        })
    }

    fn cancel(&self, handle: &ClusterHandle) -> Result<bool> {
        let mut state = self.lock()?;
        state.cancels += 1;
        if !self.confirm_cancel {
            return Ok(false);
        }
        Ok(match state.jobs.get_mut(handle.as_str()) {
            Some(job) => {
                job.cancelled = true;
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job_name() {
        assert_eq!(parse_job_name("toyA-00017-a3"), Some((17, 3)));
        assert_eq!(parse_job_name("my-batch-00002-a1"), Some((2, 1)));
        assert_eq!(parse_job_name("nonsense"), None);
    }
}
