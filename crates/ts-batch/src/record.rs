//! Tracker-owned job state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_core::JobDescriptor;

use crate::cluster::ClusterHandle;

/// Where a job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be (re)submitted.
    Pending,
    /// Accepted by the scheduler, not yet seen running.
    Submitted,
    /// Seen running.
    Running,
    /// Done with a valid result file. Terminal.
    Succeeded,
    /// Last attempt failed; waiting for backoff.
    Failed,
    /// Last attempt went silent; waiting for backoff.
    Lost,
    /// Cancel issued, waiting for confirmation.
    Cancelling,
    /// Gave up (attempts exhausted or batch cancelled). Terminal.
    Abandoned,
}

impl JobStatus {
    /// All states, in lifecycle order.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Lost,
        JobStatus::Cancelling,
        JobStatus::Abandoned,
    ];

    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Abandoned)
    }

    /// Has a live scheduler job.
    pub fn is_dispatched(self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running | JobStatus::Cancelling)
    }

    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Lost => "lost",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submission of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Scheduler job name.
    pub job_name: String,
    /// Scheduler id, if the submission was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ClusterHandle>,
    /// When it was submitted.
    pub submitted_at: DateTime<Utc>,
    /// When the attempt ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// How it ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobStatus>,
    /// Error text, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persistent state of one job, keyed by `(batch_id, index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// What to run.
    pub descriptor: JobDescriptor,
    /// Current state.
    pub status: JobStatus,
    /// Scheduler id of the current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_handle: Option<ClusterHandle>,
    /// Submissions so far (accepted or rejected).
    #[serde(default)]
    pub attempt_count: u32,
    /// Last time the scheduler was asked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_time: Option<DateTime<Utc>>,
    /// Last time the scheduler gave a definite answer (or the job was submitted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Earliest resubmission time after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
    /// When cancellation was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Last error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Every submission, oldest first.
    #[serde(default)]
    pub history: Vec<Attempt>,
}

impl JobRecord {
    /// Fresh record for a descriptor.
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            status: JobStatus::Pending,
            cluster_handle: None,
            attempt_count: 0,
            last_poll_time: None,
            last_update_time: None,
            retry_not_before: None,
            cancel_requested_at: None,
            error_detail: None,
            history: Vec::new(),
        }
    }

    /// Job index.
    pub fn index(&self) -> usize {
        self.descriptor.index
    }

    /// Close the current attempt in the history.
    pub(crate) fn close_attempt(&mut self, outcome: JobStatus, error: Option<String>, now: DateTime<Utc>) {
        if let Some(a) = self.history.last_mut()
            && a.outcome.is_none()
        {
            a.outcome = Some(outcome);
            a.finished_at = Some(now);
            a.error = error;
        }
    }
}
