//! Cluster adapter: the seam between the tracker and a scheduler.
//!
//! Adapters mirror the external system and nothing more. They do not retry,
//! they do not interpret outputs, and `Unknown` is a legitimate answer.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use ts_core::Result;

/// Opaque scheduler job id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterHandle(pub String);

impl ClusterHandle {
    /// Id as given by the scheduler.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the scheduler says about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Waiting for resources.
    Queued,
    /// Executing.
    Running,
    /// Finished with exit code 0.
    Done,
    /// Finished unsuccessfully (non-zero exit, killed, node failure).
    Failed,
    /// The scheduler does not know the job (purged, or not answering).
    Unknown,
}

/// Resource request, in scheduler syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory (e.g. `2G`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Wall time (e.g. `01:00:00`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    /// Queue or partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Everything needed to put one attempt on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Unique name, `{batch_id}-{index:05}-a{attempt}`.
    pub job_name: String,
    /// Program to execute.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Resources.
    pub resources: Resources,
    /// Combined stdout/stderr of the job.
    pub log_path: PathBuf,
    /// Working directory of the job.
    pub workdir: PathBuf,
}

impl SubmitRequest {
    /// Shell command line of the job, single-quoting arguments that need it.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':' | ','));
    if plain { s.to_string() } else { format!("'{}'", s.replace('\'', r"'\''")) }
}

/// A scheduler.
///
/// `submit` may be called concurrently from several threads.
pub trait ClusterAdapter: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Hand one attempt to the scheduler.
    ///
    /// An `Err` means the scheduler rejected the submission; the message is
    /// the scheduler's own.
    fn submit(&self, request: &SubmitRequest) -> Result<ClusterHandle>;

    /// Current state of a job.
    fn poll(&self, handle: &ClusterHandle) -> Result<ClusterStatus>;

    /// Ask the scheduler to stop a job. `Ok(true)` once the job is gone.
    fn cancel(&self, handle: &ClusterHandle) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quoting() {
        let req = SubmitRequest {
            job_name: "toyA-00001-a1".into(),
            program: "/usr/bin/toystudy".into(),
            args: vec!["run-job".into(), "--descriptor".into(), "/tmp/my dir/00001.json".into()],
            resources: Resources::default(),
            log_path: PathBuf::from("/tmp/log"),
            workdir: PathBuf::from("/tmp"),
        };
        assert_eq!(
            req.command_line(),
            "/usr/bin/toystudy run-job --descriptor '/tmp/my dir/00001.json'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_string(&ClusterStatus::Unknown).unwrap(), "\"unknown\"");
        let h: ClusterHandle = serde_json::from_str("\"12345\"").unwrap();
        assert_eq!(h.as_str(), "12345");
    }
}
