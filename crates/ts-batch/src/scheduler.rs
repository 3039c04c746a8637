//! Slurm and Torque through their command-line tools.
//!
//! Submission renders a batch script with the scheduler's directives and
//! pipes it to `sbatch` / `qsub` on stdin. Status comes from `sacct` /
//! `qstat -f`, cancellation from `scancel` / `qdel`.

use std::io::Write;
use std::process::{Command, Output, Stdio};

use ts_core::{Error, Result};

use crate::cluster::{ClusterAdapter, ClusterHandle, ClusterStatus, SubmitRequest};

const DEFAULT_RUNTIME: &str = "01:00:00";

/// Supported schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Slurm.
    Slurm,
    /// Torque / PBS.
    Torque,
}

impl SchedulerKind {
    fn submit_command(self) -> &'static str {
        match self {
            SchedulerKind::Slurm => "sbatch",
            SchedulerKind::Torque => "qsub",
        }
    }

    fn directives(self, req: &SubmitRequest) -> Result<Vec<String>> {
        let log = req.log_path.display().to_string();
        let runtime = req.resources.runtime.as_deref().unwrap_or(DEFAULT_RUNTIME);
        let values = [
            ("job name", Some(req.job_name.as_str())),
            ("log path", Some(log.as_str())),
            ("runtime", Some(runtime)),
            ("memory", req.resources.memory.as_deref()),
            ("queue", req.resources.queue.as_deref()),
        ];
        for (what, value) in values {
            if let Some(v) = value {
                directive_safe(what, v)?;
            }
        }
        let mut lines = Vec::new();
        match self {
            SchedulerKind::Slurm => {
                lines.push(format!("#SBATCH -J {}", req.job_name));
                lines.push(format!("#SBATCH -o {log}"));
                lines.push(format!("#SBATCH -e {log}"));
                lines.push(format!("#SBATCH -t {runtime}"));
                if let Some(mem) = &req.resources.memory {
                    lines.push(format!("#SBATCH --mem={mem}"));
                }
                if let Some(q) = &req.resources.queue {
                    lines.push(format!("#SBATCH --partition={q}"));
                }
            }
            SchedulerKind::Torque => {
                lines.push(format!("#PBS -N {}", req.job_name));
                lines.push(format!("#PBS -o {log}"));
                lines.push(format!("#PBS -e {log}"));
                lines.push("#PBS -j oe".to_string());
                lines.push(format!("#PBS -l cput={runtime}"));
                lines.push(format!("#PBS -l walltime={runtime}"));
                if let Some(mem) = &req.resources.memory {
                    lines.push(format!("#PBS -l mem={mem}"));
                }
                if let Some(q) = &req.resources.queue {
                    lines.push(format!("#PBS -q {q}"));
                }
            }
        }
        Ok(lines)
    }
}

/// Directive values must be single plain words.
fn directive_safe(what: &str, value: &str) -> Result<()> {
    let plain = !value.is_empty()
        && !value.chars().any(|c| c.is_whitespace() || c.is_control() || matches!(c, '\'' | '"' | '\\'));
    if !plain {
        return Err(Error::Validation(format!(
            "{what} {value:?} cannot appear in a scheduler directive (no spaces or quotes)"
        )));
    }
    Ok(())
}

/// Batch script for one attempt.
///
/// Fails with [`Error::Validation`] if a directive value (job name, log path,
/// resources) contains whitespace or quotes.
pub fn render_script(kind: SchedulerKind, req: &SubmitRequest) -> Result<String> {
    let mut s = String::from("#!/bin/bash\n");
    for line in kind.directives(req)? {
        s.push_str(&line);
        s.push('\n');
    }
    s.push_str("set -e\n");
    s.push_str(&format!("echo \"job {} started on $(date)\"\n", req.job_name));
    s.push_str(&format!("cd '{}'\n", req.workdir.display().to_string().replace('\'', r"'\''")));
    s.push_str(&req.command_line());
    s.push('\n');
    s.push_str(&format!("echo \"job {} ended on $(date)\"\n", req.job_name));
    Ok(s)
}

/// Job id from `sbatch --parsable` (`123` or `123;cluster`).
pub fn parse_sbatch_output(stdout: &str) -> Option<ClusterHandle> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty()).then(|| ClusterHandle(id.to_string()))
}

/// Job id printed by `qsub` (`123.server`).
pub fn parse_qsub_output(stdout: &str) -> Option<ClusterHandle> {
    let id = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(ClusterHandle(id.to_string()))
}

/// Map the first `sacct -P -o State` line to a status.
pub fn parse_sacct_state(stdout: &str) -> ClusterStatus {
    let Some(line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return ClusterStatus::Unknown;
    };
    // "CANCELLED by 1234" and friends.
    let state = line.split_whitespace().next().unwrap_or("").trim_end_matches('+');
    match state {
        "PENDING" | "REQUEUED" | "SUSPENDED" | "RESIZING" => ClusterStatus::Queued,
        "RUNNING" | "CONFIGURING" | "COMPLETING" | "STAGE_OUT" => ClusterStatus::Running,
        "COMPLETED" => ClusterStatus::Done,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" => ClusterStatus::Failed,
        _ => ClusterStatus::Unknown,
    }
}

/// Map `qstat -f` output to a status.
pub fn parse_qstat_full(stdout: &str) -> ClusterStatus {
    let field = |name: &str| {
        stdout.lines().find_map(|l| {
            let (k, v) = l.split_once('=')?;
            (k.trim() == name).then(|| v.trim().to_string())
        })
    };
    match field("job_state").as_deref() {
        Some("Q") | Some("H") | Some("W") | Some("S") => ClusterStatus::Queued,
        Some("R") | Some("E") | Some("T") => ClusterStatus::Running,
        Some("C") | Some("F") => match field("exit_status").as_deref().map(str::parse::<i64>) {
            Some(Ok(0)) => ClusterStatus::Done,
            Some(Ok(_)) => ClusterStatus::Failed,
            _ => ClusterStatus::Unknown,
        },
        _ => ClusterStatus::Unknown,
    }
}

fn run_command(program: &str, args: &[&str], stdin: Option<&str>) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Computation(format!("cannot execute '{program}': {e}")))?;
    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes())?;
    }
    Ok(child.wait_with_output()?)
}

fn stderr_message(out: &Output) -> String {
    let err = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if err.is_empty() { format!("exit status {}", out.status) } else { err }
}

/// Slurm or Torque adapter.
#[derive(Debug, Clone)]
pub struct SchedulerCli {
    kind: SchedulerKind,
}

impl SchedulerCli {
    /// Adapter for `kind`.
    pub fn new(kind: SchedulerKind) -> Self {
        Self { kind }
    }
}

impl ClusterAdapter for SchedulerCli {
    fn name(&self) -> &str {
        match self.kind {
            SchedulerKind::Slurm => "slurm",
            SchedulerKind::Torque => "torque",
        }
    }

    fn submit(&self, request: &SubmitRequest) -> Result<ClusterHandle> {
        if let Some(dir) = request.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let script = render_script(self.kind, request)?;
        let (out, parsed) = match self.kind {
            SchedulerKind::Slurm => {
                let out = run_command("sbatch", &["--parsable"], Some(&script))?;
                let h = parse_sbatch_output(&String::from_utf8_lossy(&out.stdout));
                (out, h)
            }
            SchedulerKind::Torque => {
                let out = run_command("qsub", &[], Some(&script))?;
                let h = parse_qsub_output(&String::from_utf8_lossy(&out.stdout));
                (out, h)
            }
        };
        if !out.status.success() {
            return Err(Error::Computation(stderr_message(&out)));
        }
        parsed.ok_or_else(|| {
            Error::Computation(format!("{} printed no job id", self.kind.submit_command()))
        })
    }

    fn poll(&self, handle: &ClusterHandle) -> Result<ClusterStatus> {
        match self.kind {
            SchedulerKind::Slurm => {
                let out = run_command("sacct", &["-j", handle.as_str(), "-n", "-X", "-P", "-o", "State"], None)?;
                if !out.status.success() {
                    return Err(Error::Computation(stderr_message(&out)));
                }
                Ok(parse_sacct_state(&String::from_utf8_lossy(&out.stdout)))
            }
            SchedulerKind::Torque => {
                let out = run_command("qstat", &["-f", handle.as_str()], None)?;
                if !out.status.success() {
                    let msg = stderr_message(&out);
                    if msg.contains("Unknown Job Id") {
                        return Ok(ClusterStatus::Unknown);
                    }
                    return Err(Error::Computation(msg));
                }
                Ok(parse_qstat_full(&String::from_utf8_lossy(&out.stdout)))
            }
        }
    }

    fn cancel(&self, handle: &ClusterHandle) -> Result<bool> {
        let program = match self.kind {
            SchedulerKind::Slurm => "scancel",
            SchedulerKind::Torque => "qdel",
        };
        let out = run_command(program, &[handle.as_str()], None)?;
        if !out.status.success() {
            log::warn!("{program} {handle}: {}", stderr_message(&out));
        }
        Ok(out.status.success())
    }
}
