//! Jobs as child processes of the driver.
//!
//! Handles only live as long as the driver process. Each cluster instance
//! stamps its handles with a session id, so after a restart every old handle
//! polls as `Unknown` and the tracker's staleness rule takes over. A finished
//! job is reported once and then forgotten.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ts_core::{Error, Result};

use crate::cluster::{ClusterAdapter, ClusterHandle, ClusterStatus, SubmitRequest};

enum Slot {
    Queued(SubmitRequest),
    Running(Child),
    Finished(bool),
}

#[derive(Default)]
struct Jobs {
    slots: HashMap<String, Slot>,
    queue: VecDeque<String>,
}

impl Jobs {
    fn running(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, Slot::Running(_))).count()
    }
}

/// Local process "cluster" with an optional concurrency cap.
pub struct LocalCluster {
    max_parallel: usize,
    session: String,
    next_id: AtomicU64,
    jobs: Mutex<Jobs>,
}

static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// `{pid}-{start_nanos:x}-{instance}`: unique across driver restarts.
fn new_session() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let instance = INSTANCES.fetch_add(1, Ordering::Relaxed);
    format!("{}-{nanos:x}-{instance}", std::process::id())
}

fn spawn(req: &SubmitRequest) -> Result<Child> {
    if let Some(dir) = req.log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log = File::create(&req.log_path)?;
    let err = log.try_clone()?;
    Command::new(&req.program)
        .args(&req.args)
        .current_dir(&req.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err))
        .spawn()
        .map_err(|e| Error::Computation(format!("cannot start '{}': {e}", req.program)))
}

impl LocalCluster {
    /// At most `max_parallel` jobs run at once; the rest wait in submission order.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            session: new_session(),
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(Jobs::default()),
        }
    }

    /// Prefix shared by every handle this instance issues.
    pub fn session(&self) -> &str {
        &self.session
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Jobs>> {
        self.jobs.lock().map_err(|_| Error::Computation("local cluster state poisoned".to_string()))
    }

    /// Reap finished children and start queued jobs while slots are free.
    fn refresh(&self, jobs: &mut Jobs) {
        for slot in jobs.slots.values_mut() {
            if let Slot::Running(child) = slot {
                match child.try_wait() {
                    Ok(Some(status)) => *slot = Slot::Finished(status.success()),
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("local job wait failed: {e}");
                        *slot = Slot::Finished(false);
                    }
                }
            }
        }
        while jobs.running() < self.max_parallel {
            let Some(id) = jobs.queue.pop_front() else { break };
            let next = match jobs.slots.get(&id) {
                Some(Slot::Queued(req)) => match spawn(req) {
                    Ok(child) => Slot::Running(child),
                    Err(e) => {
                        log::warn!("{}: {e}", req.job_name);
                        Slot::Finished(false)
                    }
                },
                _ => continue,
            };
            jobs.slots.insert(id, next);
        }
    }
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

impl ClusterAdapter for LocalCluster {
    fn name(&self) -> &str {
        "local"
    }

    fn submit(&self, request: &SubmitRequest) -> Result<ClusterHandle> {
        if request.program.is_empty() {
            return Err(Error::Computation("empty program".to_string()));
        }
        let id = format!("local-{}-{}", self.session, self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut jobs = self.lock()?;
        jobs.slots.insert(id.clone(), Slot::Queued(request.clone()));
        jobs.queue.push_back(id.clone());
        self.refresh(&mut jobs);
        Ok(ClusterHandle(id))
    }

    fn poll(&self, handle: &ClusterHandle) -> Result<ClusterStatus> {
        let mut jobs = self.lock()?;
        self.refresh(&mut jobs);
        let status = match jobs.slots.get(handle.as_str()) {
            None => ClusterStatus::Unknown,
            Some(Slot::Queued(_)) => ClusterStatus::Queued,
            Some(Slot::Running(_)) => ClusterStatus::Running,
            Some(Slot::Finished(true)) => ClusterStatus::Done,
            Some(Slot::Finished(false)) => ClusterStatus::Failed,
        };
        if matches!(status, ClusterStatus::Done | ClusterStatus::Failed) {
            jobs.slots.remove(handle.as_str());
        }
        Ok(status)
    }

    fn cancel(&self, handle: &ClusterHandle) -> Result<bool> {
        let mut guard = self.lock()?;
        let jobs = &mut *guard;
        let cancelled = match jobs.slots.get_mut(handle.as_str()) {
            None => false,
            Some(Slot::Queued(_)) => {
                jobs.queue.retain(|id| id != handle.as_str());
                true
            }
            Some(Slot::Running(child)) => {
                if let Err(e) = child.kill() {
                    log::warn!("{handle}: kill failed: {e}");
                }
                if let Err(e) = child.wait() {
                    log::warn!("{handle}: wait after kill failed: {e}");
                }
                true
            }
            Some(Slot::Finished(_)) => true,
        };
        if cancelled {
            jobs.slots.remove(handle.as_str());
            self.refresh(jobs);
        }
        Ok(cancelled)
    }
}
