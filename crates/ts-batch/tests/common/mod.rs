#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, TimeZone, Utc};
use ts_batch::testing::SimulatedCluster;
use ts_batch::{
    BatchConfig, BatchLayout, BatchReport, ClusterAdapter, JobLauncher, JobStore, Tracker, build_from_config,
};
use ts_core::JobDescriptor;

pub fn tmp_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let p = std::env::temp_dir().join(format!("toystudy_it_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

/// Fit batch with immediate retries.
pub fn config(batch_id: &str, n: usize, max_attempts: u32) -> BatchConfig {
    serde_json::from_value(serde_json::json!({
        "batch_id": batch_id,
        "n_toys": n,
        "kind": "fit",
        "model": {"range": [5.0, 5.6]},
        "dataset": "data/{batch_id}_{index:05}.json",
        "tracker": {
            "max_attempts": max_attempts,
            "staleness_timeout_secs": 60,
            "poll_interval_secs": 1,
            "cancel_timeout_secs": 30,
            "backoff": {"base_secs": 0, "max_secs": 0},
            "max_abandoned_fraction": 0.05
        }
    }))
    .unwrap()
}

/// Build the batch on disk and return its store and descriptors.
pub fn build(root: &Path, cfg: &BatchConfig) -> (JobStore, Vec<JobDescriptor>) {
    let descriptors = build_from_config(root, cfg).unwrap();
    let store = JobStore::new(BatchLayout::new(root, &cfg.batch_id));
    store.init(cfg, &descriptors).unwrap();
    (store, descriptors)
}

pub fn tracker(store: &JobStore, sim: &Arc<SimulatedCluster>) -> Tracker {
    let adapter: Arc<dyn ClusterAdapter> = sim.clone();
    let launcher = JobLauncher::from_config(&Default::default(), "toystudy", store.layout().root().to_path_buf());
    Tracker::resume(store.clone(), adapter, launcher).unwrap()
}

/// Tick once per second from `start` until finished (or `max_ticks`).
pub fn drive(tracker: &mut Tracker, start: i64, max_ticks: i64) -> (BatchReport, i64) {
    let mut t = start;
    loop {
        let report = tracker.tick_at(at(t)).unwrap();
        if report.is_finished() || t - start >= max_ticks {
            return (report, t);
        }
        t += 1;
    }
}
