mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use common::*;
use ts_batch::record::Attempt;
use ts_batch::testing::{Behavior, SimulatedCluster, parse_job_name};
use ts_batch::{
    ClusterAdapter, ClusterHandle, ClusterStatus, JobLauncher, JobRecord, JobStatus, JobStore, LocalCluster,
    SubmitRequest, Tracker, build_from_config, derive_seed, merge, merge_files,
};
use ts_core::{Error, FitStatus, MergeIssueKind, ParameterEstimate, ResultRecord};

#[test]
fn restarted_driver_polls_instead_of_resubmitting() {
    let root = tmp_root("restart");
    let cfg = config("restart", 4, 3);
    let (store, descriptors) = build(&root, &cfg);

    {
        let mut sim = SimulatedCluster::new(&descriptors);
        for index in 0..4 {
            sim = sim.script_always(index, Behavior::RunForever);
        }
        let sim = Arc::new(sim);
        let mut first = tracker(&store, &sim);
        first.tick_at(at(0)).unwrap();
        first.tick_at(at(10)).unwrap();
        assert!(first.records().iter().all(|r| r.status == JobStatus::Running));
        assert_eq!(sim.total_submissions(), 4);
    }

    // The new driver's scheduler view knows none of the old handles.
    let store = JobStore::open(&root, "restart").unwrap();
    let sim = Arc::new(SimulatedCluster::new(&descriptors));
    let mut second = tracker(&store, &sim);
    assert!(second.records().iter().all(|r| r.cluster_handle.is_some()));

    second.tick_at(at(30)).unwrap();
    assert_eq!(sim.total_submissions(), 0);
    assert!(second.records().iter().all(|r| r.status == JobStatus::Running));

    // Last update at t=10; 100 - 10 exceeds the 60 s window.
    second.tick_at(at(100)).unwrap();
    assert!(second.records().iter().all(|r| r.status == JobStatus::Lost));

    let (report, _) = drive(&mut second, 101, 10);
    assert_eq!(report.count(JobStatus::Succeeded), 4);
    assert_eq!(sim.total_submissions(), 4);
    assert!(second.records().iter().all(|r| r.attempt_count == 2));

    let agg = merge(&cfg.batch_id, cfg.n_toys, second.records()).unwrap();
    assert_eq!(agg.total_succeeded, 4);
    assert!(agg.records.iter().all(|r| r.attempt == 2));
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn rebuild_keeps_existing_records() {
    let root = tmp_root("rebuild");
    let cfg = config("rebuild", 3, 3);
    let (store, descriptors) = build(&root, &cfg);
    let sim = Arc::new(SimulatedCluster::new(&descriptors));
    let mut tracker = tracker(&store, &sim);
    drive(&mut tracker, 0, 10);

    // Only tracker/cluster sections may change between builds.
    let mut relaxed = cfg.clone();
    relaxed.tracker.max_attempts = 5;
    let summary = store.init(&relaxed, &descriptors).unwrap();
    assert_eq!(summary.kept, 3);
    assert_eq!(summary.created, 0);
    assert!(store.load_all().unwrap().iter().all(|r| r.status == JobStatus::Succeeded));

    let mut changed = cfg.clone();
    changed.kind = ts_core::JobKind::GenerateAndFit;
    changed.generation = Some(serde_json::json!({}));
    assert!(matches!(store.init(&changed, &descriptors), Err(Error::Config(_))));
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn growing_a_batch_keeps_seeds_and_runs_only_new_indices() {
    let root = tmp_root("grow");
    let cfg = config("grow", 3, 3);
    let (store, descriptors) = build(&root, &cfg);
    let sim = Arc::new(SimulatedCluster::new(&descriptors));
    let mut first = tracker(&store, &sim);
    drive(&mut first, 0, 10);

    let mut grown = cfg.clone();
    grown.n_toys = 5;
    let more = build_from_config(&root, &grown).unwrap();
    let summary = store.init(&grown, &more).unwrap();
    assert_eq!(summary.kept, 3);
    assert_eq!(summary.created, 2);
    for (old, new) in descriptors.iter().zip(&more) {
        assert_eq!(old, new);
    }
    assert_eq!(more[4].seed, derive_seed("grow", 4));
    let records = store.load_all().unwrap();
    assert_eq!(records.len(), 5);
    assert!(records[..3].iter().all(|r| r.status == JobStatus::Succeeded));
    assert!(records[3..].iter().all(|r| r.status == JobStatus::Pending));

    let sim = Arc::new(SimulatedCluster::new(&more));
    let mut second = tracker(&store, &sim);
    let (report, _) = drive(&mut second, 20, 10);
    assert_eq!(report.count(JobStatus::Succeeded), 5);
    assert_eq!(sim.submissions(0), 0);
    assert_eq!(sim.submissions(4), 1);

    let n = store.load_config().unwrap().n_toys;
    let agg = merge(&cfg.batch_id, n, second.records()).unwrap();
    assert_eq!(agg.total_requested, 5);
    assert_eq!(agg.total_succeeded, 5);

    let mut shrunk = cfg.clone();
    shrunk.n_toys = 2;
    let err = store.init(&shrunk, &descriptors[..2]).unwrap_err();
    assert!(err.to_string().contains("n_toys"), "{err}");
    let _ = std::fs::remove_dir_all(&root);
}

/// Record left behind by a driver that stopped after persisting attempt 1
/// but before the scheduler answered.
fn interrupted(store: &JobStore, index: usize) -> JobRecord {
    let mut r = store.load_all().unwrap().remove(index);
    r.attempt_count = 1;
    r.status = JobStatus::Submitted;
    r.last_update_time = Some(at(0));
    r.history.push(Attempt {
        attempt: 1,
        job_name: r.descriptor.job_name(1),
        handle: None,
        submitted_at: at(0),
        finished_at: None,
        outcome: None,
        error: None,
    });
    store.save(&r).unwrap();
    r
}

#[test]
fn interrupted_submission_is_waited_on_not_resubmitted() {
    let root = tmp_root("interrupted");
    let cfg = config("intr", 2, 3);
    let (store, descriptors) = build(&root, &cfg);
    interrupted(&store, 0);
    let done = interrupted(&store, 1);
    // Job 1 did reach the scheduler and finished.
    let result = ResultRecord {
        batch_id: "intr".into(),
        source_job_index: 1,
        seed: done.descriptor.seed,
        attempt: 1,
        job_name: Some(done.descriptor.job_name(1)),
        fitted_parameters: BTreeMap::from([("mu".to_string(), ParameterEstimate::new(1.0, 0.1))]),
        fit_status: FitStatus::Converged,
        wall_time_s: 0.5,
        generated_values: BTreeMap::new(),
        n_events: 100,
        nll: None,
        dataset_path: None,
    };
    ts_core::io::write_result_file(&done.descriptor.output_path, &result).unwrap();

    let sim = Arc::new(SimulatedCluster::new(&descriptors));
    let mut tracker = tracker(&store, &sim);
    tracker.tick_at(at(30)).unwrap();
    assert_eq!(sim.total_submissions(), 0);
    assert_eq!(tracker.records()[0].status, JobStatus::Submitted);
    assert_eq!(tracker.records()[1].status, JobStatus::Succeeded);
    assert_eq!(tracker.records()[1].attempt_count, 1);

    tracker.tick_at(at(61)).unwrap();
    assert_eq!(tracker.records()[0].status, JobStatus::Lost);
    assert_eq!(sim.total_submissions(), 0);

    let (report, _) = drive(&mut tracker, 62, 10);
    assert_eq!(report.count(JobStatus::Succeeded), 2);
    assert_eq!(sim.submissions(0), 1);
    assert_eq!(sim.submissions(1), 0);
    assert_eq!(tracker.records()[0].attempt_count, 2);
    let _ = std::fs::remove_dir_all(&root);
}

/// Refuses every submission after noting what the store held at that moment.
struct StoreWitness {
    store: JobStore,
    seen: Mutex<Vec<(usize, JobStatus, u32, Option<String>)>>,
}

impl ClusterAdapter for StoreWitness {
    fn name(&self) -> &str {
        "witness"
    }

    fn submit(&self, request: &SubmitRequest) -> ts_core::Result<ClusterHandle> {
        let (index, _) = parse_job_name(&request.job_name).unwrap();
        let r = self.store.load_all()?.remove(index);
        let name = r.history.last().map(|a| a.job_name.clone());
        self.seen.lock().unwrap().push((index, r.status, r.attempt_count, name));
        Err(Error::Computation("queue closed".into()))
    }

    fn poll(&self, _handle: &ClusterHandle) -> ts_core::Result<ClusterStatus> {
        Ok(ClusterStatus::Unknown)
    }

    fn cancel(&self, _handle: &ClusterHandle) -> ts_core::Result<bool> {
        Ok(true)
    }
}

#[test]
fn attempt_is_persisted_before_the_scheduler_sees_it() {
    let root = tmp_root("witness");
    let cfg = config("witness", 3, 3);
    let (store, _) = build(&root, &cfg);
    let witness = Arc::new(StoreWitness { store: store.clone(), seen: Mutex::new(Vec::new()) });
    let adapter: Arc<dyn ClusterAdapter> = witness.clone();
    let launcher = JobLauncher::from_config(&Default::default(), "toystudy", root.clone());
    let mut tracker = Tracker::resume(store.clone(), adapter, launcher).unwrap();
    tracker.tick_at(at(0)).unwrap();

    let mut seen = witness.seen.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen.len(), 3);
    for (index, (i, status, attempts, name)) in seen.into_iter().enumerate() {
        assert_eq!(i, index);
        assert_eq!(status, JobStatus::Submitted);
        assert_eq!(attempts, 1);
        assert_eq!(name, Some(format!("witness-{index:05}-a1")));
    }
    // Refused submissions still end as failed attempts.
    let records = store.load_all().unwrap();
    assert!(records.iter().all(|r| r.status == JobStatus::Failed && r.attempt_count == 1));
    assert!(records.iter().all(|r| r.history[0].outcome == Some(JobStatus::Failed)));
    let _ = std::fs::remove_dir_all(&root);
}

#[cfg(unix)]
#[test]
fn restarted_local_driver_does_not_reuse_old_handles() {
    let root = tmp_root("local_restart");
    let cfg = config("lrestart", 2, 3);
    let (store, _) = build(&root, &cfg);
    let launcher = JobLauncher {
        program: "/bin/sh".into(),
        base_args: vec!["-c".into(), "sleep 30".into()],
        resources: Default::default(),
        workdir: root.clone(),
    };

    let first_cluster = Arc::new(LocalCluster::new(2));
    let old_handles: Vec<ClusterHandle> = {
        let adapter: Arc<dyn ClusterAdapter> = first_cluster.clone();
        let mut first = Tracker::resume(store.clone(), adapter, launcher.clone()).unwrap();
        first.tick_at(at(0)).unwrap();
        first.tick_at(at(10)).unwrap();
        assert!(first.records().iter().all(|r| r.status == JobStatus::Running));
        first.records().iter().map(|r| r.cluster_handle.clone().unwrap()).collect()
    };

    // Job 1 failed while no driver was watching.
    let mut r = store.load_all().unwrap().remove(1);
    r.status = JobStatus::Failed;
    r.cluster_handle = None;
    r.retry_not_before = None;
    store.save(&r).unwrap();

    let second_cluster = Arc::new(LocalCluster::new(2));
    let adapter: Arc<dyn ClusterAdapter> = second_cluster.clone();
    let mut second = Tracker::resume(store.clone(), adapter, launcher).unwrap();
    second.tick_at(at(30)).unwrap();
    let new_handle = second.records()[1].cluster_handle.clone().unwrap();
    assert!(!old_handles.contains(&new_handle), "{new_handle} reused");
    assert_eq!(second.records()[0].status, JobStatus::Running);
    assert_eq!(second.records()[0].cluster_handle.as_ref(), Some(&old_handles[0]));

    // Job 0's handle is unknown to the new driver: last update at t=10.
    second.tick_at(at(100)).unwrap();
    assert_eq!(second.records()[0].status, JobStatus::Lost);
    assert_eq!(second.records()[1].status, JobStatus::Running);

    for h in &old_handles {
        let _ = first_cluster.cancel(h);
    }
    let _ = second_cluster.cancel(&new_handle);
    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn merging_twice_and_duplicates() {
    let root = tmp_root("dupes");
    let cfg = config("dupes", 3, 3);
    let (store, descriptors) = build(&root, &cfg);
    let sim = Arc::new(SimulatedCluster::new(&descriptors));
    let mut tracker = tracker(&store, &sim);
    drive(&mut tracker, 0, 10);

    let once = merge(&cfg.batch_id, 3, tracker.records()).unwrap();
    let again = merge(&cfg.batch_id, 3, tracker.records()).unwrap();
    assert_eq!(once, again);

    let paths: Vec<_> = descriptors.iter().rev().map(|d| d.output_path.clone()).collect();
    assert_eq!(merge_files(&cfg.batch_id, 3, &paths).unwrap(), once);

    let mut with_dup = paths.clone();
    with_dup.push(paths[0].clone());
    match merge_files(&cfg.batch_id, 3, &with_dup) {
        Err(Error::Merge { issues, retained, .. }) => {
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].kind, MergeIssueKind::DuplicateIndex);
            assert_eq!(issues[0].index, Some(2));
            assert_eq!(*retained, once);
        }
        other => panic!("expected merge error, got {other:?}"),
    }
    let _ = std::fs::remove_dir_all(&root);
}
