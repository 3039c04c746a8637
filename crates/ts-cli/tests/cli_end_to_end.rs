use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_toystudy"))
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../tests/fixtures").join(name)
}

fn tmp_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let p = std::env::temp_dir().join(format!("toystudy_e2e_{}_{}_{}", std::process::id(), nanos, name));
    std::fs::create_dir_all(&p).unwrap();
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn ok_json(out: Output) -> serde_json::Value {
    assert!(
        out.status.success(),
        "command failed:\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("stdout should be JSON")
}

/// build -> submit (local processes) -> merge -> analyze.
#[test]
fn local_batch_runs_to_an_analysis() {
    let root = tmp_root("local");
    let r = root.to_str().unwrap();
    let config = fixture_path("toy_batch.yaml");
    ok_json(run(&["build", "--config", config.to_str().unwrap(), "--root", r]));

    let report = ok_json(run(&["submit", "--batch", "cli_toys", "--root", r]));
    assert_eq!(report["finished"], true);
    assert_eq!(report["counts"]["succeeded"], 3, "report: {report}");
    assert!(root.join("cli_toys/logs/cli_toys-00000-a1.log").exists());

    let merged = ok_json(run(&["merge", "--batch", "cli_toys", "--root", r]));
    assert_eq!(merged["total_succeeded"], 3);
    assert_eq!(merged["missing_indices"].as_array().unwrap().len(), 0);
    assert_eq!(merged["parameters"], serde_json::json!(["mean", "n_bkg", "n_sig", "sigma", "slope"]));
    assert!(root.join("cli_toys/aggregate.json").exists());

    let out_path = root.join("analysis.json");
    let out = run(&[
        "analyze",
        "--batch",
        "cli_toys",
        "--root",
        r,
        "--min-succeeded",
        "1",
        "--include-non-converged",
        "--output",
        out_path.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&std::fs::read(&out_path).unwrap()).unwrap();
    assert_eq!(v["batch_id"], "cli_toys");
    assert_eq!(v["total_requested"], 3);
    assert_eq!(v["reduced_sample"], false);
    assert_eq!(v["effective_fraction"], 1.0);
    let counted: u64 = v["fit_status_counts"].as_object().unwrap().values().map(|n| n.as_u64().unwrap()).sum();
    assert_eq!(counted, 3);
    assert!(v["n_used"].as_u64().unwrap() >= 1);
    for name in ["n_sig", "n_bkg", "mean", "sigma", "slope"] {
        assert!(v["parameters"].get(name).is_some(), "missing summary for {name}");
    }
    let _ = std::fs::remove_dir_all(&root);
}
