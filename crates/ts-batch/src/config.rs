//! Batch configuration (`batch.yaml` / `batch.json`).
//!
//! One document describes the whole batch: what to run, how the tracker
//! retries, where jobs go, and how the aggregate is analysed. The payload
//! sections (`model`, `generation`, `fit`, `systematic`) and `analysis` are
//! kept as raw values here; their own crates give them meaning.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use ts_core::{Error, JobKind, Result};

/// Top-level keys that may change between the frozen and a rebuilt config.
pub const MUTABLE_SECTIONS: [&str; 3] = ["tracker", "cluster", "analysis"];

/// Retry and staleness policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Attempts per job before it is abandoned.
    pub max_attempts: u32,
    /// Seconds without a status update before a job counts as lost.
    pub staleness_timeout_secs: u64,
    /// Sleep between driving-loop ticks.
    pub poll_interval_secs: u64,
    /// Seconds a cancelling job may take before it is abandoned anyway.
    pub cancel_timeout_secs: u64,
    /// Retry delay.
    pub backoff: BackoffConfig,
    /// Abandoned fraction above which the batch is reported as exhausted.
    pub max_abandoned_fraction: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            staleness_timeout_secs: 3600,
            poll_interval_secs: 30,
            cancel_timeout_secs: 300,
            backoff: BackoffConfig::default(),
            max_abandoned_fraction: 0.05,
        }
    }
}

/// `delay = min(base_secs * 2^attempt, max_secs)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay in seconds.
    pub base_secs: u64,
    /// Cap in seconds.
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_secs: 30, max_secs: 3600 }
    }
}

/// Which scheduler receives the jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Child processes on this machine.
    #[default]
    Local,
    /// `sbatch` / `sacct` / `scancel`.
    Slurm,
    /// `qsub` / `qstat` / `qdel`.
    Torque,
}

/// Cluster resources and executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Scheduler backend.
    pub backend: Backend,
    /// Program that runs one job (defaults to the running `toystudy` binary).
    pub program: Option<String>,
    /// Memory request, scheduler syntax (e.g. `2G`).
    pub memory: Option<String>,
    /// Wall-time request, scheduler syntax (e.g. `01:00:00`).
    pub runtime: Option<String>,
    /// Queue / partition.
    pub queue: Option<String>,
    /// Maximum concurrent local jobs (local backend only).
    pub max_parallel: Option<usize>,
}

/// Full batch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Batch identifier; also the directory name under the study root.
    pub batch_id: String,
    /// Number of toys (jobs).
    pub n_toys: usize,
    /// Job kind.
    pub kind: JobKind,
    /// Reference model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<serde_json::Value>,
    /// Generation settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<serde_json::Value>,
    /// Dataset path template (`{batch_id}`, `{index}`, `{index:05}`), relative
    /// to the study root unless absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    /// Fit settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fit: Option<serde_json::Value>,
    /// Systematic randomization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systematic: Option<serde_json::Value>,
    /// Tracker policy.
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Cluster settings.
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Analyzer settings.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub analysis: serde_json::Value,
}

impl BatchConfig {
    /// Check everything that can be checked without the payload.
    pub fn validate(&self) -> Result<()> {
        validate_batch_id(&self.batch_id)?;
        if self.n_toys == 0 {
            return Err(Error::Config(format!("batch {}: n_toys must be > 0", self.batch_id)));
        }
        let t = &self.tracker;
        if t.max_attempts == 0 {
            return Err(Error::Config(format!("batch {}: tracker.max_attempts must be > 0", self.batch_id)));
        }
        if t.staleness_timeout_secs == 0 {
            return Err(Error::Config(format!(
                "batch {}: tracker.staleness_timeout_secs must be > 0",
                self.batch_id
            )));
        }
        if t.backoff.max_secs < t.backoff.base_secs {
            return Err(Error::Config(format!(
                "batch {}: tracker.backoff.max_secs ({}) < base_secs ({})",
                self.batch_id, t.backoff.max_secs, t.backoff.base_secs
            )));
        }
        if !(0.0..=1.0).contains(&t.max_abandoned_fraction) {
            return Err(Error::Config(format!(
                "batch {}: tracker.max_abandoned_fraction must lie in [0, 1], got {}",
                self.batch_id, t.max_abandoned_fraction
            )));
        }
        if self.cluster.max_parallel == Some(0) {
            return Err(Error::Config(format!("batch {}: cluster.max_parallel must be > 0", self.batch_id)));
        }
        Ok(())
    }

    /// Payload configuration carried by every descriptor of the batch.
    pub fn payload_config(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        let sections = [
            ("model", &self.model),
            ("generation", &self.generation),
            ("fit", &self.fit),
            ("systematic", &self.systematic),
        ];
        for (key, value) in sections {
            if let Some(v) = value {
                obj.insert(key.to_string(), v.clone());
            }
        }
        if let Some(d) = &self.dataset {
            obj.insert("dataset".to_string(), serde_json::Value::String(d.clone()));
        }
        serde_json::Value::Object(obj)
    }

    /// Top-level keys whose values differ between `self` and `other`.
    pub fn differing_sections(&self, other: &BatchConfig) -> Result<Vec<String>> {
        let a = serde_json::to_value(self)?;
        let b = serde_json::to_value(other)?;
        let empty = serde_json::Map::new();
        let (a, b) = (a.as_object().unwrap_or(&empty), b.as_object().unwrap_or(&empty));
        let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
        Ok(keys.into_iter().filter(|k| a.get(*k) != b.get(*k)).cloned().collect())
    }

    /// Accept `other` as a rebuild of `self` if they differ only in
    /// [`MUTABLE_SECTIONS`] or by a larger `n_toys`.
    pub fn check_compatible(&self, other: &BatchConfig) -> Result<()> {
        if other.n_toys < self.n_toys {
            return Err(Error::Config(format!(
                "batch {}: n_toys can only grow (frozen {}, got {})",
                self.batch_id, self.n_toys, other.n_toys
            )));
        }
        let frozen: Vec<String> = self
            .differing_sections(other)?
            .into_iter()
            .filter(|k| k != "n_toys" && !MUTABLE_SECTIONS.contains(&k.as_str()))
            .collect();
        if !frozen.is_empty() {
            return Err(Error::Config(format!(
                "batch {}: configuration differs from the frozen one in {}; only {} may change",
                self.batch_id,
                frozen.join(", "),
                MUTABLE_SECTIONS.join(", ")
            )));
        }
        Ok(())
    }
}

/// Batch ids name directories and scheduler jobs.
pub fn validate_batch_id(batch_id: &str) -> Result<()> {
    if batch_id.is_empty() {
        return Err(Error::Config("batch_id must not be empty".to_string()));
    }
    let ok = batch_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !batch_id.starts_with('.');
    if !ok {
        return Err(Error::Config(format!(
            "batch_id {batch_id:?} is not path-safe (use letters, digits, '-', '_', '.')"
        )));
    }
    Ok(())
}

/// Read a batch configuration from YAML or JSON (by extension; YAML default).
pub fn read_batch_config(path: &Path) -> Result<BatchConfig> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::Config(format!("cannot read batch configuration {}: {e}", path.display()))
    })?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: BatchConfig = if ext == "json" {
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
    } else {
        serde_yaml_ng::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
batch_id: toyA
n_toys: 100
kind: generate_and_fit
model:
  range: [5.0, 5.6]
generation: {}
tracker:
  max_attempts: 4
  backoff: {base_secs: 10}
cluster:
  backend: slurm
  memory: 2G
  queue: short
"#;

    fn parse() -> BatchConfig {
        serde_yaml_ng::from_str(YAML).unwrap()
    }

    #[test]
    fn test_yaml_defaults() {
        let cfg = parse();
        assert_eq!(cfg.kind, JobKind::GenerateAndFit);
        assert_eq!(cfg.tracker.max_attempts, 4);
        assert_eq!(cfg.tracker.backoff.base_secs, 10);
        assert_eq!(cfg.tracker.backoff.max_secs, 3600);
        assert_eq!(cfg.tracker.staleness_timeout_secs, 3600);
        assert_eq!(cfg.cluster.backend, Backend::Slurm);
        assert!(cfg.analysis.is_null());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_payload_config_sections() {
        let cfg = parse();
        let p = cfg.payload_config();
        assert!(p.get("model").is_some());
        assert!(p.get("generation").is_some());
        assert!(p.get("tracker").is_none());
        assert!(p.get("dataset").is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut cfg = parse();
        cfg.n_toys = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = parse();
        cfg.batch_id = "../escape".into();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = parse();
        cfg.tracker.max_abandoned_fraction = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_compatibility_allows_mutable_sections_and_growth() {
        let frozen = parse();
        let mut rebuilt = frozen.clone();
        rebuilt.tracker.max_attempts = 10;
        rebuilt.cluster.queue = Some("long".into());
        frozen.check_compatible(&rebuilt).unwrap();

        rebuilt.n_toys = 200;
        frozen.check_compatible(&rebuilt).unwrap();

        rebuilt.n_toys = 50;
        let err = frozen.check_compatible(&rebuilt).unwrap_err();
        assert!(err.to_string().contains("n_toys"), "{err}");

        rebuilt.n_toys = 100;
        rebuilt.kind = JobKind::Generate;
        let err = frozen.check_compatible(&rebuilt).unwrap_err();
        assert!(err.to_string().contains("kind"), "{err}");
    }

    #[test]
    fn test_read_batch_config_by_extension() {
        let dir = std::env::temp_dir();
        let yaml = dir.join(format!("toystudy_cfg_{}.yaml", std::process::id()));
        std::fs::write(&yaml, YAML).unwrap();
        assert_eq!(read_batch_config(&yaml).unwrap(), parse());

        let json = dir.join(format!("toystudy_cfg_{}.json", std::process::id()));
        std::fs::write(&json, serde_json::to_vec(&parse()).unwrap()).unwrap();
        assert_eq!(read_batch_config(&json).unwrap(), parse());
        let _ = std::fs::remove_file(&yaml);
        let _ = std::fs::remove_file(&json);
    }
}
