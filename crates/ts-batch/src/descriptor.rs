//! Job descriptors: one immutable unit of work per index.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use ts_core::{Error, JobDescriptor, JobKind, Result};

use crate::config::{BatchConfig, validate_batch_id};
use crate::layout::BatchLayout;

/// Seed of job `index`: first 8 bytes of `SHA-256(batch_id ‖ 0x00 ‖ index_le)`.
///
/// Depends on nothing but its inputs, so rebuilding a batch (or rebuilding it
/// with a larger `n`) reproduces every existing seed.
pub fn derive_seed(batch_id: &str, index: usize) -> u64 {
    let mut h = Sha256::new();
    h.update(batch_id.as_bytes());
    h.update([0u8]);
    h.update((index as u64).to_le_bytes());
    let digest = h.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Expand `{batch_id}`, `{index}` and `{index:05}` in a dataset template.
pub fn expand_template(template: &str, batch_id: &str, index: usize) -> String {
    template
        .replace("{batch_id}", batch_id)
        .replace("{index:05}", &format!("{index:05}"))
        .replace("{index}", &index.to_string())
}

fn required_sections(kind: JobKind) -> &'static [&'static str] {
    match kind {
        JobKind::Generate | JobKind::GenerateAndFit => &["model", "generation"],
        JobKind::Fit => &["model", "dataset"],
    }
}

/// Build the `n` descriptors of a batch rooted at `root`.
///
/// Fails with [`Error::Config`] before anything is written if `n` is zero,
/// the batch id is not path-safe, or `base_config` lacks a section `kind`
/// needs.
pub fn build_batch(
    root: &Path,
    batch_id: &str,
    n: usize,
    kind: JobKind,
    base_config: &serde_json::Value,
) -> Result<Vec<JobDescriptor>> {
    validate_batch_id(batch_id)?;
    if n == 0 {
        return Err(Error::Config(format!("batch {batch_id}: number of jobs must be > 0")));
    }
    let obj = base_config.as_object().ok_or_else(|| {
        Error::Config(format!("batch {batch_id}: job configuration must be a mapping"))
    })?;
    let missing: Vec<&str> = required_sections(kind)
        .iter()
        .copied()
        .filter(|k| obj.get(*k).is_none_or(|v| v.is_null()))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "batch {batch_id}: kind '{kind}' requires configuration section(s): {}",
            missing.join(", ")
        )));
    }
    let template = match obj.get("dataset") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.as_str()),
        Some(other) => {
            return Err(Error::Config(format!(
                "batch {batch_id}: 'dataset' must be a path template, got {other}"
            )));
        }
    };

    let layout = BatchLayout::new(root, batch_id);
    let descriptors = (0..n)
        .map(|index| {
            let from_template = template.map(|t| {
                let p = PathBuf::from(expand_template(t, batch_id, index));
                if p.is_absolute() { p } else { root.join(p) }
            });
            let dataset_path = match kind {
                JobKind::Generate => Some(from_template.unwrap_or_else(|| layout.dataset_path(index))),
                JobKind::Fit | JobKind::GenerateAndFit => from_template,
            };
            JobDescriptor {
                batch_id: batch_id.to_string(),
                index,
                kind,
                seed: derive_seed(batch_id, index),
                config: base_config.clone(),
                output_path: layout.result_path(index),
                dataset_path,
            }
        })
        .collect();
    Ok(descriptors)
}

/// [`build_batch`] from a validated [`BatchConfig`].
pub fn build_from_config(root: &Path, config: &BatchConfig) -> Result<Vec<JobDescriptor>> {
    config.validate()?;
    build_batch(root, &config.batch_id, config.n_toys, config.kind, &config.payload_config())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn base() -> serde_json::Value {
        serde_json::json!({"model": {"range": [0.0, 1.0]}, "generation": {}})
    }

    #[test]
    fn test_build_batch_paths_and_seeds() {
        let d = build_batch(Path::new("/study"), "toyA", 3, JobKind::Generate, &base()).unwrap();
        assert_eq!(d.len(), 3);
        assert_eq!(d[2].index, 2);
        assert_eq!(d[2].output_path, PathBuf::from("/study/toyA/results/toyA_00002.json"));
        assert_eq!(d[2].dataset_path, Some(PathBuf::from("/study/toyA/datasets/toyA_00002.json")));
        assert_ne!(d[0].seed, d[1].seed);
        assert_eq!(d[1].seed, derive_seed("toyA", 1));
    }

    #[test]
    fn test_seed_independent_of_n_and_kind() {
        let a = build_batch(Path::new("/r"), "toyA", 5, JobKind::Generate, &base()).unwrap();
        let b = build_batch(Path::new("/r"), "toyA", 50, JobKind::GenerateAndFit, &base()).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.seed, y.seed);
        }
        assert_ne!(derive_seed("toyA", 0), derive_seed("toyB", 0));
    }

    #[test]
    fn test_config_errors() {
        let root = Path::new("/r");
        assert!(matches!(build_batch(root, "toyA", 0, JobKind::Generate, &base()), Err(Error::Config(_))));
        assert!(matches!(build_batch(root, "", 3, JobKind::Generate, &base()), Err(Error::Config(_))));
        assert!(matches!(build_batch(root, "a/b", 3, JobKind::Generate, &base()), Err(Error::Config(_))));

        let err = build_batch(root, "toyA", 3, JobKind::Fit, &base()).unwrap_err();
        assert!(err.to_string().contains("dataset"), "{err}");

        let no_gen = serde_json::json!({"model": {}});
        let err = build_batch(root, "toyA", 3, JobKind::GenerateAndFit, &no_gen).unwrap_err();
        assert!(err.to_string().contains("generation"), "{err}");
    }

    #[test]
    fn test_fit_dataset_template() {
        let cfg = serde_json::json!({"model": {}, "dataset": "data/{batch_id}/toy_{index:05}.json"});
        let d = build_batch(Path::new("/r"), "toyB", 2, JobKind::Fit, &cfg).unwrap();
        assert_eq!(d[1].dataset_path, Some(PathBuf::from("/r/data/toyB/toy_00001.json")));
        assert_eq!(expand_template("/abs/{index}.json", "x", 42), "/abs/42.json");
    }

    proptest! {
        #[test]
        fn prop_build_batch_is_deterministic(batch in "[a-zA-Z0-9_-]{1,16}", n in 1usize..64) {
            let a = build_batch(Path::new("/r"), &batch, n, JobKind::Generate, &base()).unwrap();
            let b = build_batch(Path::new("/r"), &batch, n, JobKind::Generate, &base()).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
