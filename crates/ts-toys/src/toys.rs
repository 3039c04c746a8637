//! Seeded pseudo-dataset generation.
//!
//! One job's seed fully determines its dataset: the randomized truth (when a
//! systematic is configured) and the events are drawn from a single
//! `StdRng::seed_from_u64(seed)` stream in a fixed order.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use ts_core::{Error, Result, ToyModel};

use crate::config::{SystematicSpec, ToyConfig};
use crate::model::{MixtureModel, PARAMETER_NAMES};

/// Schema version of stored datasets.
pub const DATASET_SCHEMA_VERSION: &str = "toystudy.dataset/1";

/// One generated pseudo-dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Schema version.
    pub schema_version: String,
    /// Batch that produced the dataset.
    pub batch_id: String,
    /// Index within the batch.
    pub index: usize,
    /// Generation seed.
    pub seed: u64,
    /// Parameter values used for generation.
    pub generated_values: BTreeMap<String, f64>,
    /// Observed values.
    pub events: Vec<f64>,
}

impl Dataset {
    /// Store as JSON, atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        ts_core::io::write_json_atomic(path, self)
    }

    /// Load and check the schema version.
    pub fn read(path: &Path) -> Result<Self> {
        let ds: Dataset = ts_core::io::read_json(path)?;
        if ds.schema_version != DATASET_SCHEMA_VERSION {
            return Err(Error::Validation(format!(
                "{}: unexpected dataset schema version {:?}",
                path.display(),
                ds.schema_version
            )));
        }
        Ok(ds)
    }
}

/// Draw the randomized truth for a systematic: `central + L z`, clamped to
/// the parameter bounds.
fn randomize<R: rand::Rng + ?Sized>(
    syst: &SystematicSpec,
    truth: &mut [f64],
    bounds: &[(f64, f64)],
    rng: &mut R,
) -> Result<()> {
    let idx: Vec<usize> = syst
        .parameters
        .iter()
        .map(|name| {
            MixtureModel::parameter_index(name)
                .ok_or_else(|| Error::Config(format!("systematic parameter '{name}' is not a model parameter")))
        })
        .collect::<Result<_>>()?;
    let cov: DMatrix<f64> = syst.covariance_matrix()?;
    let chol = nalgebra::linalg::Cholesky::new(cov)
        .ok_or_else(|| Error::Config("systematic covariance is not positive definite".into()))?;
    let central: Vec<f64> = match &syst.central {
        Some(c) => c.clone(),
        None => idx.iter().map(|&i| truth[i]).collect(),
    };
    let z: DVector<f64> = DVector::from_iterator(
        idx.len(),
        (0..idx.len()).map(|_| -> f64 { StandardNormal.sample(&mut *rng) }),
    );
    let shift = chol.l() * z;
    for (k, &i) in idx.iter().enumerate() {
        let (lo, hi) = bounds[i];
        truth[i] = (central[k] + shift[k]).clamp(lo, hi);
    }
    Ok(())
}

/// Generate the dataset of job `index` with `seed`.
pub fn generate_dataset(config: &ToyConfig, batch_id: &str, index: usize, seed: u64) -> Result<Dataset> {
    let model = MixtureModel::from_spec(&config.model)?;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut truth = model.nominal_values();
    if let Some(syst) = &config.systematic {
        randomize(syst, &mut truth, &model.parameter_bounds(), &mut rng)?;
    }
    let n_events = config.generation.as_ref().and_then(|g| g.n_events);
    let events = model.sample(&truth, n_events, &mut rng)?;

    Ok(Dataset {
        schema_version: DATASET_SCHEMA_VERSION.to_string(),
        batch_id: batch_id.to_string(),
        index,
        seed,
        generated_values: PARAMETER_NAMES.iter().map(|n| n.to_string()).zip(truth).collect(),
        events,
    })
}
