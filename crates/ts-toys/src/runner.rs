//! The job payload.
//!
//! `run` turns one [`JobDescriptor`] into one [`ResultRecord`]. Numerical
//! trouble ends up in `fit_status`; only unusable input (corrupt config,
//! missing dataset, unwritable output) is an [`Error::Run`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use ts_core::{Error, FitStatus, JobDescriptor, ParameterEstimate, Result, ResultRecord};

use crate::config::ToyConfig;
use crate::mle::ToyFitter;
use crate::model::{MixtureModel, PARAMETER_NAMES};
use crate::optimizer::OptimizerConfig;
use crate::toys::{Dataset, generate_dataset};

/// Payload bound to one descriptor.
pub struct ToyRunner<'a> {
    descriptor: &'a JobDescriptor,
    config: ToyConfig,
    model: MixtureModel,
}

impl<'a> ToyRunner<'a> {
    /// Parse and validate the descriptor's configuration.
    pub fn new(descriptor: &'a JobDescriptor) -> Result<Self> {
        let config = ToyConfig::from_value(&descriptor.config)?;
        config.validate(descriptor.kind)?;
        let model = MixtureModel::from_spec(&config.model)?;
        Ok(Self { descriptor, config, model })
    }

    fn fitter(&self) -> ToyFitter {
        let fit = &self.config.fit;
        ToyFitter::new(OptimizerConfig {
            max_iter: fit.max_iter,
            tol: fit.tol,
            m: fit.m,
            time_budget: fit.time_budget_secs.map(Duration::from_secs_f64),
        })
    }

    fn dataset_path(&self) -> Result<&PathBuf> {
        self.descriptor.dataset_path.as_ref().ok_or_else(|| {
            Error::Validation(format!("job kind '{}' needs a dataset path", self.descriptor.kind))
        })
    }

    /// Execute the payload for `attempt` (1-based).
    pub fn run(&self, attempt: u32) -> Result<ResultRecord> {
        let d = self.descriptor;
        let started = Instant::now();

        let dataset = if d.kind.generates() {
            // A generation-only job must leave a dataset behind.
            if !d.kind.fits() {
                self.dataset_path()?;
            }
            let ds = generate_dataset(&self.config, &d.batch_id, d.index, d.seed)?;
            if let Some(path) = &d.dataset_path {
                ds.write(path)?;
            }
            ds
        } else {
            let path = self.dataset_path()?;
            let ds = Dataset::read(path)?;
            let (lo, hi) = self.model.range();
            if let Some(x) = ds.events.iter().find(|x| !(lo..=hi).contains(*x)) {
                return Err(Error::Validation(format!(
                    "{}: event {x} lies outside the model range [{lo}, {hi}]",
                    path.display()
                )));
            }
            log::debug!("loaded {} events from {}", ds.events.len(), path.display());
            ds
        };

        let mut record = ResultRecord {
            batch_id: d.batch_id.clone(),
            source_job_index: d.index,
            seed: d.seed,
            attempt,
            job_name: Some(d.job_name(attempt)),
            fitted_parameters: Default::default(),
            fit_status: FitStatus::NotFitted,
            wall_time_s: 0.0,
            generated_values: dataset.generated_values.clone(),
            n_events: dataset.events.len(),
            nll: None,
            dataset_path: d.dataset_path.clone(),
        };

        if d.kind.fits() {
            let outcome = self.fitter().fit(&self.model, &dataset.events, self.model.fixed_mask());
            log::debug!(
                "index {}: fit {} after {} iterations ({})",
                d.index,
                outcome.status,
                outcome.n_iter,
                outcome.message
            );
            if outcome.status != FitStatus::FailedToRun {
                record.fitted_parameters = PARAMETER_NAMES
                    .iter()
                    .zip(outcome.values.iter().zip(&outcome.uncertainties))
                    .map(|(name, (&v, &e))| (name.to_string(), ParameterEstimate::new(v, e)))
                    .collect();
            }
            record.fit_status = outcome.status;
            record.nll = outcome.nll;
        }

        record.wall_time_s = started.elapsed().as_secs_f64();
        Ok(record)
    }
}

fn run_error(descriptor: &JobDescriptor, e: Error) -> Error {
    match e {
        e @ Error::Run { .. } => e,
        other => Error::Run {
            batch_id: descriptor.batch_id.clone(),
            index: descriptor.index,
            message: other.to_string(),
        },
    }
}

/// Run the payload of `descriptor`. Failures are reported as [`Error::Run`].
pub fn run(descriptor: &JobDescriptor, attempt: u32) -> Result<ResultRecord> {
    ToyRunner::new(descriptor)
        .and_then(|r| r.run(attempt))
        .map_err(|e| run_error(descriptor, e))
}

/// Run and persist the record at the descriptor's output path.
///
/// Re-running the same index overwrites the file, so a resubmitted job never
/// leaves two records behind.
pub fn run_and_store(descriptor: &JobDescriptor, attempt: u32) -> Result<ResultRecord> {
    let record = run(descriptor, attempt)?;
    ts_core::io::write_result_file(&descriptor.output_path, &record)
        .map_err(|e| run_error(descriptor, e))?;
    log::info!(
        "{}: wrote {} ({}, {:.2}s)",
        descriptor.job_name(attempt),
        descriptor.output_path.display(),
        record.fit_status,
        record.wall_time_s
    );
    Ok(record)
}
