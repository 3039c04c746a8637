//! # ts-toys
//!
//! Per-job payload of a toy study: draw one pseudo-dataset from the
//! reference model and/or fit it, producing a [`ts_core::ResultRecord`].
//!
//! ## Architecture
//!
//! The fitter only sees the [`ts_core::ToyModel`] trait. The concrete
//! reference model lives in [`model`] and is selected from the job's
//! configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Payload configuration parsed from a job descriptor.
pub mod config;
/// Maximum-likelihood fit with Hessian uncertainties.
pub mod mle;
/// Reference model: Gaussian signal over exponential background.
pub mod model;
/// Generic numerical optimizer (L-BFGS with box clamping and a time budget).
pub mod optimizer;
/// `run(descriptor)`: the job payload.
pub mod runner;
/// Toy dataset generation and systematic randomization.
pub mod toys;

pub use config::{FitSpec, GenerationSpec, ModelSpec, ParameterSpec, SystematicSpec, ToyConfig};
pub use mle::{FitOutcome, ToyFitter};
pub use model::MixtureModel;
pub use optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use runner::{ToyRunner, run, run_and_store};
pub use toys::{Dataset, generate_dataset};
