//! Core traits for ToyStudy
//!
//! The batch pipeline treats the physics model as an opaque fit
//! specification. Anything implementing [`ToyModel`] can be fitted by the
//! toy fitter; the pipeline never looks inside.

use crate::Result;

/// Statistical model over an unbinned one-dimensional dataset.
pub trait ToyModel: Send + Sync {
    /// Number of parameters
    fn n_parameters(&self) -> usize {
        self.parameter_names().len()
    }

    /// Parameter names
    fn parameter_names(&self) -> Vec<String>;

    /// Parameter bounds (min, max)
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Nominal parameter values, used as generation truth and fit start.
    fn nominal_values(&self) -> Vec<f64>;

    /// Negative log-likelihood of `events` at `params`.
    fn nll(&self, events: &[f64], params: &[f64]) -> Result<f64>;
}
