//! Maximum likelihood fit of one toy.
//!
//! Fixed parameters stay at their nominal value and are left out of the
//! minimization; uncertainties of the floating ones come from the inverse
//! Hessian at the minimum.

use nalgebra::DMatrix;
use ts_core::{FitStatus, Result, ToyModel};

use crate::optimizer::{LbfgsbOptimizer, ObjectiveFunction, OptimizerConfig};

/// Fit result of a single toy.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    /// Parameter values (all parameters, model order).
    pub values: Vec<f64>,
    /// Uncertainties (0 for fixed parameters, NaN when unavailable).
    pub uncertainties: Vec<f64>,
    /// NLL at the reported point.
    pub nll: Option<f64>,
    /// How the fit ended.
    pub status: FitStatus,
    /// Optimizer iterations.
    pub n_iter: u64,
    /// Optimizer message or error text.
    pub message: String,
}

impl FitOutcome {
    fn failed(start: Vec<f64>, message: String) -> Self {
        let n = start.len();
        Self {
            values: start,
            uncertainties: vec![f64::NAN; n],
            nll: None,
            status: FitStatus::FailedToRun,
            n_iter: 0,
            message,
        }
    }
}

/// NLL restricted to the floating parameters.
struct FreeObjective<'a, M: ToyModel + ?Sized> {
    model: &'a M,
    events: &'a [f64],
    template: Vec<f64>,
    free: Vec<usize>,
}

impl<M: ToyModel + ?Sized> FreeObjective<'_, M> {
    fn expand(&self, free_params: &[f64]) -> Vec<f64> {
        let mut full = self.template.clone();
        for (&i, &v) in self.free.iter().zip(free_params) {
            full[i] = v;
        }
        full
    }
}

impl<M: ToyModel + ?Sized> ObjectiveFunction for FreeObjective<'_, M> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.model.nll(self.events, &self.expand(params))
    }
}

/// Unbinned maximum likelihood fitter.
#[derive(Debug, Clone, Default)]
pub struct ToyFitter {
    config: OptimizerConfig,
}

impl ToyFitter {
    /// Create a fitter with the given optimizer settings.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Fit `events` starting from the model's nominal values.
    ///
    /// Never returns an error: optimizer failures come back as
    /// [`FitStatus::FailedToRun`] so the caller can still write a record.
    pub fn fit<M: ToyModel + ?Sized>(&self, model: &M, events: &[f64], fixed: &[bool]) -> FitOutcome {
        let start = model.nominal_values();
        let bounds = model.parameter_bounds();
        let free: Vec<usize> = (0..start.len()).filter(|&i| !fixed.get(i).copied().unwrap_or(false)).collect();

        if free.is_empty() {
            return match model.nll(events, &start) {
                Ok(nll) => FitOutcome {
                    uncertainties: vec![0.0; start.len()],
                    values: start,
                    nll: Some(nll),
                    status: FitStatus::Converged,
                    n_iter: 0,
                    message: "all parameters fixed".to_string(),
                },
                Err(e) => FitOutcome::failed(start, e.to_string()),
            };
        }

        let objective = FreeObjective { model, events, template: start.clone(), free: free.clone() };
        let init: Vec<f64> = free.iter().map(|&i| start[i]).collect();
        let free_bounds: Vec<(f64, f64)> = free.iter().map(|&i| bounds[i]).collect();

        let opt = match LbfgsbOptimizer::new(self.config.clone()).minimize(&objective, &init, &free_bounds) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("fit failed to run: {e}");
                return FitOutcome::failed(start, e.to_string());
            }
        };

        let values = objective.expand(&opt.parameters);
        let status = if opt.timed_out {
            FitStatus::TimedOut
        } else if opt.converged {
            FitStatus::Converged
        } else {
            FitStatus::NotConverged
        };

        let mut uncertainties = vec![0.0; values.len()];
        if status == FitStatus::TimedOut {
            for &i in &free {
                uncertainties[i] = f64::NAN;
            }
        } else {
            let errs = match compute_hessian(&objective, &opt.parameters) {
                Ok(h) => match invert_hessian(&h) {
                    Some(cov) => (0..free.len()).map(|i| cov[(i, i)].max(0.0).sqrt()).collect(),
                    None => {
                        log::warn!("Hessian not invertible at the minimum; using diagonal uncertainties");
                        diagonal_uncertainties(&h)
                    }
                },
                Err(e) => {
                    log::warn!("Hessian evaluation failed: {e}");
                    vec![f64::NAN; free.len()]
                }
            };
            for (&i, e) in free.iter().zip(errs) {
                uncertainties[i] = e;
            }
        }

        let nll = opt.fval.is_finite().then_some(opt.fval);
        FitOutcome { values, uncertainties, nll, status, n_iter: opt.n_iter, message: opt.message }
    }
}

/// Hessian by forward differences of the gradient, symmetrised.
fn compute_hessian(objective: &dyn ObjectiveFunction, best: &[f64]) -> Result<DMatrix<f64>> {
    let n = best.len();
    let grad_center = objective.gradient(best)?;
    let mut hessian = DMatrix::zeros(n, n);
    for j in 0..n {
        let eps = 1e-4 * best[j].abs().max(1.0);
        let mut plus = best.to_vec();
        plus[j] += eps;
        let grad_plus = objective.gradient(&plus)?;
        for i in 0..n {
            hessian[(i, j)] = (grad_plus[i] - grad_center[i]) / eps;
        }
    }
    let ht = hessian.transpose();
    Ok((&hessian + &ht) * 0.5)
}

/// Covariance from a damped Cholesky solve; `None` if no positive variances
/// can be obtained.
fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    const MAX_ATTEMPTS: usize = 10;
    for attempt in 0..MAX_ATTEMPTS {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            return Some(chol.solve(&identity));
        }
        if attempt + 1 == MAX_ATTEMPTS {
            break;
        }
        let next = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        for i in 0..n {
            h_damped[(i, i)] += next - damping;
        }
        damping = next;
    }

    let cov = h_damped.lu().try_inverse()?;
    (0..n).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] > 0.0).then_some(cov)
}

fn diagonal_uncertainties(hessian: &DMatrix<f64>) -> Vec<f64> {
    (0..hessian.nrows()).map(|i| 1.0 / hessian[(i, i)].abs().max(1e-12).sqrt()).collect()
}
