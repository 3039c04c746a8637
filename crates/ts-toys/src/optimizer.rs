//! Optimization algorithms
//!
//! Thin wrapper around argmin's L-BFGS with box constraints (by clamping)
//! and an optional wall-clock budget. A budget overrun is not an error: the
//! result comes back with `timed_out = true` and the best point seen so far.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use ts_core::{Error, Result};

/// Configuration for the L-BFGS optimizer
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of iterations
    pub max_iter: u64,
    /// Convergence tolerance for gradient norm
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
    /// Wall-clock budget for one minimization
    pub time_budget: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10, time_budget: None }
    }
}

/// Result of optimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters
    pub parameters: Vec<f64>,
    /// Function value at minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective (cost) evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Convergence status
    pub converged: bool,
    /// The time budget ran out before termination.
    pub timed_out: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, converged={}, timed_out={})",
            self.fval, self.n_iter, self.n_fev, self.converged, self.timed_out
        )
    }
}

/// Objective function trait for optimization
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate function at given parameters
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Gradient at given parameters; central differences unless overridden.
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut shifted = params.to_vec();
        for i in 0..params.len() {
            let eps = 1e-7 * params[i].abs().max(1.0);
            shifted[i] = params[i] + eps;
            let f_plus = self.eval(&shifted)?;
            shifted[i] = params[i] - eps;
            let f_minus = self.eval(&shifted)?;
            shifted[i] = params[i];
            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }
        Ok(grad)
    }
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Evaluation bookkeeping shared between argmin callbacks.
struct Tracking {
    cost: AtomicUsize,
    grad: AtomicUsize,
    deadline: Option<Instant>,
    expired: AtomicBool,
    best: Mutex<Option<(f64, Vec<f64>)>>,
}

impl Tracking {
    fn new(deadline: Option<Instant>) -> Self {
        Self {
            cost: AtomicUsize::new(0),
            grad: AtomicUsize::new(0),
            deadline,
            expired: AtomicBool::new(false),
            best: Mutex::new(None),
        }
    }

    fn check_deadline(&self) -> std::result::Result<(), argmin::core::Error> {
        if let Some(d) = self.deadline
            && Instant::now() >= d
        {
            self.expired.store(true, Ordering::Relaxed);
            return Err(argmin::core::Error::msg("fit-time budget exhausted"));
        }
        Ok(())
    }

    fn offer(&self, fval: f64, params: &[f64]) {
        if !fval.is_finite() {
            return;
        }
        if let Ok(mut best) = self.best.lock() {
            let better = match best.as_ref() {
                Some((f, _)) => fval < *f,
                None => true,
            };
            if better {
                *best = Some((fval, params.to_vec()));
            }
        }
    }
}

/// Wrapper to make ObjectiveFunction compatible with argmin
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    tracking: &'a Tracking,
}

impl CostFunction for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.tracking.check_deadline()?;
        self.tracking.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let f = self.objective.eval(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        self.tracking.offer(f, &clamped);
        Ok(f)
    }
}

impl Gradient for ArgminProblem<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.tracking.check_deadline()?;
        self.tracking.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // At an active bound, drop gradient components pointing outward so the
        // line search does not keep stepping into the clamped region.
        const EPS: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds.iter()).enumerate() {
            if (x <= lo + EPS && g[i] > 0.0) || (x >= hi - EPS && g[i] < 0.0) {
                g[i] = 0.0;
            }
        }
        Ok(g)
    }
}

/// L-BFGS optimizer with box constraints
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Create new optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize `objective` inside `bounds`, starting at `init_params`.
    ///
    /// Returns `Err` only for invalid input or solver failures; running out
    /// of time yields `Ok` with `timed_out = true`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        if init_params.len() != bounds.len() {
            return Err(Error::Validation(format!(
                "Parameter and bounds length mismatch: {} != {}",
                init_params.len(),
                bounds.len()
            )));
        }

        let init_clamped = clamp_params(init_params, bounds);
        let tracking = Tracking::new(self.config.time_budget.map(|b| Instant::now() + b));
        let problem = ArgminProblem { objective, bounds, tracking: &tracking };

        let linesearch = MoreThuenteLineSearch::new();
        // argmin's default cost tolerance (~EPS) is far too strict for NLL scales.
        let tol_cost = if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Validation(format!("Invalid optimizer configuration (tol): {e}")))?
            .with_tolerance_cost(tol_cost)
            .map_err(|e| {
                Error::Validation(format!("Invalid optimizer configuration (tol_cost): {e}"))
            })?;

        let run = Executor::new(problem, solver)
            .configure(|state| state.param(init_clamped.clone()).max_iters(self.config.max_iter))
            .run();

        let n_fev = tracking.cost.load(Ordering::Relaxed);
        let n_gev = tracking.grad.load(Ordering::Relaxed);

        let res = match run {
            Ok(res) => res,
            Err(e) if tracking.expired.load(Ordering::Relaxed) => {
                let (fval, parameters) = tracking
                    .best
                    .into_inner()
                    .ok()
                    .flatten()
                    .unwrap_or((f64::NAN, init_clamped));
                return Ok(OptimizationResult {
                    parameters,
                    fval,
                    n_iter: 0,
                    n_fev,
                    n_gev,
                    converged: false,
                    timed_out: true,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(Error::Computation(format!("Optimization failed: {e}"))),
        };

        let state = res.state();
        let best_unclamped = state
            .get_best_param()
            .ok_or_else(|| Error::Computation("No best parameters found".to_string()))?
            .clone();
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );

        Ok(OptimizationResult {
            parameters: clamp_params(&best_unclamped, bounds),
            fval: state.get_best_cost(),
            n_iter: state.get_iter(),
            n_fev,
            n_gev,
            converged,
            timed_out: false,
            message: termination.to_string(),
        })
    }
}

impl Default for LbfgsbOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)^2 + (y - 3)^2, minimum at (2, 3)
    struct QuadraticFunction;

    impl ObjectiveFunction for QuadraticFunction {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 2.0).powi(2) + (params[1] - 3.0).powi(2))
        }

        fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (params[0] - 2.0), 2.0 * (params[1] - 3.0)])
        }
    }

    struct NumericQuadratic;

    impl ObjectiveFunction for NumericQuadratic {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] + 1.0).powi(2) + 4.0 * (params[1] - 0.5).powi(2))
        }
    }

    #[test]
    fn test_optimizer_quadratic() {
        let optimizer = LbfgsbOptimizer::new(OptimizerConfig { max_iter: 100, ..Default::default() });
        let result =
            optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)]).unwrap();

        assert!(result.converged, "Optimizer should converge: {result}");
        assert!(!result.timed_out);
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_optimizer_numeric_gradient() {
        let result = LbfgsbOptimizer::default()
            .minimize(&NumericQuadratic, &[3.0, 3.0], &[(-10.0, 10.0), (-10.0, 10.0)])
            .unwrap();
        assert_relative_eq!(result.parameters[0], -1.0, epsilon = 1e-3);
        assert_relative_eq!(result.parameters[1], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_optimizer_with_bounds() {
        // Minimum at (2, 3) lies outside the box; expect the corner (1, 1).
        let result = LbfgsbOptimizer::default()
            .minimize(&QuadraticFunction, &[0.0, 0.0], &[(-1.0, 1.0), (-1.0, 1.0)])
            .unwrap();
        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_zero_budget_times_out() {
        let optimizer = LbfgsbOptimizer::new(OptimizerConfig {
            time_budget: Some(Duration::ZERO),
            ..Default::default()
        });
        let result =
            optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)]).unwrap();
        assert!(result.timed_out);
        assert!(!result.converged);
        assert_eq!(result.parameters, vec![0.0, 0.0]);
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let err = LbfgsbOptimizer::default().minimize(&QuadraticFunction, &[0.0], &[(-1.0, 1.0), (0.0, 1.0)]);
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
