//! Extended unbinned mixture model.
//!
//! `p(x) = n_sig · G(x; mean, sigma) + n_bkg · E(x; slope)` on `[lo, hi]`,
//! with both shapes normalized over the range. The negative log-likelihood is
//! the extended one: `n_sig + n_bkg − Σ ln p(x_i)`.

use rand::Rng;
use rand_distr::{Distribution, Poisson};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use ts_core::{Error, Result, ToyModel};

use crate::config::{ModelSpec, ModelType};

/// Parameter order used by every vector-valued API of the model.
pub const PARAMETER_NAMES: [&str; 5] = ["n_sig", "n_bkg", "mean", "sigma", "slope"];

const N_SIG: usize = 0;
const N_BKG: usize = 1;
const MEAN: usize = 2;
const SIGMA: usize = 3;
const SLOPE: usize = 4;

/// Below this |slope| the background is treated as flat.
const FLAT_SLOPE: f64 = 1e-9;
/// Floor for the per-event density inside the logarithm.
const DENSITY_FLOOR: f64 = 1e-300;

#[inline]
fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal should be constructible")
}

/// Gaussian signal + exponential background with yields.
#[derive(Debug, Clone)]
pub struct MixtureModel {
    lo: f64,
    hi: f64,
    nominal: Vec<f64>,
    bounds: Vec<(f64, f64)>,
    fixed: Vec<bool>,
}

impl MixtureModel {
    /// Build from a validated [`ModelSpec`].
    pub fn from_spec(spec: &ModelSpec) -> Result<Self> {
        match spec.model_type {
            ModelType::GaussExp => {}
        }
        let mut nominal = Vec::with_capacity(PARAMETER_NAMES.len());
        let mut bounds = Vec::with_capacity(PARAMETER_NAMES.len());
        let mut fixed = Vec::with_capacity(PARAMETER_NAMES.len());
        for name in PARAMETER_NAMES {
            let p = spec
                .parameters
                .get(name)
                .ok_or_else(|| Error::Config(format!("model parameter '{name}' is missing")))?;
            nominal.push(p.value);
            bounds.push((p.min, p.max));
            fixed.push(p.fixed);
        }
        let [lo, hi] = spec.range;
        if !(lo < hi) {
            return Err(Error::Config(format!("model range must satisfy lo < hi, got [{lo}, {hi}]")));
        }
        Ok(Self { lo, hi, nominal, bounds, fixed })
    }

    /// Observable range.
    pub fn range(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    /// Which parameters stay constant in the fit.
    pub fn fixed_mask(&self) -> &[bool] {
        &self.fixed
    }

    /// Position of a parameter in the model's vectors.
    pub fn parameter_index(name: &str) -> Option<usize> {
        PARAMETER_NAMES.iter().position(|&n| n == name)
    }

    fn signal_norm(&self, mean: f64, sigma: f64) -> f64 {
        let n = standard_normal();
        n.cdf((self.hi - mean) / sigma) - n.cdf((self.lo - mean) / sigma)
    }

    fn signal_density(&self, x: f64, mean: f64, sigma: f64, norm: f64) -> f64 {
        standard_normal().pdf((x - mean) / sigma) / (sigma * norm)
    }

    fn background_density(&self, x: f64, slope: f64) -> f64 {
        let width = self.hi - self.lo;
        if slope.abs() < FLAT_SLOPE {
            return 1.0 / width;
        }
        slope * (slope * (x - self.lo)).exp() / (slope * width).exp_m1()
    }

    /// Inverse-CDF draw from the truncated Gaussian.
    fn sample_signal<R: Rng + ?Sized>(&self, mean: f64, sigma: f64, rng: &mut R) -> f64 {
        let n = standard_normal();
        let a = n.cdf((self.lo - mean) / sigma);
        let b = n.cdf((self.hi - mean) / sigma);
        let u: f64 = rng.random();
        let p = (a + u * (b - a)).clamp(1e-15, 1.0 - 1e-15);
        (mean + sigma * n.inverse_cdf(p)).clamp(self.lo, self.hi)
    }

    /// Inverse-CDF draw from the truncated exponential.
    fn sample_background<R: Rng + ?Sized>(&self, slope: f64, rng: &mut R) -> f64 {
        let width = self.hi - self.lo;
        let u: f64 = rng.random();
        if slope.abs() < FLAT_SLOPE {
            return self.lo + u * width;
        }
        let x = self.lo + (u * (slope * width).exp_m1()).ln_1p() / slope;
        x.clamp(self.lo, self.hi)
    }

    /// Draw one dataset at `params`.
    ///
    /// With `n_events = None` the signal and background counts are Poisson
    /// fluctuations of the yields; otherwise exactly `n_events` events are
    /// drawn and split by the signal fraction.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        params: &[f64],
        n_events: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        self.check_len(params)?;
        let (ns, nb) = (params[N_SIG].max(0.0), params[N_BKG].max(0.0));
        let (mean, sigma, slope) = (params[MEAN], params[SIGMA], params[SLOPE]);
        if !(sigma > 0.0) {
            return Err(Error::Validation(format!("sigma must be positive, got {sigma}")));
        }

        let (n_sig_obs, n_bkg_obs) = match n_events {
            None => (poisson_count(ns, rng)?, poisson_count(nb, rng)?),
            Some(n) => {
                let total = ns + nb;
                if total <= 0.0 {
                    return Err(Error::Validation("yields sum to zero".to_string()));
                }
                let frac = ns / total;
                let n_sig = (0..n).filter(|_| rng.random::<f64>() < frac).count();
                (n_sig, n - n_sig)
            }
        };

        let mut events = Vec::with_capacity(n_sig_obs + n_bkg_obs);
        for _ in 0..n_sig_obs {
            events.push(self.sample_signal(mean, sigma, rng));
        }
        for _ in 0..n_bkg_obs {
            events.push(self.sample_background(slope, rng));
        }
        Ok(events)
    }

    fn check_len(&self, params: &[f64]) -> Result<()> {
        if params.len() != PARAMETER_NAMES.len() {
            return Err(Error::Validation(format!(
                "expected {} parameters, got {}",
                PARAMETER_NAMES.len(),
                params.len()
            )));
        }
        Ok(())
    }
}

fn poisson_count<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> Result<usize> {
    if !lambda.is_finite() || lambda <= 0.0 {
        // Poisson(0) is deterministically 0.
        return Ok(0);
    }
    let pois = Poisson::new(lambda)
        .map_err(|e| Error::Computation(format!("Poisson({lambda}) not constructible: {e}")))?;
    let k: f64 = pois.sample(rng);
    Ok(k as usize)
}

impl ToyModel for MixtureModel {
    fn parameter_names(&self) -> Vec<String> {
        PARAMETER_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.bounds.clone()
    }

    fn nominal_values(&self) -> Vec<f64> {
        self.nominal.clone()
    }

    fn nll(&self, events: &[f64], params: &[f64]) -> Result<f64> {
        self.check_len(params)?;
        let (ns, nb) = (params[N_SIG], params[N_BKG]);
        let (mean, sigma, slope) = (params[MEAN], params[SIGMA], params[SLOPE]);
        if !(sigma > 0.0) {
            return Err(Error::Computation(format!("sigma must be positive, got {sigma}")));
        }
        let norm = self.signal_norm(mean, sigma).max(DENSITY_FLOOR);

        let mut nll = ns + nb;
        for &x in events {
            let density = ns * self.signal_density(x, mean, sigma, norm)
                + nb * self.background_density(x, slope);
            nll -= density.max(DENSITY_FLOOR).ln();
        }
        if !nll.is_finite() {
            return Err(Error::Computation("non-finite NLL".to_string()));
        }
        Ok(nll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToyConfig;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model() -> MixtureModel {
        let cfg = ToyConfig::from_value(&crate::config::tests::example_config()).unwrap();
        MixtureModel::from_spec(&cfg.model).unwrap()
    }

    #[test]
    fn test_shapes_are_normalized() {
        let m = model();
        let (lo, hi) = m.range();
        let n = 20_000;
        let dx = (hi - lo) / n as f64;
        let norm = m.signal_norm(5.28, 0.02);
        let (mut s, mut b) = (0.0, 0.0);
        for i in 0..n {
            let x = lo + (i as f64 + 0.5) * dx;
            s += m.signal_density(x, 5.28, 0.02, norm) * dx;
            b += m.background_density(x, -2.0) * dx;
        }
        assert_relative_eq!(s, 1.0, epsilon = 1e-4);
        assert_relative_eq!(b, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_sample_is_seed_deterministic_and_in_range() {
        let m = model();
        let p = m.nominal_values();
        let a = m.sample(&p, None, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = m.sample(&p, None, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        let (lo, hi) = m.range();
        assert!(a.iter().all(|&x| x >= lo && x <= hi));
    }

    #[test]
    fn test_fixed_event_count() {
        let m = model();
        let p = m.nominal_values();
        let ev = m.sample(&p, Some(321), &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(ev.len(), 321);
    }

    #[test]
    fn test_nll_prefers_truth() {
        let m = model();
        let truth = m.nominal_values();
        let ev = m.sample(&truth, None, &mut StdRng::seed_from_u64(11)).unwrap();
        let mut shifted = truth.clone();
        shifted[MEAN] += 0.03;
        assert!(m.nll(&ev, &truth).unwrap() < m.nll(&ev, &shifted).unwrap());
    }
}
