//! Sample statistics over toy values.

use statrs::statistics::Statistics;

/// Lower/upper quantiles of the 1σ, 2σ and 3σ central intervals.
pub const SIGMA_QUANTILES: [(u8, f64, f64); 3] =
    [(1, 0.15865, 0.84135), (2, 0.02275, 0.97725), (3, 0.0013, 0.9987)];

/// Mean, sample standard deviation and error on the mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    /// Number of values.
    pub n: usize,
    /// Arithmetic mean (NaN when empty).
    pub mean: f64,
    /// Sample standard deviation (NaN below two values).
    pub std_dev: f64,
    /// `std_dev / sqrt(n)`.
    pub error_on_mean: f64,
}

impl Moments {
    /// Moments of `xs`.
    pub fn of(xs: &[f64]) -> Self {
        let n = xs.len();
        let mean = xs.iter().mean();
        let std_dev = xs.iter().std_dev();
        let error_on_mean = if n > 0 { std_dev / (n as f64).sqrt() } else { f64::NAN };
        Self { n, mean, std_dev, error_on_mean }
    }
}

/// Quantile of sorted data with linear interpolation between order
/// statistics.
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

/// Sorted copy of the finite values in `xs`.
pub fn sorted_finite(xs: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = xs.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}
