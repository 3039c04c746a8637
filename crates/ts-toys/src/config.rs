//! Payload configuration.
//!
//! The batch layer carries this as an opaque JSON value inside each
//! [`ts_core::JobDescriptor`]; only the payload interprets it. Validation is
//! explicit so the driver can reject a bad configuration before submitting
//! anything.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use ts_core::{Error, JobKind, Result};

/// Model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Truncated Gaussian signal over a truncated exponential background,
    /// extended with signal and background yields.
    GaussExp,
}

/// One model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Nominal value (generation truth and fit start).
    pub value: f64,
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
    /// Keep constant in the fit.
    #[serde(default)]
    pub fixed: bool,
}

/// Reference model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model family.
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: ModelType,
    /// Observable range `[lo, hi]`.
    pub range: [f64; 2],
    /// Parameters keyed by name.
    pub parameters: BTreeMap<String, ParameterSpec>,
}

fn default_model_type() -> ModelType {
    ModelType::GaussExp
}

/// How many events a toy holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSpec {
    /// Exact number of events. When unset, signal and background counts are
    /// Poisson-fluctuated around the yields.
    #[serde(default)]
    pub n_events: Option<usize>,
}

/// Fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSpec {
    /// Maximum optimizer iterations.
    #[serde(default = "default_max_iter")]
    pub max_iter: u64,
    /// Gradient-norm tolerance.
    #[serde(default = "default_tol")]
    pub tol: f64,
    /// L-BFGS history size.
    #[serde(default = "default_m")]
    pub m: usize,
    /// Wall-clock budget for one fit. Overruns are reported as `timed_out`.
    #[serde(default)]
    pub time_budget_secs: Option<f64>,
}

fn default_max_iter() -> u64 {
    1000
}

fn default_tol() -> f64 {
    1e-6
}

fn default_m() -> usize {
    10
}

impl Default for FitSpec {
    fn default() -> Self {
        Self { max_iter: default_max_iter(), tol: default_tol(), m: default_m(), time_budget_secs: None }
    }
}

/// Randomization of selected parameters before generation.
///
/// Values are drawn from a multivariate normal around `central` (nominal
/// values when omitted). Give either a full `covariance` or per-parameter
/// `sigmas`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystematicSpec {
    /// Parameters to randomize.
    pub parameters: Vec<String>,
    /// Central values, one per parameter.
    #[serde(default)]
    pub central: Option<Vec<f64>>,
    /// Covariance matrix (row-major rows).
    #[serde(default)]
    pub covariance: Option<Vec<Vec<f64>>>,
    /// Independent widths.
    #[serde(default)]
    pub sigmas: Option<Vec<f64>>,
}

impl SystematicSpec {
    /// Covariance as a matrix, built from `covariance` or `sigmas`.
    pub fn covariance_matrix(&self) -> Result<DMatrix<f64>> {
        let n = self.parameters.len();
        match (&self.covariance, &self.sigmas) {
            (Some(rows), None) => {
                if rows.len() != n || rows.iter().any(|r| r.len() != n) {
                    return Err(Error::Config(format!(
                        "systematic covariance must be {n}x{n} for parameters {:?}",
                        self.parameters
                    )));
                }
                Ok(DMatrix::from_fn(n, n, |i, j| rows[i][j]))
            }
            (None, Some(sigmas)) => {
                if sigmas.len() != n {
                    return Err(Error::Config(format!(
                        "systematic sigmas has {} entries, expected {n}",
                        sigmas.len()
                    )));
                }
                Ok(DMatrix::from_fn(n, n, |i, j| if i == j { sigmas[i] * sigmas[i] } else { 0.0 }))
            }
            _ => Err(Error::Config(
                "systematic needs exactly one of 'covariance' or 'sigmas'".to_string(),
            )),
        }
    }
}

/// Full payload configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyConfig {
    /// Reference model.
    pub model: ModelSpec,
    /// Generation settings (generating kinds).
    #[serde(default)]
    pub generation: Option<GenerationSpec>,
    /// Fit settings.
    #[serde(default)]
    pub fit: FitSpec,
    /// Optional systematic randomization.
    #[serde(default)]
    pub systematic: Option<SystematicSpec>,
}

impl ToyConfig {
    /// Parse from the opaque descriptor value. Unknown keys (e.g. `dataset`,
    /// which the batch layer resolves) are ignored.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Config(format!("invalid payload configuration: {e}")))
    }

    /// Check the configuration is usable for `kind`.
    pub fn validate(&self, kind: JobKind) -> Result<()> {
        let [lo, hi] = self.model.range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Error::Config(format!("model range must satisfy lo < hi, got [{lo}, {hi}]")));
        }
        for name in crate::model::PARAMETER_NAMES {
            let p = self
                .model
                .parameters
                .get(name)
                .ok_or_else(|| Error::Config(format!("model parameter '{name}' is missing")))?;
            if !(p.min <= p.value && p.value <= p.max) {
                return Err(Error::Config(format!(
                    "model parameter '{name}': value {} outside [{}, {}]",
                    p.value, p.min, p.max
                )));
            }
        }
        if let Some(extra) =
            self.model.parameters.keys().find(|k| !crate::model::PARAMETER_NAMES.contains(&k.as_str()))
        {
            return Err(Error::Config(format!("unknown model parameter '{extra}'")));
        }
        let sigma = &self.model.parameters["sigma"];
        if sigma.min <= 0.0 {
            return Err(Error::Config("model parameter 'sigma' must have a positive lower bound".into()));
        }

        if kind.generates() && self.generation.is_none() {
            return Err(Error::Config(format!("job kind '{kind}' requires a 'generation' section")));
        }
        if kind.fits() {
            if self.fit.max_iter == 0 || !(self.fit.tol.is_finite() && self.fit.tol >= 0.0) {
                return Err(Error::Config("fit.max_iter must be > 0 and fit.tol >= 0".into()));
            }
            if let Some(b) = self.fit.time_budget_secs
                && !(b.is_finite() && b > 0.0)
            {
                return Err(Error::Config(format!("fit.time_budget_secs must be > 0, got {b}")));
            }
        }

        if let Some(syst) = &self.systematic {
            if syst.parameters.is_empty() {
                return Err(Error::Config("systematic.parameters must not be empty".into()));
            }
            for name in &syst.parameters {
                if !self.model.parameters.contains_key(name) {
                    return Err(Error::Config(format!(
                        "systematic parameter '{name}' is not a model parameter"
                    )));
                }
            }
            if let Some(c) = &syst.central
                && c.len() != syst.parameters.len()
            {
                return Err(Error::Config(format!(
                    "systematic.central has {} entries, expected {}",
                    c.len(),
                    syst.parameters.len()
                )));
            }
            let cov = syst.covariance_matrix()?;
            if nalgebra::linalg::Cholesky::new(cov).is_none() {
                return Err(Error::Config("systematic covariance is not positive definite".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn example_config() -> serde_json::Value {
        serde_json::json!({
            "model": {
                "type": "gauss_exp",
                "range": [5.0, 5.6],
                "parameters": {
                    "n_sig": {"value": 400.0, "min": 0.0, "max": 4000.0},
                    "n_bkg": {"value": 800.0, "min": 0.0, "max": 8000.0},
                    "mean": {"value": 5.28, "min": 5.2, "max": 5.36},
                    "sigma": {"value": 0.02, "min": 0.005, "max": 0.1},
                    "slope": {"value": -2.0, "min": -10.0, "max": 10.0}
                }
            },
            "generation": {},
            "fit": {"max_iter": 500}
        })
    }

    #[test]
    fn test_parse_and_validate() {
        let cfg = ToyConfig::from_value(&example_config()).unwrap();
        assert_eq!(cfg.model.model_type, ModelType::GaussExp);
        assert_eq!(cfg.fit.max_iter, 500);
        assert_eq!(cfg.fit.m, 10);
        cfg.validate(JobKind::GenerateAndFit).unwrap();
    }

    #[test]
    fn test_missing_generation_rejected_for_generating_kinds() {
        let mut v = example_config();
        v.as_object_mut().unwrap().remove("generation");
        let cfg = ToyConfig::from_value(&v).unwrap();
        assert!(cfg.validate(JobKind::Fit).is_ok());
        assert!(matches!(cfg.validate(JobKind::Generate), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_parameter_rejected() {
        let mut v = example_config();
        v["model"]["parameters"].as_object_mut().unwrap().remove("slope");
        let cfg = ToyConfig::from_value(&v).unwrap();
        let err = cfg.validate(JobKind::Fit).unwrap_err();
        assert!(err.to_string().contains("slope"));
    }

    #[test]
    fn test_systematic_covariance_checked() {
        let mut v = example_config();
        v["systematic"] = serde_json::json!({
            "parameters": ["mean", "sigma"],
            "covariance": [[1e-4, 2e-4], [2e-4, 1e-4]]
        });
        let cfg = ToyConfig::from_value(&v).unwrap();
        assert!(cfg.validate(JobKind::GenerateAndFit).is_err());

        v["systematic"] = serde_json::json!({"parameters": ["mean"], "sigmas": [0.001]});
        let cfg = ToyConfig::from_value(&v).unwrap();
        cfg.validate(JobKind::GenerateAndFit).unwrap();
    }
}
