//! Analyzer settings, read from the `analysis` section of a batch config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_core::{Error, Result};

fn default_min_succeeded() -> usize {
    10
}

/// `analysis` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Fewest usable toys for which the analysis is run.
    #[serde(default = "default_min_succeeded")]
    pub min_succeeded: usize,
    /// Reference value per parameter, used when a record carries no
    /// generated value.
    #[serde(default)]
    pub reference: BTreeMap<String, f64>,
    /// Also use fits that did not converge.
    #[serde(default)]
    pub include_non_converged: bool,
    /// Restrict the report to these parameters (all when empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_succeeded: default_min_succeeded(),
            reference: BTreeMap::new(),
            include_non_converged: false,
            parameters: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    /// Parse the section; `null` (section absent) gives the defaults.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let cfg: Self = if value.is_null() {
            Self::default()
        } else {
            serde_json::from_value(value.clone())
                .map_err(|e| Error::Config(format!("analysis section: {e}")))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the analyzer cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.min_succeeded == 0 {
            return Err(Error::Config("analysis.min_succeeded must be at least 1".into()));
        }
        if let Some((name, v)) = self.reference.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::Config(format!("analysis.reference.{name} must be finite, got {v}")));
        }
        Ok(())
    }
}
