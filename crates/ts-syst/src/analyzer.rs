//! Bias, pull and coverage summaries of a merged batch.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use ts_core::{AggregateDataset, Error, FitStatus, ResultRecord, Result};

use crate::config::AnalysisConfig;
use crate::stats::{Moments, SIGMA_QUANTILES, quantile_linear_sorted, sorted_finite};

/// Central interval of `value - reference`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentralInterval {
    /// Width in standard deviations (1, 2 or 3).
    pub sigma: u8,
    /// Lower quantile.
    pub low: f64,
    /// Upper quantile.
    pub high: f64,
}

/// Summary of one fitted parameter over the used toys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    /// Toys with a finite fitted value.
    pub n: usize,
    /// Mean fitted value.
    pub mean: f64,
    /// Spread of the fitted values.
    pub std_dev: f64,
    /// Error on `mean`.
    pub error_on_mean: f64,
    /// Toys with a reference value.
    pub n_with_reference: usize,
    /// Mean of `value - reference`.
    pub bias: f64,
    /// Error on `bias`.
    pub bias_error: f64,
    /// Central intervals of `value - reference`.
    pub intervals: Vec<CentralInterval>,
    /// Toys with a usable pull (reference and positive finite uncertainty).
    pub n_pulls: usize,
    /// Mean of the pulls.
    pub pull_mean: f64,
    /// Standard deviation of the pulls.
    pub pull_width: f64,
    /// Fraction of toys with `|pull| <= 1`.
    pub coverage: f64,
}

/// Output of [`analyze`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Batch identifier.
    pub batch_id: String,
    /// Toys requested for the batch.
    pub total_requested: usize,
    /// Toys that produced a record.
    pub total_succeeded: usize,
    /// Toys without a record.
    pub total_abandoned: usize,
    /// Toys that entered the summaries.
    pub n_used: usize,
    /// Some requested toys are missing; the effective sample is smaller than
    /// requested.
    pub reduced_sample: bool,
    /// Fraction of requested toys that produced a record.
    pub effective_fraction: f64,
    /// Records per fit status.
    pub fit_status_counts: BTreeMap<FitStatus, usize>,
    /// Per-parameter summaries.
    pub parameters: BTreeMap<String, ParameterSummary>,
}

/// Number of merged toys per fit status.
pub fn count_by_status(aggregate: &AggregateDataset) -> BTreeMap<FitStatus, usize> {
    let mut counts = BTreeMap::new();
    for r in &aggregate.records {
        *counts.entry(r.fit_status).or_insert(0) += 1;
    }
    counts
}

fn is_used(r: &ResultRecord, config: &AnalysisConfig) -> bool {
    if config.include_non_converged {
        !r.fitted_parameters.is_empty()
    } else {
        r.fit_status.is_usable()
    }
}

fn summarize(name: &str, records: &[&ResultRecord], config: &AnalysisConfig) -> ParameterSummary {
    let mut values = Vec::new();
    let mut deltas = Vec::new();
    let mut pulls = Vec::new();
    for r in records {
        let Some(est) = r.fitted_parameters.get(name) else {
            continue;
        };
        if !est.value.is_finite() {
            continue;
        }
        values.push(est.value);
        let reference = r.generated_values.get(name).or_else(|| config.reference.get(name));
        let Some(&reference) = reference else {
            continue;
        };
        let delta = est.value - reference;
        deltas.push(delta);
        if est.uncertainty.is_finite() && est.uncertainty > 0.0 {
            pulls.push(delta / est.uncertainty);
        }
    }

    let spread = Moments::of(&values);
    let bias = Moments::of(&deltas);
    let pull = Moments::of(&pulls);
    let sorted = sorted_finite(&deltas);
    let intervals = SIGMA_QUANTILES
        .iter()
        .map(|&(sigma, lo, hi)| CentralInterval {
            sigma,
            low: quantile_linear_sorted(&sorted, lo),
            high: quantile_linear_sorted(&sorted, hi),
        })
        .collect();
    let covered = pulls.iter().filter(|p| p.abs() <= 1.0).count();
    let coverage = if pulls.is_empty() { f64::NAN } else { covered as f64 / pulls.len() as f64 };

    if deltas.is_empty() {
        log::warn!("parameter {name}: no generated or configured reference; bias and pulls unavailable");
    }
    ParameterSummary {
        n: spread.n,
        mean: spread.mean,
        std_dev: spread.std_dev,
        error_on_mean: spread.error_on_mean,
        n_with_reference: bias.n,
        bias: bias.mean,
        bias_error: bias.error_on_mean,
        intervals,
        n_pulls: pull.n,
        pull_mean: pull.mean,
        pull_width: pull.std_dev,
        coverage,
    }
}

/// Analyze a merged batch.
///
/// Fails with [`Error::InsufficientData`] when fewer than
/// `config.min_succeeded` toys are usable.
pub fn analyze(aggregate: &AggregateDataset, config: &AnalysisConfig) -> Result<AnalysisReport> {
    let used: Vec<&ResultRecord> = aggregate.records.iter().filter(|r| is_used(r, config)).collect();
    if used.len() < config.min_succeeded {
        return Err(Error::InsufficientData {
            batch_id: aggregate.batch_id.clone(),
            succeeded: used.len(),
            requested: aggregate.total_requested,
            required: config.min_succeeded,
        });
    }

    let names: BTreeSet<&String> = if config.parameters.is_empty() {
        used.iter().flat_map(|r| r.fitted_parameters.keys()).collect()
    } else {
        config.parameters.iter().collect()
    };
    let parameters: BTreeMap<String, ParameterSummary> =
        names.into_iter().map(|n| (n.clone(), summarize(n, &used, config))).collect();
    if let Some(missing) = parameters.iter().find(|(_, s)| s.n == 0) {
        return Err(Error::Validation(format!(
            "batch {}: parameter {:?} was not fitted in any used toy",
            aggregate.batch_id, missing.0
        )));
    }

    let reduced_sample = !aggregate.is_complete();
    let effective_fraction = aggregate.effective_fraction();
    if reduced_sample {
        log::warn!(
            "batch {}: {} of {} toys missing; effective sample size reduced to {} ({:.1}%)",
            aggregate.batch_id,
            aggregate.total_abandoned,
            aggregate.total_requested,
            aggregate.total_succeeded,
            100.0 * effective_fraction
        );
    }

    Ok(AnalysisReport {
        batch_id: aggregate.batch_id.clone(),
        total_requested: aggregate.total_requested,
        total_succeeded: aggregate.total_succeeded,
        total_abandoned: aggregate.total_abandoned,
        n_used: used.len(),
        reduced_sample,
        effective_fraction,
        fit_status_counts: count_by_status(aggregate),
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ts_core::ParameterEstimate;

    fn record(index: usize, value: f64, sigma: f64, generated: Option<f64>, status: FitStatus) -> ResultRecord {
        ResultRecord {
            batch_id: "b".into(),
            source_job_index: index,
            seed: index as u64,
            attempt: 1,
            job_name: None,
            fitted_parameters: BTreeMap::from([("mu".to_string(), ParameterEstimate::new(value, sigma))]),
            fit_status: status,
            wall_time_s: 0.0,
            generated_values: generated.map(|g| BTreeMap::from([("mu".to_string(), g)])).unwrap_or_default(),
            n_events: 10,
            nll: None,
            dataset_path: None,
        }
    }

    fn config(min: usize) -> AnalysisConfig {
        AnalysisConfig { min_succeeded: min, ..Default::default() }
    }

    #[test]
    fn test_bias_pull_and_coverage() {
        // Deltas -2..=2 around a generated value of 1, uncertainty 1.
        let records: Vec<_> =
            (0..5).map(|i| record(i, 1.0 + i as f64 - 2.0, 1.0, Some(1.0), FitStatus::Converged)).collect();
        let agg = AggregateDataset::from_sorted("b", 5, records);
        let report = analyze(&agg, &config(5)).unwrap();
        let mu = &report.parameters["mu"];
        assert_eq!(mu.n, 5);
        assert_relative_eq!(mu.mean, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mu.bias, 0.0, epsilon = 1e-12);
        assert_relative_eq!(mu.std_dev, 2.5f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(mu.pull_mean, 0.0, epsilon = 1e-12);
        assert_relative_eq!(mu.pull_width, 2.5f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(mu.coverage, 0.6, epsilon = 1e-12);
        assert_eq!(mu.intervals[0].sigma, 1);
        assert_relative_eq!(mu.intervals[0].low, -2.0 + 4.0 * 0.15865, epsilon = 1e-9);
        assert_relative_eq!(mu.intervals[2].high, -2.0 + 4.0 * 0.9987, epsilon = 1e-9);
        assert!(!report.reduced_sample);
    }

    #[test]
    fn test_configured_reference_is_fallback() {
        let records = vec![
            record(0, 2.0, 0.5, None, FitStatus::Converged),
            record(1, 3.0, 0.5, Some(2.0), FitStatus::Converged),
        ];
        let agg = AggregateDataset::from_sorted("b", 2, records);
        let mut cfg = config(1);
        cfg.reference.insert("mu".into(), 1.0);
        let mu = &analyze(&agg, &cfg).unwrap().parameters["mu"];
        assert_eq!(mu.n_with_reference, 2);
        assert_relative_eq!(mu.bias, 1.0, epsilon = 1e-12);
        assert_relative_eq!(mu.pull_mean, 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_converged_excluded_unless_configured() {
        let records = vec![
            record(0, 1.0, 0.1, Some(1.0), FitStatus::Converged),
            record(1, 9.0, 0.1, Some(1.0), FitStatus::NotConverged),
        ];
        let agg = AggregateDataset::from_sorted("b", 3, records);
        let report = analyze(&agg, &config(1)).unwrap();
        assert_eq!(report.n_used, 1);
        assert!(report.reduced_sample);
        assert_relative_eq!(report.effective_fraction, 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(report.fit_status_counts[&FitStatus::NotConverged], 1);
        assert_relative_eq!(report.parameters["mu"].mean, 1.0);

        let mut cfg = config(1);
        cfg.include_non_converged = true;
        assert_eq!(analyze(&agg, &cfg).unwrap().n_used, 2);
    }

    #[test]
    fn test_insufficient_data() {
        let agg = AggregateDataset::from_sorted("b", 4, vec![record(0, 1.0, 0.1, None, FitStatus::Converged)]);
        match analyze(&agg, &config(2)) {
            Err(Error::InsufficientData { batch_id, succeeded, requested, required }) => {
                assert_eq!((batch_id.as_str(), succeeded, requested, required), ("b", 1, 4, 2));
            }
            other => panic!("expected insufficient data, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let agg = AggregateDataset::from_sorted("b", 1, vec![record(0, 1.0, 0.1, None, FitStatus::Converged)]);
        let mut cfg = config(1);
        cfg.parameters = vec!["sigma".into()];
        assert!(matches!(analyze(&agg, &cfg), Err(Error::Validation(_))));
    }
}
