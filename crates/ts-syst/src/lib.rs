//! # ts-syst
//!
//! Systematics analyzer: turns a merged [`ts_core::AggregateDataset`] into
//! per-parameter bias, spread, pull and coverage figures.
//!
//! The analyzer never sees the tracker. Everything it needs (how many toys
//! were requested, which ones are missing) is carried by the aggregate, and a
//! batch with abandoned toys is analyzed but flagged.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Per-parameter summaries and the analysis report.
pub mod analyzer;
/// Analyzer settings.
pub mod config;
/// Sample statistics.
pub mod stats;

pub use analyzer::{AnalysisReport, CentralInterval, ParameterSummary, analyze, count_by_status};
pub use config::AnalysisConfig;
