//! # Evaluation
//!
//! Call sites of the standard survival metrics (which time grid, which
//! censoring weights), the merged metric report, and cross-validated
//! training of configured models.

pub mod cross_validation;
pub mod metrics;
pub mod report;

pub use cross_validation::{ModelTemplate, ModelTrainer, stratified_folds, train_test_split};
pub use report::{MetricReport, evaluate_all_metrics};

use crate::benefit::BenefitError;
use crate::config::ConfigError;
use crate::data::DataError;
use crate::survival::ModelError;
use ndarray::ArrayView1;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Benefit(#[from] BenefitError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("cannot evaluate on an empty table")]
    EmptyTable,
    #[error("need at least {needed} samples for {splits} folds, got {found}")]
    TooFewSamples {
        needed: usize,
        splits: usize,
        found: usize,
    },
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(String),
    #[error("fold {fold} of model '{model}' failed: {source}")]
    Fold {
        model: String,
        fold: usize,
        #[source]
        source: Box<EvaluationError>,
    },
}

/// Evaluation times from `fixed_points` lying strictly inside the observed
/// follow-up and below `max_time`.
///
/// When none qualify, the single point `min(upper, last fixed point)` is used.
pub fn evaluation_time_grid(durations: ArrayView1<'_, f64>, max_time: f64, fixed_points: &[f64]) -> Vec<f64> {
    let Some(&last) = fixed_points.last() else {
        return Vec::new();
    };
    let lower = durations.iter().copied().fold(f64::INFINITY, f64::min);
    let upper = max_time.min(durations.iter().copied().fold(f64::NEG_INFINITY, f64::max));
    let inside: Vec<f64> = fixed_points
        .iter()
        .copied()
        .filter(|&t| t > lower && t < upper)
        .collect();
    if inside.is_empty() {
        vec![upper.min(last)]
    } else {
        inside
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn grid_keeps_points_strictly_inside_follow_up() {
        let durations = array![100.0, 400.0, 900.0];
        let points = [91.0, 100.0, 183.0, 365.0, 730.0, 900.0, 1095.0];
        assert_eq!(
            evaluation_time_grid(durations.view(), 1825.0, &points),
            vec![183.0, 365.0, 730.0]
        );
        assert_eq!(
            evaluation_time_grid(durations.view(), 500.0, &points),
            vec![183.0, 365.0]
        );
    }

    #[test]
    fn grid_falls_back_to_a_single_point() {
        let durations = array![100.0, 120.0];
        assert_eq!(
            evaluation_time_grid(durations.view(), 1825.0, &[91.0, 183.0]),
            vec![120.0]
        );
        assert_eq!(
            evaluation_time_grid(array![10.0, 2000.0].view(), 1825.0, &[5.0]),
            vec![5.0]
        );
        assert!(evaluation_time_grid(durations.view(), 1825.0, &[]).is_empty());
    }
}
