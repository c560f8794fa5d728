//! Calibration for benefit: binned predicted vs observed pair benefit.

use itertools::Itertools;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

/// Spreads below this are treated as a constant predictor.
const MIN_SPREAD: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinningStrategy {
    /// Equal-count bins; coinciding quantiles collapse into one edge.
    #[default]
    Quantile,
    /// Equal-width bins over `[min, max]`.
    Uniform,
}

impl BinningStrategy {
    pub fn edges(self, values: &[f64], n_bins: usize) -> Vec<f64> {
        match self {
            Self::Quantile => quantile_edges(values, n_bins),
            Self::Uniform => uniform_edges(values, n_bins),
        }
    }
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Linearly interpolated quantile edges with duplicates dropped.
pub fn quantile_edges(values: &[f64], n_bins: usize) -> Vec<f64> {
    if values.is_empty() || n_bins == 0 {
        return Vec::new();
    }
    let sorted: Vec<f64> = values.iter().copied().sorted_by(f64::total_cmp).collect();
    (0..=n_bins)
        .map(|k| quantile(&sorted, k as f64 / n_bins as f64))
        .dedup()
        .collect()
}

/// Equal-width edges with the lowest edge pushed 0.1% of the range to the left.
/// A constant input is widened by 0.1% on both sides.
pub fn uniform_edges(values: &[f64], n_bins: usize) -> Vec<f64> {
    if values.is_empty() || n_bins == 0 {
        return Vec::new();
    }
    let (mut lo, mut hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let widened = (hi - lo).abs() < f64::EPSILON;
    if widened {
        lo -= if lo != 0.0 { 0.001 * lo.abs() } else { 0.001 };
        hi += if hi != 0.0 { 0.001 * hi.abs() } else { 0.001 };
    }
    let step = (hi - lo) / n_bins as f64;
    let mut edges: Vec<f64> = (0..=n_bins).map(|k| lo + step * k as f64).collect();
    edges[n_bins] = hi;
    if !widened {
        edges[0] -= 0.001 * (hi - lo);
    }
    edges
}

/// Right-closed bin of `v`; the lowest edge belongs to the first bin.
/// Values outside the edges are `None`.
pub fn bin_index(edges: &[f64], v: f64) -> Option<usize> {
    let (&first, &last) = (edges.first()?, edges.last()?);
    if !(first..=last).contains(&v) {
        return None;
    }
    if edges.len() == 1 {
        return Some(0);
    }
    let position = edges.partition_point(|&e| e < v);
    Some(position.max(1).min(edges.len() - 1) - 1)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    /// NaN for an empty bin.
    pub mean_predicted: f64,
    pub mean_observed: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub bins: Vec<CalibrationBin>,
    pub slope: f64,
    pub intercept: f64,
    pub ece: f64,
    pub n_pairs: usize,
}

impl CalibrationResult {
    fn empty() -> Self {
        Self {
            bins: Vec::new(),
            slope: f64::NAN,
            intercept: f64::NAN,
            ece: f64::NAN,
            n_pairs: 0,
        }
    }
}

/// Weighted least squares of `y` on `x`, returning `(slope, intercept)`.
///
/// Points with a non-finite coordinate or non-positive weight are ignored.
/// Fewer than two points or no spread in `x` gives slope 0 and the weighted
/// mean of `y` as intercept.
pub fn weighted_linear_regression(y: &[f64], x: &[f64], w: &[f64]) -> (f64, f64) {
    let points: Vec<(f64, f64, f64)> = y
        .iter()
        .zip(x)
        .zip(w)
        .filter(|((y, x), w)| y.is_finite() && x.is_finite() && **w > 0.0)
        .map(|((&y, &x), &w)| (x, y, w))
        .collect();
    let total: f64 = points.iter().map(|p| p.2).sum();
    if total <= 0.0 {
        return (0.0, f64::NAN);
    }
    let x_bar = points.iter().map(|&(x, _, w)| w * x).sum::<f64>() / total;
    let y_bar = points.iter().map(|&(_, y, w)| w * y).sum::<f64>() / total;
    if points.len() < 2 {
        return (0.0, y_bar);
    }
    let sxx: f64 = points.iter().map(|&(x, _, w)| w * (x - x_bar).powi(2)).sum();
    if sxx < MIN_SPREAD {
        return (0.0, y_bar);
    }
    let sxy: f64 = points
        .iter()
        .map(|&(x, y, w)| w * (x - x_bar) * (y - y_bar))
        .sum();
    let slope = sxy / sxx;
    (slope, y_bar - slope * x_bar)
}

/// Bins pairs by predicted benefit and compares bin means.
///
/// Pairs with a non-finite prediction or observation are dropped. Empty bins
/// stay in `bins` with NaN means and are left out of the regression and ECE.
pub fn calibrate_benefit(
    predicted: ArrayView1<'_, f64>,
    observed: ArrayView1<'_, f64>,
    n_bins: usize,
    strategy: BinningStrategy,
) -> CalibrationResult {
    let (pred, obs): (Vec<f64>, Vec<f64>) = predicted
        .iter()
        .zip(observed.iter())
        .filter(|(p, o)| p.is_finite() && o.is_finite())
        .map(|(&p, &o)| (p, o))
        .unzip();
    if pred.is_empty() {
        return CalibrationResult::empty();
    }

    let edges = strategy.edges(&pred, n_bins.max(1));
    let n_slots = edges.len().saturating_sub(1).max(1);
    let mut counts = vec![0usize; n_slots];
    let mut sum_pred = vec![0.0; n_slots];
    let mut sum_obs = vec![0.0; n_slots];
    for (&p, &o) in pred.iter().zip(&obs) {
        if let Some(k) = bin_index(&edges, p) {
            counts[k] += 1;
            sum_pred[k] += p;
            sum_obs[k] += o;
        }
    }

    let bins: Vec<CalibrationBin> = (0..n_slots)
        .map(|k| {
            let mean = |sum: f64| {
                if counts[k] > 0 {
                    sum / counts[k] as f64
                } else {
                    f64::NAN
                }
            };
            CalibrationBin {
                lower: edges[k],
                upper: edges[(k + 1).min(edges.len() - 1)],
                count: counts[k],
                mean_predicted: mean(sum_pred[k]),
                mean_observed: mean(sum_obs[k]),
            }
        })
        .collect();

    let filled: Vec<&CalibrationBin> = bins.iter().filter(|b| b.count > 0).collect();
    let x: Vec<f64> = filled.iter().map(|b| b.mean_predicted).collect();
    let y: Vec<f64> = filled.iter().map(|b| b.mean_observed).collect();
    let w: Vec<f64> = filled.iter().map(|b| b.count as f64).collect();
    let (slope, intercept) = weighted_linear_regression(&y, &x, &w);
    let total: f64 = w.iter().sum();
    let ece = filled
        .iter()
        .map(|b| b.count as f64 / total * (b.mean_observed - b.mean_predicted).abs())
        .sum();

    CalibrationResult {
        bins,
        slope,
        intercept,
        ece,
        n_pairs: pred.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn quantile_edges_collapse_duplicates() {
        let values = [0.0, 0.0, 0.0, 0.0, 1.0];
        assert_eq!(quantile_edges(&values, 4), vec![0.0, 1.0]);
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile_edges(&values, 4), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn uniform_edges_extend_the_lowest_edge() {
        let edges = uniform_edges(&[0.0, 1.0, 0.5], 2);
        assert_abs_diff_eq!(edges[0], -0.001, epsilon = 1e-12);
        assert_abs_diff_eq!(edges[1], 0.5, epsilon = 1e-12);
        assert_eq!(edges[2], 1.0);
        let constant = uniform_edges(&[2.0, 2.0], 1);
        assert!(constant[0] < 2.0 && constant[1] > 2.0);
    }

    #[test]
    fn bins_are_right_closed_with_the_lowest_edge_included() {
        let edges = [0.0, 1.0, 2.0];
        assert_eq!(bin_index(&edges, 0.0), Some(0));
        assert_eq!(bin_index(&edges, 1.0), Some(0));
        assert_eq!(bin_index(&edges, 1.5), Some(1));
        assert_eq!(bin_index(&edges, 2.0), Some(1));
        assert_eq!(bin_index(&edges, 2.5), None);
        assert_eq!(bin_index(&[3.0], 3.0), Some(0));
    }

    #[test]
    fn every_pair_lands_in_exactly_one_bin() {
        let predicted = Array1::from_shape_fn(37, |i| ((i * 13) % 17) as f64 / 17.0 - 0.3);
        let observed = Array1::from_shape_fn(37, |i| f64::from((i % 3) as u8) - 1.0);
        for strategy in [BinningStrategy::Quantile, BinningStrategy::Uniform] {
            let result = calibrate_benefit(predicted.view(), observed.view(), 5, strategy);
            let counted: usize = result.bins.iter().map(|b| b.count).sum();
            assert_eq!(counted, 37);
            assert_eq!(result.n_pairs, 37);
            assert!(result.ece.is_finite());
        }
    }

    #[test]
    fn perfectly_calibrated_bins_have_unit_slope() {
        let predicted = array![-0.5, -0.5, 0.0, 0.0, 0.5, 0.5];
        let observed = predicted.clone();
        let result = calibrate_benefit(predicted.view(), observed.view(), 3, BinningStrategy::Uniform);
        assert_abs_diff_eq!(result.slope, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.intercept, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(result.ece, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_regression_falls_back_to_the_weighted_mean() {
        assert_eq!(weighted_linear_regression(&[1.0, 3.0], &[0.2, 0.2], &[1.0, 3.0]), (0.0, 2.5));
        assert_eq!(weighted_linear_regression(&[4.0], &[0.1], &[2.0]), (0.0, 4.0));
        let (slope, intercept) = weighted_linear_regression(&[1.0, 3.0], &[0.0, 1.0], &[1.0, 1.0]);
        assert_abs_diff_eq!(slope, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(intercept, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_input_gives_nan_statistics() {
        let nan = array![f64::NAN, f64::NAN];
        let result = calibrate_benefit(nan.view(), array![1.0, 0.0].view(), 4, BinningStrategy::Quantile);
        assert!(result.bins.is_empty());
        assert!(result.slope.is_nan() && result.intercept.is_nan() && result.ece.is_nan());
    }

    #[test]
    fn empty_bins_stay_on_the_curve() {
        let predicted = array![0.0, 0.05, 1.0];
        let observed = array![0.0, 0.0, 1.0];
        let result = calibrate_benefit(predicted.view(), observed.view(), 4, BinningStrategy::Uniform);
        assert_eq!(result.bins.len(), 4);
        assert!(result.bins.iter().any(|b| b.count == 0 && b.mean_predicted.is_nan()));
        assert!(result.slope.is_finite());
    }
}
