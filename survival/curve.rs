//! Typed survival predictions.
//!
//! Every model returns [`SurvivalCurves`]: a shared, strictly increasing time
//! axis and one row of survival probabilities per sample. Queries between grid
//! points use an explicit [`Interpolation`] policy; queries outside the grid
//! hold the edge value (no extrapolation).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CurveError {
    #[error("a raw survival array needs a time grid, but none was supplied")]
    MissingTimeGrid,
    #[error("survival array has {found} columns but the time grid has {expected} points")]
    GridMismatch { expected: usize, found: usize },
    #[error("survival time points must be finite and strictly increasing")]
    InvalidTimes,
    #[error("survival curves need at least one time point")]
    EmptyGrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Value at the closest grid point (earlier point on exact ties).
    Nearest,
    /// Piecewise-linear between neighbouring grid points.
    Linear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalCurves {
    times: Vec<f64>,
    values: Array2<f64>,
}

impl SurvivalCurves {
    pub fn new(times: Vec<f64>, values: Array2<f64>) -> Result<Self, CurveError> {
        if times.is_empty() {
            return Err(CurveError::EmptyGrid);
        }
        if times.iter().any(|t| !t.is_finite()) || times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(CurveError::InvalidTimes);
        }
        if values.ncols() != times.len() {
            return Err(CurveError::GridMismatch {
                expected: times.len(),
                found: values.ncols(),
            });
        }
        Ok(Self { times, values })
    }

    /// Wraps a bare `[n, T]` array, taking its time axis from `grid`.
    pub fn from_raw(values: Array2<f64>, grid: Option<&[f64]>) -> Result<Self, CurveError> {
        let grid = grid.ok_or(CurveError::MissingTimeGrid)?;
        Self::new(grid.to_vec(), values)
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    pub fn curve(&self, sample: usize) -> ArrayView1<'_, f64> {
        self.values.row(sample)
    }

    /// Survival of every sample at time `t`.
    pub fn at(&self, t: f64, policy: Interpolation) -> Array1<f64> {
        self.values
            .axis_iter(Axis(0))
            .map(|row| interpolate(&self.times, row, t, policy))
            .collect()
    }

    /// Survival at the last grid point.
    pub fn last(&self) -> Array1<f64> {
        self.values.column(self.times.len() - 1).to_owned()
    }

    /// The same curves evaluated on another time grid.
    pub fn resample(&self, grid: &[f64], policy: Interpolation) -> Result<Self, CurveError> {
        let mut values = Array2::<f64>::zeros((self.n_samples(), grid.len()));
        for (i, row) in self.values.axis_iter(Axis(0)).enumerate() {
            for (j, &t) in grid.iter().enumerate() {
                values[(i, j)] = interpolate(&self.times, row, t, policy);
            }
        }
        Self::new(grid.to_vec(), values)
    }
}

/// Evaluates one curve at `t`, holding edge values outside `[times[0], times[last]]`.
pub fn interpolate(times: &[f64], values: ArrayView1<'_, f64>, t: f64, policy: Interpolation) -> f64 {
    let n = times.len();
    if n == 0 || t.is_nan() {
        return f64::NAN;
    }
    if t <= times[0] {
        return values[0];
    }
    if t >= times[n - 1] {
        return values[n - 1];
    }
    // First index with times[hi] > t; t lies in [times[hi - 1], times[hi]).
    let hi = times.partition_point(|&x| x <= t);
    let lo = hi - 1;
    match policy {
        Interpolation::Nearest => {
            if t - times[lo] <= times[hi] - t {
                values[lo]
            } else {
                values[hi]
            }
        }
        Interpolation::Linear => {
            let w = (t - times[lo]) / (times[hi] - times[lo]);
            values[lo] + w * (values[hi] - values[lo])
        }
    }
}
