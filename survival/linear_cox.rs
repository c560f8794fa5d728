//! Ridge-penalised linear proportional-hazards baseline.
//!
//! Features are standardised on the training set; near-constant columns and
//! columns highly correlated with an earlier column are dropped before the
//! partial likelihood is minimised with BFGS.

use super::breslow::BaselineHazard;
use super::curve::SurvivalCurves;
use super::discretize::TimeGrid;
use super::loss::cox_partial;
use super::{ModelError, SurvivalModel, ValidationSet};
use crate::config::{ConfigError, LinearCoxConfig};
use crate::data::SurvivalTargets;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Debug, Clone)]
struct FittedCox {
    columns: Vec<usize>,
    means: Array1<f64>,
    scales: Array1<f64>,
    coefficients: Array1<f64>,
    baseline: BaselineHazard,
    input_width: usize,
}

impl FittedCox {
    fn design(&self, x: ArrayView2<'_, f64>) -> Result<Array2<f64>, ModelError> {
        if x.ncols() != self.input_width {
            return Err(ModelError::ShapeMismatch {
                what: "feature columns",
                expected: self.input_width,
                found: x.ncols(),
            });
        }
        let mut z = x.select(Axis(1), &self.columns);
        z -= &self.means;
        z /= &self.scales;
        Ok(z)
    }

    fn log_risk(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, ModelError> {
        Ok(self.design(x)?.dot(&self.coefficients))
    }
}

#[derive(Debug, Clone)]
pub struct LinearCoxModel {
    config: LinearCoxConfig,
    grid: TimeGrid,
    fitted: Option<FittedCox>,
}

impl LinearCoxModel {
    pub fn new(config: LinearCoxConfig, grid: TimeGrid) -> Result<Self, ModelError> {
        if !(config.penalizer >= 0.0 && config.penalizer.is_finite()) {
            return Err(ConfigError::NonPositive("penalizer").into());
        }
        if !(config.tolerance > 0.0) {
            return Err(ConfigError::NonPositive("tolerance").into());
        }
        if config.max_iterations == 0 {
            return Err(ConfigError::NonPositive("max_iterations").into());
        }
        Ok(Self {
            config,
            grid,
            fitted: None,
        })
    }

    /// Indices of the input columns the fitted model uses.
    pub fn selected_columns(&self) -> Option<&[usize]> {
        self.fitted.as_ref().map(|f| f.columns.as_slice())
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.fitted.as_ref().map(|f| &f.coefficients)
    }

    /// Keeps columns above the variance threshold that are not highly
    /// correlated with any earlier column.
    fn select_columns(&self, x: ArrayView2<'_, f64>) -> (Vec<usize>, Array1<f64>, Array1<f64>) {
        let n = x.nrows() as f64;
        let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let variances = x.var_axis(Axis(0), 0.0);
        let varying: Vec<usize> = (0..x.ncols())
            .filter(|&j| variances[j] >= self.config.variance_threshold)
            .collect();
        let dropped_low = x.ncols() - varying.len();

        let standardized: Vec<Array1<f64>> = varying
            .iter()
            .map(|&j| x.column(j).mapv(|v| (v - means[j]) / variances[j].sqrt()))
            .collect();
        let mut columns = Vec::with_capacity(varying.len());
        for (a, &j) in varying.iter().enumerate() {
            let correlated = (0..a).any(|b| {
                let corr = standardized[a].dot(&standardized[b]) / n;
                corr.abs() > self.config.correlation_threshold
            });
            if !correlated {
                columns.push(j);
            }
        }
        if dropped_low > 0 || columns.len() < varying.len() {
            log::debug!(
                "Linear Cox feature filter dropped {} low-variance and {} correlated columns",
                dropped_low,
                varying.len() - columns.len()
            );
        }
        let kept_means = columns.iter().map(|&j| means[j]).collect();
        let kept_scales = columns.iter().map(|&j| variances[j].sqrt()).collect();
        (columns, kept_means, kept_scales)
    }
}

impl SurvivalModel for LinearCoxModel {
    fn is_multi_task(&self) -> bool {
        false
    }

    fn fit(
        &mut self,
        x: ArrayView2<'_, f64>,
        _: Option<&[usize]>,
        targets: &SurvivalTargets,
        validation: Option<ValidationSet<'_>>,
    ) -> Result<(), ModelError> {
        if x.nrows() == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        if targets.len() != x.nrows() {
            return Err(ModelError::ShapeMismatch {
                what: "survival targets",
                expected: x.nrows(),
                found: targets.len(),
            });
        }
        if validation.is_some() {
            log::debug!("Linear Cox fitting ignores validation data");
        }

        let (columns, means, scales) = self.select_columns(x);
        let mut fitted = FittedCox {
            columns,
            means,
            scales,
            coefficients: Array1::zeros(0),
            baseline: BaselineHazard::default(),
            input_width: x.ncols(),
        };
        let z = fitted.design(x)?;
        let penalizer = self.config.penalizer;

        if z.ncols() > 0 {
            let design = z.clone();
            let follow_up = targets.clone();
            let cost_and_grad = move |beta: &Array1<f64>| -> (f64, Array1<f64>) {
                let eta = design.dot(beta);
                let (loss, grad_eta) = cox_partial(eta, &follow_up);
                let cost = loss + 0.5 * penalizer * beta.dot(beta);
                let grad = design.t().dot(&grad_eta) + &(beta * penalizer);
                (cost, grad)
            };
            let BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            } = Bfgs::new(Array1::zeros(z.ncols()), cost_and_grad)
                .with_tolerance(self.config.tolerance)
                .with_max_iterations(self.config.max_iterations)
                .run()
                .map_err(|e| ModelError::Optimization(format!("BFGS failed: {:?}", e)))?;
            log::info!(
                "Linear Cox converged in {} iterations (penalised loss {:.6}, {} coefficients)",
                iterations,
                final_value,
                final_point.len()
            );
            fitted.coefficients = final_point;
        } else {
            log::warn!("Linear Cox has no usable features; every patient gets the same risk");
        }

        let log_risk = z.dot(&fitted.coefficients);
        fitted.baseline =
            BaselineHazard::fit(log_risk.view(), targets.durations.view(), targets.events.view());
        self.fitted = Some(fitted);
        Ok(())
    }

    fn predict_survival_function(
        &self,
        x: ArrayView2<'_, f64>,
        _: Option<&[usize]>,
        times: Option<&[f64]>,
    ) -> Result<SurvivalCurves, ModelError> {
        let fitted = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        let log_risk = fitted.log_risk(x)?;
        let times = times.unwrap_or(self.grid.cuts());
        let mut values = Array2::<f64>::zeros((x.nrows(), times.len()));
        for (i, &eta) in log_risk.iter().enumerate() {
            for (j, &t) in times.iter().enumerate() {
                values[(i, j)] = (-fitted.baseline.at(t) * eta.exp()).exp();
            }
        }
        Ok(SurvivalCurves::new(times.to_vec(), values)?)
    }

    fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        _: Option<&[usize]>,
    ) -> Result<Array1<f64>, ModelError> {
        self.fitted
            .as_ref()
            .ok_or(ModelError::NotFitted)?
            .log_risk(x)
    }

    fn time_grid(&self) -> Option<&TimeGrid> {
        Some(&self.grid)
    }
}
