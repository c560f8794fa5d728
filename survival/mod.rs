//! # Survival models
//!
//! Five survival parameterizations share one network and one training loop;
//! the [`variant`] table decides how targets are discretized, which loss is
//! optimized and how outputs become survival curves. Every model implements
//! [`SurvivalModel`], the contract the benefit engine and the evaluation code
//! rely on.

pub mod breslow;
pub mod curve;
pub mod discretize;
pub mod linear_cox;
pub mod loss;
pub mod multitask;
pub mod neural;
pub mod single_task;
pub mod variant;

use crate::config::ConfigError;
use crate::data::{DataError, SurvivalTargets};
use crate::net::NetError;
use curve::{CurveError, SurvivalCurves};
use discretize::TimeGrid;
use ndarray::{Array1, ArrayView2};
use thiserror::Error;
use variant::SurvivalVariant;

pub use linear_cox::LinearCoxModel;
pub use multitask::MultiTaskSurvivalModel;
pub use single_task::SingleTaskSurvivalModel;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid model configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Curve(#[from] CurveError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("a multi-task model needs a task index for every row")]
    MissingTaskIndices,
    #[error("the model must be fitted before it can predict")]
    NotFitted,
    #[error("expected {expected} {what}, got {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("cannot fit a survival model on zero samples")]
    EmptyTrainingSet,
    #[error("the {0} loss cannot be computed from these targets")]
    TargetMismatch(SurvivalVariant),
    #[error("optimization failed: {0}")]
    Optimization(String),
    #[error("training loss became non-finite at epoch {epoch}")]
    NonFiniteLoss { epoch: usize },
}

/// Held-out data used for early stopping.
#[derive(Debug, Clone, Copy)]
pub struct ValidationSet<'a> {
    pub x: ArrayView2<'a, f64>,
    pub tasks: Option<&'a [usize]>,
    pub targets: &'a SurvivalTargets,
}

/// Stable contract shared by every survival model.
///
/// Single-task models accept and ignore task indices; multi-task models
/// reject predictions without them.
pub trait SurvivalModel: Send + Sync {
    fn is_multi_task(&self) -> bool;

    fn fit(
        &mut self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
        targets: &SurvivalTargets,
        validation: Option<ValidationSet<'_>>,
    ) -> Result<(), ModelError>;

    /// Survival curves on `times`, or on the model's own grid when `None`.
    fn predict_survival_function(
        &self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
        times: Option<&[f64]>,
    ) -> Result<SurvivalCurves, ModelError>;

    /// Risk scores; larger means earlier expected events.
    fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
    ) -> Result<Array1<f64>, ModelError>;

    fn time_grid(&self) -> Option<&TimeGrid>;
}
