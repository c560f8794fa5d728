//! # Treatment benefit
//!
//! Counterfactual survival under every catalog arm, covariate matching of
//! patients observed under two arms, and the pair-level statistics built on
//! top: C-for-benefit and calibration-for-benefit.
//!
//! Sparse data never raises here. Empty cohorts give empty pair sets and
//! statistics over nothing are NaN, so a report over many arms can still
//! return partial results.

pub mod calibration;
pub mod cfb;
pub mod counterfactual;
pub mod matching;
pub mod neighbours;
pub mod report;

use crate::catalog::CatalogError;
use crate::linalg::LinalgError;
use crate::survival::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenefitError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("covariance inversion failed: {0}")]
    Linalg(#[from] LinalgError),
    #[error("expected {expected} {what}, got {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("matching column {column} is outside the {width} feature columns")]
    ColumnOutOfRange { column: usize, width: usize },
}
