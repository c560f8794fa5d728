//! Mahalanobis nearest-neighbour matching of patients observed under two arms.

use super::BenefitError;
use crate::catalog::TreatmentCatalog;
use crate::data::PatientTable;
use crate::linalg::pseudo_inverse_symmetric;
use ahash::AHashSet;
use dashmap::DashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Ridge added to the pooled covariance before inversion.
const COVARIANCE_RIDGE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// Every B patient takes its nearest A patient; an A may serve many Bs.
    #[default]
    ManyToOne,
    /// B patients are matched in row order and each A is used at most once.
    OneToOne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    /// Row in the input table of the patient observed under arm A.
    pub a_row: usize,
    pub b_row: usize,
    pub a_id: String,
    pub b_id: String,
    pub distance: f64,
}

/// Identifies one matching problem: same patients, arms and covariates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub patient_ids: Vec<String>,
    pub treat_a: usize,
    pub treat_b: usize,
    pub feature_cols: Vec<usize>,
}

/// Builds matched pairs and memoises them per [`PairKey`].
///
/// The cache is shared across threads; concurrent builders of the same key
/// may both compute, and the first insert wins.
#[derive(Debug, Default)]
pub struct CovariateMatcher {
    mode: MatchingMode,
    cache: DashMap<PairKey, Arc<Vec<MatchedPair>>, ahash::RandomState>,
}

impl CovariateMatcher {
    pub fn new(mode: MatchingMode) -> Self {
        Self {
            mode,
            cache: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn mode(&self) -> MatchingMode {
        self.mode
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Pairs each patient observed under `treat_b` with the closest patient
    /// observed under `treat_a`, on the covariates in `feature_cols`.
    pub fn build_pairs(
        &self,
        table: &PatientTable,
        catalog: &TreatmentCatalog,
        treat_a: &str,
        treat_b: &str,
        feature_cols: &[usize],
    ) -> Result<Arc<Vec<MatchedPair>>, BenefitError> {
        let (index_a, _) = catalog.require(treat_a)?;
        let (index_b, _) = catalog.require(treat_b)?;
        let width = table.n_features();
        if let Some(&column) = feature_cols.iter().find(|&&c| c >= width) {
            return Err(BenefitError::ColumnOutOfRange { column, width });
        }

        let key = PairKey {
            patient_ids: table.ids.clone(),
            treat_a: index_a,
            treat_b: index_b,
            feature_cols: feature_cols.to_vec(),
        };
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }

        let pairs = Arc::new(self.compute_pairs(table, index_a, index_b, feature_cols)?);
        log::debug!(
            "Matched {} pairs for '{}' vs '{}'",
            pairs.len(),
            treat_a,
            treat_b
        );
        let entry = self.cache.entry(key).or_insert(pairs);
        Ok(Arc::clone(entry.value()))
    }

    fn compute_pairs(
        &self,
        table: &PatientTable,
        index_a: usize,
        index_b: usize,
        feature_cols: &[usize],
    ) -> Result<Vec<MatchedPair>, BenefitError> {
        let rows_a: Vec<usize> = cohort(&table.task_indices, index_a);
        let rows_b: Vec<usize> = cohort(&table.task_indices, index_b);
        if rows_a.is_empty() || rows_b.is_empty() {
            return Ok(Vec::new());
        }

        let pooled_rows: Vec<usize> = rows_a.iter().chain(&rows_b).copied().collect();
        let pooled = table
            .features
            .select(Axis(0), &pooled_rows)
            .select(Axis(1), feature_cols);
        let z = standardize(pooled);
        let precision = pseudo_inverse_symmetric(&covariance_with_ridge(&z))?;

        let (za, zb) = z.view().split_at(Axis(0), rows_a.len());
        let distances: Vec<Vec<f64>> = zb
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|b| {
                za.axis_iter(Axis(0))
                    .map(|a| mahalanobis(b, a, &precision))
                    .collect()
            })
            .collect();

        let mut used = AHashSet::new();
        let mut pairs = Vec::with_capacity(rows_b.len());
        for (j, row) in distances.iter().enumerate() {
            let mut best: Option<(usize, f64)> = None;
            for (i, &d) in row.iter().enumerate() {
                if self.mode == MatchingMode::OneToOne && used.contains(&i) {
                    continue;
                }
                // Strict comparison keeps the lowest index on ties.
                if best.is_none_or(|(_, current)| d < current) {
                    best = Some((i, d));
                }
            }
            let Some((i, distance)) = best else {
                break;
            };
            if self.mode == MatchingMode::OneToOne {
                used.insert(i);
            }
            let (a_row, b_row) = (rows_a[i], rows_b[j]);
            pairs.push(MatchedPair {
                a_row,
                b_row,
                a_id: table.ids[a_row].clone(),
                b_id: table.ids[b_row].clone(),
                distance,
            });
        }
        Ok(pairs)
    }
}

fn cohort(task_indices: &[usize], arm: usize) -> Vec<usize> {
    task_indices
        .iter()
        .enumerate()
        .filter_map(|(row, &task)| (task == arm).then_some(row))
        .collect()
}

/// Column means and scales fitted on a reference set.
///
/// Scales are population standard deviations; constant columns keep scale 1
/// and are only centred.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ZScore {
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl ZScore {
    pub(crate) fn fit(x: ArrayView2<'_, f64>) -> Self {
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scales = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std > 0.0 { std } else { 1.0 });
        Self { means, scales }
    }

    pub(crate) fn transform(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        (&x - &self.means) / &self.scales
    }

    pub(crate) fn transform_row(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        (&x - &self.means) / &self.scales
    }
}

fn standardize(x: Array2<f64>) -> Array2<f64> {
    ZScore::fit(x.view()).transform(x.view())
}

fn covariance_with_ridge(z: &Array2<f64>) -> Array2<f64> {
    let n = z.nrows();
    let dof = n.saturating_sub(1).max(1) as f64;
    let means = z
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(z.ncols()));
    let centred = z - &means;
    let mut cov = centred.t().dot(&centred) / dof;
    cov.diag_mut().mapv_inplace(|v| v + COVARIANCE_RIDGE);
    cov
}

fn mahalanobis(u: ArrayView1<'_, f64>, v: ArrayView1<'_, f64>, precision: &Array2<f64>) -> f64 {
    let diff = &u - &v;
    diff.dot(&precision.dot(&diff)).max(0.0).sqrt()
}
