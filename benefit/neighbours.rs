//! Patients like me: the treatments received by the most similar patients in
//! a cohort, next to the cohort-wide treatment mix.
//!
//! Similarity is Euclidean distance on baseline covariates z-scored against
//! the cohort. Treatment columns never take part in the distance.

use super::BenefitError;
use super::matching::ZScore;
use crate::catalog::TreatmentCatalog;
use crate::data::PatientTable;
use ndarray::{ArrayView1, Axis};
use rayon::prelude::*;
use serde::Serialize;

pub const DEFAULT_NEIGHBOURS: usize = 25;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbour {
    pub row: usize,
    pub id: String,
    pub distance: f64,
}

/// Share of one treatment arm in the cohort and among the neighbours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreatmentShare {
    pub label: String,
    pub overall_count: usize,
    pub overall_fraction: f64,
    pub neighbour_count: usize,
    pub neighbour_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeighbourReport {
    /// Nearest first; equal distances keep row order.
    pub neighbours: Vec<Neighbour>,
    /// One entry per catalog arm, in catalog order; absent arms count zero.
    pub shares: Vec<TreatmentShare>,
}

impl NeighbourReport {
    pub fn share(&self, label: &str) -> Option<&TreatmentShare> {
        self.shares.iter().find(|s| s.label == label)
    }
}

#[derive(Debug, Clone)]
pub struct PatientsLikeMe<'a> {
    catalog: &'a TreatmentCatalog,
    k: usize,
}

impl<'a> PatientsLikeMe<'a> {
    pub fn new(catalog: &'a TreatmentCatalog, k: usize) -> Self {
        Self { catalog, k }
    }

    /// Neighbours of a patient described by a full feature row of `table`'s width.
    pub fn find(
        &self,
        table: &PatientTable,
        query: ArrayView1<'_, f64>,
    ) -> Result<NeighbourReport, BenefitError> {
        self.search(table, query, None)
    }

    /// Neighbours of a cohort member; the patient itself is not its own neighbour.
    pub fn find_for_row(
        &self,
        table: &PatientTable,
        row: usize,
    ) -> Result<NeighbourReport, BenefitError> {
        if row >= table.n_samples() {
            return Err(BenefitError::ShapeMismatch {
                what: "patient rows",
                expected: row + 1,
                found: table.n_samples(),
            });
        }
        self.search(table, table.features.row(row), Some(row))
    }

    fn search(
        &self,
        table: &PatientTable,
        query: ArrayView1<'_, f64>,
        exclude: Option<usize>,
    ) -> Result<NeighbourReport, BenefitError> {
        if query.len() != table.n_features() {
            return Err(BenefitError::ShapeMismatch {
                what: "query features",
                expected: table.n_features(),
                found: query.len(),
            });
        }
        let columns = table.feature_layout().matching_columns();
        let covariates = table.features.select(Axis(1), &columns);
        let scaler = ZScore::fit(covariates.view());
        let cohort = scaler.transform(covariates.view());
        let target = scaler.transform_row(query.select(Axis(0), &columns).view());

        let mut candidates: Vec<(usize, f64)> = cohort
            .axis_iter(Axis(0))
            .into_par_iter()
            .enumerate()
            .filter(|(row, _)| Some(*row) != exclude)
            .map(|(row, z)| {
                let distance = (&z - &target).mapv(|d| d * d).sum().sqrt();
                (row, distance)
            })
            .collect();
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        candidates.truncate(self.k);

        let neighbours: Vec<Neighbour> = candidates
            .into_iter()
            .map(|(row, distance)| Neighbour {
                row,
                id: table.ids[row].clone(),
                distance,
            })
            .collect();
        log::debug!(
            "Found {} of {} requested neighbours among {} patients",
            neighbours.len(),
            self.k,
            table.n_samples()
        );

        let overall = self.counts(table.task_indices.iter().copied());
        let near = self.counts(neighbours.iter().map(|n| table.task_indices[n.row]));
        let fraction = |count: usize, total: usize| {
            if total == 0 { 0.0 } else { count as f64 / total as f64 }
        };
        let shares = self
            .catalog
            .labels()
            .enumerate()
            .map(|(arm, label)| TreatmentShare {
                label: label.to_string(),
                overall_count: overall[arm],
                overall_fraction: fraction(overall[arm], table.n_samples()),
                neighbour_count: near[arm],
                neighbour_fraction: fraction(near[arm], neighbours.len()),
            })
            .collect();
        Ok(NeighbourReport { neighbours, shares })
    }

    fn counts(&self, tasks: impl Iterator<Item = usize>) -> Vec<usize> {
        let mut counts = vec![0; self.catalog.len()];
        for task in tasks {
            if let Some(slot) = counts.get_mut(task) {
                *slot += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::REFERENCE_ARM;
    use crate::data::SurvivalTargets;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2, array};

    /// One covariate column; rows whose age is above 60 received 5-FU.
    fn table(ages: &[f64]) -> PatientTable {
        let n = ages.len();
        let mut features = Array2::<f64>::zeros((n, 3));
        let mut tasks = Vec::new();
        for (i, &age) in ages.iter().enumerate() {
            let treated = age > 60.0;
            features[(i, 0)] = age;
            features[(i, 1)] = f64::from(u8::from(treated));
            features[(i, 2)] = f64::from(u8::from(treated));
            tasks.push(usize::from(treated));
        }
        let names = ["age", "systemicTreatmentPlan_5-FU", "hasTreatment"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        PatientTable::new(
            (0..n).map(|i| format!("p{i}")).collect(),
            names,
            features,
            SurvivalTargets::new(Array1::from_elem(n, 100.0), Array1::ones(n)).unwrap(),
            tasks,
            &TreatmentCatalog::standard(),
        )
        .unwrap()
    }

    fn cohort() -> PatientTable {
        table(&[40.0, 41.0, 42.0, 43.0, 44.0, 75.0, 76.0, 77.0, 78.0, 79.0])
    }

    #[test]
    fn neighbour_mix_differs_from_the_cohort_mix() {
        let table = cohort();
        let catalog = TreatmentCatalog::standard();
        // Treatment columns of the query are ignored.
        let report = PatientsLikeMe::new(&catalog, 3)
            .find(&table, array![41.4, 1.0, 1.0].view())
            .unwrap();
        let rows: Vec<usize> = report.neighbours.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![1, 2, 0]);

        let untreated = report.share(REFERENCE_ARM).unwrap();
        assert_eq!((untreated.overall_count, untreated.neighbour_count), (5, 3));
        assert_abs_diff_eq!(untreated.overall_fraction, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(untreated.neighbour_fraction, 1.0, epsilon = 1e-12);
        let treated = report.share("5-FU").unwrap();
        assert_eq!(treated.neighbour_count, 0);
        assert_eq!(treated.neighbour_fraction, 0.0);
        assert_eq!(report.shares.len(), catalog.len());
        assert_eq!(report.share("PEMBROLIZUMAB").unwrap().overall_fraction, 0.0);
    }

    #[test]
    fn k_larger_than_the_cohort_returns_everyone_else() {
        let table = cohort();
        let catalog = TreatmentCatalog::standard();
        let report = PatientsLikeMe::new(&catalog, DEFAULT_NEIGHBOURS)
            .find_for_row(&table, 7)
            .unwrap();
        assert_eq!(report.neighbours.len(), 9);
        assert!(report.neighbours.iter().all(|n| n.row != 7));
        assert!(report.neighbours.windows(2).all(|w| w[0].distance <= w[1].distance));
        let total: f64 = report.shares.iter().map(|s| s.neighbour_fraction).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-12);
        assert!(PatientsLikeMe::new(&catalog, 3).find_for_row(&table, 10).is_err());
    }

    #[test]
    fn equal_distances_keep_row_order() {
        let table = table(&[70.0, 50.0, 55.0, 50.0, 50.0, 80.0]);
        let catalog = TreatmentCatalog::standard();
        let report = PatientsLikeMe::new(&catalog, 2)
            .find(&table, array![50.0, 0.0, 0.0].view())
            .unwrap();
        let rows: Vec<usize> = report.neighbours.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![1, 3]);
        assert_eq!(report.neighbours[0].distance, 0.0);
        assert_eq!(report.neighbours[1].distance, 0.0);

        let report = PatientsLikeMe::new(&catalog, 3)
            .find_for_row(&table, 3)
            .unwrap();
        let rows: Vec<usize> = report.neighbours.iter().map(|n| n.row).collect();
        assert_eq!(rows, vec![1, 4, 2]);
    }

    #[test]
    fn query_width_must_match_the_table() {
        let table = cohort();
        let catalog = TreatmentCatalog::standard();
        let err = PatientsLikeMe::new(&catalog, 3)
            .find(&table, array![42.0].view())
            .unwrap_err();
        assert!(matches!(err, BenefitError::ShapeMismatch { found: 1, .. }));
    }
}
