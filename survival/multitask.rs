use super::curve::SurvivalCurves;
use super::discretize::TimeGrid;
use super::neural::NeuralSurvival;
use super::{ModelError, SurvivalModel, ValidationSet};
use crate::catalog::TreatmentCatalog;
use crate::config::ModelConfig;
use crate::data::{FeatureLayout, SurvivalTargets};
use crate::net::gate::RuleGate;
use ndarray::{Array1, ArrayView2};

/// Shared network with one head per treatment arm.
///
/// Trains on shuffled minibatches for a fixed number of epochs; every
/// prediction needs the task (arm) index of each row.
#[derive(Debug, Clone)]
pub struct MultiTaskSurvivalModel {
    core: NeuralSurvival,
    feature_count: usize,
}

impl MultiTaskSurvivalModel {
    /// Resolves the biomarker gates against `layout`; inputs must keep that column order.
    pub fn new(
        config: ModelConfig,
        grid: TimeGrid,
        catalog: &TreatmentCatalog,
        layout: &FeatureLayout,
    ) -> Result<Self, ModelError> {
        let rule_gate = RuleGate::resolve(layout, catalog, config.rule_gate);
        Ok(Self {
            core: NeuralSurvival::new(config, grid, catalog.len(), rule_gate, false)?,
            feature_count: layout.feature_count(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        self.core.config()
    }

    pub fn num_tasks(&self) -> usize {
        self.core.num_tasks()
    }

    pub fn is_fitted(&self) -> bool {
        self.core.is_fitted()
    }

    fn check_features(&self, x: ArrayView2<'_, f64>) -> Result<(), ModelError> {
        if x.ncols() != self.feature_count {
            return Err(ModelError::ShapeMismatch {
                what: "feature columns",
                expected: self.feature_count,
                found: x.ncols(),
            });
        }
        Ok(())
    }
}

impl SurvivalModel for MultiTaskSurvivalModel {
    fn is_multi_task(&self) -> bool {
        true
    }

    fn fit(
        &mut self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
        targets: &SurvivalTargets,
        validation: Option<ValidationSet<'_>>,
    ) -> Result<(), ModelError> {
        let tasks = tasks.ok_or(ModelError::MissingTaskIndices)?;
        self.check_features(x)?;
        if validation.is_some() {
            log::debug!("Multi-task training does not use early stopping; validation data ignored");
        }
        self.core.fit(x, tasks, targets, None)
    }

    fn predict_survival_function(
        &self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
        times: Option<&[f64]>,
    ) -> Result<SurvivalCurves, ModelError> {
        let tasks = tasks.ok_or(ModelError::MissingTaskIndices)?;
        self.check_features(x)?;
        self.core.survival(x, tasks, times)
    }

    fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        tasks: Option<&[usize]>,
    ) -> Result<Array1<f64>, ModelError> {
        let tasks = tasks.ok_or(ModelError::MissingTaskIndices)?;
        self.check_features(x)?;
        self.core.risk(x, tasks)
    }

    fn time_grid(&self) -> Option<&TimeGrid> {
        Some(self.core.grid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetError;
    use crate::survival::variant::SurvivalVariant;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn names() -> Vec<String> {
        ["age", "hasMsi", "systemicTreatmentPlan_5-FU"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Patients on task 1 live roughly twice as long as those on task 0.
    fn cohort(n: usize) -> (Array2<f64>, Vec<usize>, SurvivalTargets) {
        let mut rng = StdRng::seed_from_u64(17);
        let mut x = Array2::<f64>::zeros((n, 3));
        let mut tasks = Vec::with_capacity(n);
        let mut durations = Vec::with_capacity(n);
        let mut events = Vec::with_capacity(n);
        for i in 0..n {
            let task = i % 2;
            x[(i, 0)] = rng.gen_range(-1.0..1.0);
            x[(i, 1)] = f64::from(u8::from(i % 3 == 0));
            x[(i, 2)] = task as f64;
            tasks.push(task);
            let base = if task == 1 { 500.0 } else { 200.0 };
            durations.push(base + rng.gen_range(-100.0..100.0));
            events.push(if i % 4 == 3 { 0.0 } else { 1.0 });
        }
        let targets = SurvivalTargets::new(Array1::from(durations), Array1::from(events)).unwrap();
        (x, tasks, targets)
    }

    fn model(variant: SurvivalVariant) -> MultiTaskSurvivalModel {
        let config = ModelConfig {
            variant,
            hidden_layers: vec![8],
            batch_size: 16,
            epochs: 20,
            learning_rate: 1e-2,
            dropout: 0.0,
            ..ModelConfig::default()
        };
        let grid = TimeGrid::new(vec![0.0, 150.0, 300.0, 450.0, 600.0, 750.0]).unwrap();
        MultiTaskSurvivalModel::new(
            config,
            grid,
            &TreatmentCatalog::standard(),
            &FeatureLayout::resolve(&names()),
        )
        .unwrap()
    }

    #[test]
    fn every_variant_trains_and_predicts_monotone_curves() {
        let (x, tasks, targets) = cohort(48);
        for variant in SurvivalVariant::ALL {
            let mut m = model(variant);
            m.fit(x.view(), Some(&tasks), &targets, None).unwrap();
            let curves = m
                .predict_survival_function(x.view(), Some(&tasks), None)
                .unwrap();
            assert_eq!(curves.n_samples(), 48);
            for i in 0..curves.n_samples() {
                let row = curves.curve(i);
                for w in row.to_vec().windows(2) {
                    assert!(w[1] <= w[0] + 1e-9, "{variant}: survival increased");
                }
                assert!(row.iter().all(|s| (0.0..=1.0).contains(s)));
            }
            let risk = m.predict(x.view(), Some(&tasks)).unwrap();
            assert!(risk.iter().all(|r| r.is_finite()));
        }
    }

    #[test]
    fn head_for_the_longer_surviving_arm_predicts_higher_survival() {
        let (x, tasks, targets) = cohort(64);
        let mut m = model(SurvivalVariant::LogisticHazard);
        m.fit(x.view(), Some(&tasks), &targets, None).unwrap();
        let as_zero = m
            .predict_survival_function(x.view(), Some(&vec![0; 64]), Some(&[365.0]))
            .unwrap();
        let as_one = m
            .predict_survival_function(x.view(), Some(&vec![1; 64]), Some(&[365.0]))
            .unwrap();
        let mean = |c: &SurvivalCurves| c.values().column(0).mean().unwrap_or(f64::NAN);
        assert!(mean(&as_one) > mean(&as_zero));
    }

    #[test]
    fn proportional_hazards_keeps_nan_for_arms_without_events() {
        let (x, tasks, targets) = cohort(32);
        let mut m = model(SurvivalVariant::ProportionalHazards);
        m.fit(x.view(), Some(&tasks), &targets, None).unwrap();
        let curves = m
            .predict_survival_function(x.view(), Some(&vec![7; 32]), Some(&[100.0, 365.0]))
            .unwrap();
        assert!(curves.values().iter().all(|v| v.is_nan()));
        let curves = m
            .predict_survival_function(x.view(), Some(&tasks), Some(&[100.0, 365.0]))
            .unwrap();
        assert!(curves.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn predictions_require_task_indices_and_a_fit() {
        let (x, tasks, _) = cohort(8);
        let m = model(SurvivalVariant::Mtlr);
        assert!(!m.is_fitted());
        assert!(matches!(
            m.predict(x.view(), Some(&tasks)),
            Err(ModelError::NotFitted)
        ));
        assert!(matches!(
            m.predict(x.view(), None),
            Err(ModelError::MissingTaskIndices)
        ));
        assert!(matches!(
            m.predict(array![[1.0, 2.0]].view(), Some(&[0])),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn out_of_range_task_indices_are_reported() {
        let (x, mut tasks, targets) = cohort(8);
        let mut m = model(SurvivalVariant::LogisticHazard);
        assert_eq!(m.num_tasks(), 10);
        tasks[3] = 12;
        assert!(matches!(
            m.fit(x.view(), Some(&tasks), &targets, None),
            Err(ModelError::Net(NetError::TaskIndexOutOfRange { index: 12, .. }))
        ));
    }
}
