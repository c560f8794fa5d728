use super::curve::SurvivalCurves;
use super::discretize::TimeGrid;
use super::neural::{Holdout, NeuralSurvival};
use super::{ModelError, SurvivalModel, ValidationSet};
use crate::config::ModelConfig;
use crate::data::SurvivalTargets;
use crate::net::gate::RuleGate;
use ndarray::{Array1, ArrayView2};

/// Single-head baseline that sees treatment only through its feature columns.
///
/// Task indices are accepted and ignored. With validation data, training
/// stops once the validation loss has not improved for `patience` epochs and
/// the best network is kept.
#[derive(Debug, Clone)]
pub struct SingleTaskSurvivalModel {
    core: NeuralSurvival,
}

impl SingleTaskSurvivalModel {
    pub fn new(config: ModelConfig, grid: TimeGrid) -> Result<Self, ModelError> {
        Ok(Self {
            core: NeuralSurvival::new(config, grid, 1, RuleGate::disabled(), true)?,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        self.core.config()
    }

    pub fn is_fitted(&self) -> bool {
        self.core.is_fitted()
    }
}

impl SurvivalModel for SingleTaskSurvivalModel {
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
        let holdout = validation.map(|v| Holdout {
            x: v.x,
            tasks: vec![0; v.x.nrows()],
            targets: v.targets,
        });
        self.core.fit(x, &vec![0; x.nrows()], targets, holdout)
    }

    fn predict_survival_function(
        &self,
        x: ArrayView2<'_, f64>,
        _: Option<&[usize]>,
        times: Option<&[f64]>,
    ) -> Result<SurvivalCurves, ModelError> {
        self.core.survival(x, &vec![0; x.nrows()], times)
    }

    fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        _: Option<&[usize]>,
    ) -> Result<Array1<f64>, ModelError> {
        self.core.risk(x, &vec![0; x.nrows()])
    }

    fn time_grid(&self) -> Option<&TimeGrid> {
        Some(self.core.grid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survival::variant::SurvivalVariant;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn data() -> (Array2<f64>, SurvivalTargets) {
        let x = Array2::from_shape_fn((30, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f64 / 10.0);
        let durations = Array1::from_shape_fn(30, |i| 50.0 + 20.0 * (i % 9) as f64);
        let events = Array1::from_shape_fn(30, |i| if i % 5 == 0 { 0.0 } else { 1.0 });
        (x, SurvivalTargets::new(durations, events).unwrap())
    }

    fn model(variant: SurvivalVariant) -> SingleTaskSurvivalModel {
        let config = ModelConfig {
            variant,
            hidden_layers: vec![6],
            epochs: 200,
            learning_rate: 5e-3,
            ..ModelConfig::single_task()
        };
        SingleTaskSurvivalModel::new(config, TimeGrid::new(vec![0.0, 60.0, 120.0, 180.0, 240.0]).unwrap())
            .unwrap()
    }

    #[test]
    fn task_indices_do_not_change_predictions() {
        let (x, targets) = data();
        let mut m = model(SurvivalVariant::PiecewiseConstantHazard);
        m.fit(x.view(), None, &targets, None).unwrap();
        let without = m.predict(x.view(), None).unwrap();
        let with = m.predict(x.view(), Some(&[3; 30])).unwrap();
        for (a, b) in without.iter().zip(with.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        assert!(!m.is_multi_task());
    }

    #[test]
    fn validation_data_enables_early_stopping() {
        let (x, targets) = data();
        let (vx, vtargets) = (x.slice(ndarray::s![..10, ..]), targets.subset(&(0..10).collect::<Vec<_>>()));
        let mut m = model(SurvivalVariant::ProportionalHazards);
        m.fit(
            x.view(),
            None,
            &targets,
            Some(ValidationSet {
                x: vx,
                tasks: None,
                targets: &vtargets,
            }),
        )
        .unwrap();
        assert!(m.is_fitted());
        let curves = m
            .predict_survival_function(array![[0.1, 0.2]].view(), None, Some(&[30.0, 90.0, 150.0]))
            .unwrap();
        let row = curves.curve(0);
        assert!(row[0] >= row[1] && row[1] >= row[2]);
        assert_eq!(m.config().batch_size, 64);
    }
}
