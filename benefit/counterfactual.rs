//! "What if this patient had received arm k?" survival predictions.

use super::BenefitError;
use crate::catalog::{TreatmentArm, TreatmentCatalog};
use crate::data::FeatureLayout;
use crate::survival::SurvivalModel;
use crate::survival::curve::{Interpolation, SurvivalCurves};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Copy of `x` with the treatment component columns set to `arm`'s vector and
/// the derived `hasTreatment` flag recomputed. Absent columns are skipped.
pub fn apply_treatment(x: ArrayView2<'_, f64>, layout: &FeatureLayout, arm: &TreatmentArm) -> Array2<f64> {
    let mut out = x.to_owned();
    for (component, column) in layout.present_components() {
        out.column_mut(column)
            .fill(f64::from(arm.components[component]));
    }
    if let Some(column) = layout.has_treatment {
        out.column_mut(column).fill(arm.has_treatment());
    }
    out
}

/// Survival at fixed horizons for every patient under every arm.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterfactualTable {
    labels: Vec<String>,
    horizons: Vec<f64>,
    survival: Vec<Array2<f64>>,
}

impl CounterfactualTable {
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn horizons(&self) -> &[f64] {
        &self.horizons
    }

    /// `[n, horizons]` survival for one arm.
    pub fn arm(&self, label: &str) -> Option<&Array2<f64>> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| &self.survival[i])
    }

    /// Survival of every patient under `label` at the `horizon`-th horizon.
    pub fn at(&self, label: &str, horizon: usize) -> Option<ArrayView1<'_, f64>> {
        self.arm(label)
            .filter(|s| horizon < s.ncols())
            .map(|s| s.column(horizon))
    }
}

/// Predicts counterfactual survival by rewriting treatment columns.
///
/// Multi-task models additionally receive the arm's task index; single-task
/// models see the treatment only through the rewritten columns.
#[derive(Debug, Clone)]
pub struct CounterfactualPredictor<'a> {
    catalog: &'a TreatmentCatalog,
    layout: FeatureLayout,
}

impl<'a> CounterfactualPredictor<'a> {
    pub fn new(catalog: &'a TreatmentCatalog, layout: FeatureLayout) -> Self {
        Self { catalog, layout }
    }

    pub fn curves(
        &self,
        model: &dyn SurvivalModel,
        x: ArrayView2<'_, f64>,
        label: &str,
    ) -> Result<SurvivalCurves, BenefitError> {
        let (index, arm) = self.catalog.require(label)?;
        let treated = apply_treatment(x, &self.layout, arm);
        let tasks = model.is_multi_task().then(|| vec![index; x.nrows()]);
        Ok(model.predict_survival_function(treated.view(), tasks.as_deref(), None)?)
    }

    /// `[n, horizons]` survival under `label`, linearly interpolated on each curve.
    pub fn survival_at(
        &self,
        model: &dyn SurvivalModel,
        x: ArrayView2<'_, f64>,
        label: &str,
        horizons: &[f64],
    ) -> Result<Array2<f64>, BenefitError> {
        let curves = self.curves(model, x, label)?;
        let mut out = Array2::<f64>::zeros((x.nrows(), horizons.len()));
        for (j, &h) in horizons.iter().enumerate() {
            out.column_mut(j).assign(&curves.at(h, Interpolation::Linear));
        }
        Ok(out)
    }

    pub fn all_arms(
        &self,
        model: &dyn SurvivalModel,
        x: ArrayView2<'_, f64>,
        horizons: &[f64],
    ) -> Result<CounterfactualTable, BenefitError> {
        let mut labels = Vec::with_capacity(self.catalog.len());
        let mut survival = Vec::with_capacity(self.catalog.len());
        for label in self.catalog.labels() {
            survival.push(self.survival_at(model, x, label, horizons)?);
            labels.push(label.to_string());
        }
        Ok(CounterfactualTable {
            labels,
            horizons: horizons.to_vec(),
            survival,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::REFERENCE_ARM;
    use crate::data::SurvivalTargets;
    use crate::survival::discretize::TimeGrid;
    use crate::survival::{ModelError, ValidationSet};
    use ndarray::{Array1, array};

    fn layout() -> FeatureLayout {
        let names: Vec<String> = [
            "age",
            "systemicTreatmentPlan_5-FU",
            "systemicTreatmentPlan_oxaliplatin",
            "hasTreatment",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        FeatureLayout::resolve(&names)
    }

    /// Survival `exp(-t * rate)` where the rate drops with each active component.
    struct ToyModel {
        grid: TimeGrid,
        multi_task: bool,
    }

    impl SurvivalModel for ToyModel {
        fn is_multi_task(&self) -> bool {
            self.multi_task
        }

        fn fit(
            &mut self,
            _: ArrayView2<'_, f64>,
            _: Option<&[usize]>,
            _: &SurvivalTargets,
            _: Option<ValidationSet<'_>>,
        ) -> Result<(), ModelError> {
            Ok(())
        }

        fn predict_survival_function(
            &self,
            x: ArrayView2<'_, f64>,
            tasks: Option<&[usize]>,
            times: Option<&[f64]>,
        ) -> Result<SurvivalCurves, ModelError> {
            if self.multi_task && tasks.is_none() {
                return Err(ModelError::MissingTaskIndices);
            }
            let times = times.unwrap_or(self.grid.cuts());
            let values = Array2::from_shape_fn((x.nrows(), times.len()), |(i, j)| {
                let rate = 0.01 / (1.0 + x[(i, 1)] + x[(i, 2)]);
                (-rate * times[j]).exp()
            });
            Ok(SurvivalCurves::new(times.to_vec(), values)?)
        }

        fn predict(
            &self,
            x: ArrayView2<'_, f64>,
            _: Option<&[usize]>,
        ) -> Result<Array1<f64>, ModelError> {
            Ok(Array1::zeros(x.nrows()))
        }

        fn time_grid(&self) -> Option<&TimeGrid> {
            Some(&self.grid)
        }
    }

    fn toy(multi_task: bool) -> ToyModel {
        ToyModel {
            grid: TimeGrid::new(vec![0.0, 100.0, 200.0, 400.0]).unwrap(),
            multi_task,
        }
    }

    #[test]
    fn apply_treatment_rewrites_components_without_touching_the_input() {
        let x = array![[61.0, 1.0, 1.0, 1.0], [70.0, 0.0, 0.0, 0.0]];
        let catalog = TreatmentCatalog::standard();
        let (_, reference) = catalog.require(REFERENCE_ARM).unwrap();
        let once = apply_treatment(x.view(), &layout(), reference);
        let twice = apply_treatment(once.view(), &layout(), reference);
        assert_eq!(once, twice);
        assert_eq!(once.row(0).to_vec(), vec![61.0, 0.0, 0.0, 0.0]);
        assert_eq!(x[(0, 1)], 1.0);

        let (_, folfox) = catalog.require("5-FU + oxaliplatin").unwrap();
        let treated = apply_treatment(x.view(), &layout(), folfox);
        assert_eq!(treated.row(1).to_vec(), vec![70.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn treated_arms_get_higher_counterfactual_survival() {
        let catalog = TreatmentCatalog::standard();
        let predictor = CounterfactualPredictor::new(&catalog, layout());
        let x = array![[61.0, 0.0, 0.0, 0.0], [55.0, 1.0, 0.0, 1.0]];
        for multi_task in [false, true] {
            let table = predictor.all_arms(&toy(multi_task), x.view(), &[150.0, 365.0]).unwrap();
            assert_eq!(table.labels().len(), catalog.len());
            let none = table.at(REFERENCE_ARM, 1).unwrap();
            let folfox = table.at("5-FU + oxaliplatin", 1).unwrap();
            for i in 0..2 {
                assert!(folfox[i] > none[i]);
            }
            assert!(table.at(REFERENCE_ARM, 2).is_none());
        }
    }

    #[test]
    fn horizons_interpolate_linearly_between_grid_points() {
        let catalog = TreatmentCatalog::standard();
        let predictor = CounterfactualPredictor::new(&catalog, layout());
        let x = array![[50.0, 0.0, 0.0, 0.0]];
        let s = predictor
            .survival_at(&toy(false), x.view(), REFERENCE_ARM, &[150.0])
            .unwrap();
        let expected = 0.5 * ((-1.0_f64).exp() + (-2.0_f64).exp());
        assert!((s[(0, 0)] - expected).abs() < 1e-12);
    }

    #[test]
    fn unknown_arms_are_errors() {
        let catalog = TreatmentCatalog::standard();
        let predictor = CounterfactualPredictor::new(&catalog, layout());
        let x = array![[50.0, 0.0, 0.0, 0.0]];
        assert!(matches!(
            predictor.survival_at(&toy(true), x.view(), "radiotherapy", &[365.0]),
            Err(BenefitError::Catalog(_))
        ));
        assert!(predictor.all_arms(&toy(false), x.view(), &[365.0]).is_ok());
    }
}
