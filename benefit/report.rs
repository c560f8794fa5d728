use super::BenefitError;
use super::calibration::calibrate_benefit;
use super::cfb::{BenefitEstimator, c_for_benefit, observed_benefit};
use super::counterfactual::CounterfactualPredictor;
use super::matching::{CovariateMatcher, MatchedPair};
use crate::catalog::{TreatmentCatalog, metric_key};
use crate::config::Settings;
use crate::data::PatientTable;
use crate::survival::SurvivalModel;
use ndarray::{Array1, ArrayView1};
use std::collections::BTreeMap;

/// Benefit statistics of one active arm against the reference arm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmBenefit {
    pub c_for_benefit: f64,
    pub ece: f64,
    pub slope: f64,
    pub intercept: f64,
    pub pairs: usize,
}

impl ArmBenefit {
    fn missing() -> Self {
        Self {
            c_for_benefit: f64::NAN,
            ece: f64::NAN,
            slope: f64::NAN,
            intercept: f64::NAN,
            pairs: 0,
        }
    }

    fn insert_into(&self, metrics: &mut BTreeMap<String, f64>, label: &str) {
        let slug = metric_key(label);
        metrics.insert(format!("cfb_{slug}"), self.c_for_benefit);
        metrics.insert(format!("ece_{slug}"), self.ece);
        metrics.insert(format!("slope_{slug}"), self.slope);
        metrics.insert(format!("intercept_{slug}"), self.intercept);
    }
}

/// Pair-level benefit statistics given survival at `tau` under both arms.
pub fn arm_benefit(
    pairs: &[MatchedPair],
    s_a: ArrayView1<'_, f64>,
    s_b: ArrayView1<'_, f64>,
    table: &PatientTable,
    settings: &Settings,
) -> ArmBenefit {
    let tau = settings.evaluation_days;
    let durations = table.targets.durations.view();
    let events = table.targets.events.view();
    let cfb = c_for_benefit(pairs, s_a, s_b, durations, events, tau, settings.estimator);

    let predicted: Array1<f64> = pairs
        .iter()
        .map(|p| BenefitEstimator::ArmContrast.pair_benefit(p, s_a, s_b))
        .collect();
    let observed: Array1<f64> = pairs
        .iter()
        .map(|p| observed_benefit(p, durations, events, tau))
        .collect();
    let calibration = calibrate_benefit(
        predicted.view(),
        observed.view(),
        settings.calibration_bins,
        settings.binning,
    );

    ArmBenefit {
        c_for_benefit: cfb.value,
        ece: calibration.ece,
        slope: calibration.slope,
        intercept: calibration.intercept,
        pairs: pairs.len(),
    }
}

/// Matches the reference arm against every active arm and reports flat
/// `cfb_*`, `ece_*`, `slope_*` and `intercept_*` metrics plus `cfb_mean`.
///
/// A failing arm is logged and reported as NaN; only a failure to predict
/// under the reference arm aborts.
pub fn evaluate_treatment_benefit(
    model: &dyn SurvivalModel,
    table: &PatientTable,
    catalog: &TreatmentCatalog,
    settings: &Settings,
    matcher: &CovariateMatcher,
) -> Result<BTreeMap<String, f64>, BenefitError> {
    let tau = settings.evaluation_days;
    let layout = table.feature_layout();
    let feature_cols = layout.matching_columns();
    let predictor = CounterfactualPredictor::new(catalog, layout);
    let x = table.features();

    let reference_index = catalog.reference_index();
    let reference = catalog
        .arm(reference_index)
        .map(|arm| arm.label.as_str())
        .unwrap_or(crate::catalog::REFERENCE_ARM);
    let s_reference = predictor.survival_at(model, x, reference, &[tau])?;

    let mut metrics = BTreeMap::new();
    for (index, arm) in catalog.arms().iter().enumerate() {
        if index == reference_index {
            continue;
        }
        let label = arm.label.as_str();
        let outcome = predictor
            .survival_at(model, x, label, &[tau])
            .and_then(|s_arm| {
                let pairs = matcher.build_pairs(table, catalog, reference, label, &feature_cols)?;
                Ok(arm_benefit(
                    &pairs,
                    s_reference.column(0),
                    s_arm.column(0),
                    table,
                    settings,
                ))
            });
        let benefit = match outcome {
            Ok(benefit) => {
                log::debug!(
                    "'{}': C-for-benefit {:.4} over {} pairs",
                    label,
                    benefit.c_for_benefit,
                    benefit.pairs
                );
                benefit
            }
            Err(e) => {
                log::warn!("Benefit evaluation failed for '{}': {}", label, e);
                ArmBenefit::missing()
            }
        };
        benefit.insert_into(&mut metrics, label);
    }

    let finite: Vec<f64> = metrics
        .iter()
        .filter(|(key, value)| key.starts_with("cfb_") && value.is_finite())
        .map(|(_, &value)| value)
        .collect();
    let cfb_mean = if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    };
    metrics.insert("cfb_mean".to_string(), cfb_mean);
    Ok(metrics)
}
