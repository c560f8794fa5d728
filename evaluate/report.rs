use super::metrics::{
    censoring_distribution, concordance_index_ipcw, cumulative_dynamic_auc, integrated_brier_score,
};
use super::{EvaluationError, evaluation_time_grid};
use crate::benefit::matching::CovariateMatcher;
use crate::benefit::report::evaluate_treatment_benefit;
use crate::catalog::TreatmentCatalog;
use crate::config::Settings;
use crate::data::{PatientTable, SurvivalTargets};
use crate::survival::SurvivalModel;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Flat named metrics of one model on one evaluation set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricReport {
    values: BTreeMap<String, f64>,
}

impl MetricReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, f64)>) {
        self.values.extend(other);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Per-metric mean over the finite values of `reports`; NaN where none are finite.
    pub fn mean_of(reports: &[MetricReport]) -> MetricReport {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for report in reports {
            for (name, value) in report.iter() {
                let slot = sums.entry(name).or_insert((0.0, 0));
                if value.is_finite() {
                    slot.0 += value;
                    slot.1 += 1;
                }
            }
        }
        let values = sums
            .into_iter()
            .map(|(name, (sum, count))| {
                let mean = if count > 0 { sum / count as f64 } else { f64::NAN };
                (name.to_string(), mean)
            })
            .collect();
        MetricReport { values }
    }
}

impl fmt::Display for MetricReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{name:<48} {value:.4}")?;
        }
        Ok(())
    }
}

/// Time-dependent concordance, integrated Brier score and AUC of `model` on
/// `table`, merged with the per-arm benefit metrics.
///
/// Censoring weights come from `train_targets`. Evaluation times follow
/// [`evaluation_time_grid`] over the table's own follow-up.
pub fn evaluate_all_metrics(
    model: &dyn SurvivalModel,
    table: &PatientTable,
    train_targets: &SurvivalTargets,
    settings: &Settings,
    catalog: &TreatmentCatalog,
    matcher: &CovariateMatcher,
) -> Result<MetricReport, EvaluationError> {
    if table.n_samples() == 0 {
        return Err(EvaluationError::EmptyTable);
    }
    let durations = table.targets.durations.view();
    let events = table.targets.events.view();
    let times = evaluation_time_grid(durations, settings.max_time, &settings.time_points);

    let tasks = model.is_multi_task().then_some(table.task_indices.as_slice());
    let curves = model.predict_survival_function(table.features(), tasks, Some(&times))?;
    let survival = curves.values();
    let censoring = censoring_distribution(
        train_targets.durations.view(),
        train_targets.events.view(),
    );

    let c_scores: Vec<f64> = times
        .iter()
        .enumerate()
        .map(|(k, &tau)| {
            let risk = survival.column(k).mapv(|s| 1.0 - s);
            concordance_index_ipcw(&censoring, durations, events, risk.view(), tau)
        })
        .filter(|c| c.is_finite())
        .collect();
    let c_index = if c_scores.is_empty() {
        f64::NAN
    } else {
        c_scores.iter().sum::<f64>() / c_scores.len() as f64
    };
    let ibs = integrated_brier_score(&censoring, durations, events, survival, &times);
    let risk = survival.mapv(|s| -s);
    let (_, auc) = cumulative_dynamic_auc(&censoring, durations, events, risk.view(), &times);

    let mut report = MetricReport::new();
    report.insert("c_index", c_index);
    report.insert("ibs", ibs);
    report.insert("auc", auc);
    report.extend(evaluate_treatment_benefit(
        model, table, catalog, settings, matcher,
    )?);
    log::debug!(
        "Evaluated {} patients at {} times: C {:.4}, IBS {:.4}, AUC {:.4}",
        table.n_samples(),
        times.len(),
        c_index,
        ibs,
        auc
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(pairs: &[(&str, f64)]) -> MetricReport {
        let mut r = MetricReport::new();
        for &(k, v) in pairs {
            r.insert(k, v);
        }
        r
    }

    #[test]
    fn mean_ignores_non_finite_fold_values() {
        let folds = [
            report(&[("c_index", 0.6), ("cfb_5_fu", f64::NAN)]),
            report(&[("c_index", 0.8), ("cfb_5_fu", 0.7)]),
            report(&[("c_index", f64::NAN), ("cfb_5_fu", f64::NAN), ("ibs", f64::NAN)]),
        ];
        let mean = MetricReport::mean_of(&folds);
        assert!((mean.get("c_index").unwrap() - 0.7).abs() < 1e-12);
        assert_eq!(mean.get("cfb_5_fu"), Some(0.7));
        assert!(mean.get("ibs").unwrap().is_nan());
        assert_eq!(mean.len(), 3);
    }

    #[test]
    fn reports_serialize_as_flat_maps() {
        let r = report(&[("auc", 0.75), ("c_index", 0.5)]);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"auc":0.75,"c_index":0.5}"#);
        assert!(r.to_string().starts_with("auc"));
    }
}
