//! Cross-validated training and hold-out evaluation of configured models.

use super::report::{MetricReport, evaluate_all_metrics};
use super::EvaluationError;
use crate::benefit::matching::CovariateMatcher;
use crate::catalog::TreatmentCatalog;
use crate::config::{LinearCoxConfig, ModelConfig, ModelEntry, ModelKind, Settings};
use crate::data::{FeatureLayout, PatientTable};
use crate::survival::discretize::TimeGrid;
use crate::survival::{
    LinearCoxModel, ModelError, MultiTaskSurvivalModel, SingleTaskSurvivalModel, SurvivalModel,
    ValidationSet,
};
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

/// Share of the training set held back for early stopping of the final model.
const FINAL_VALIDATION_FRACTION: f64 = 0.1;

/// Validation rows of each fold, stratified on the event indicator.
///
/// Each stratum is shuffled with `seed` and dealt round-robin, so fold sizes
/// differ by at most one within a stratum.
pub fn stratified_folds(
    events: ArrayView1<'_, f64>,
    n_splits: usize,
    seed: u64,
) -> Result<Vec<Vec<usize>>, EvaluationError> {
    if n_splits < 2 || events.len() < n_splits {
        return Err(EvaluationError::TooFewSamples {
            needed: n_splits.max(2),
            splits: n_splits,
            found: events.len(),
        });
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut observed, mut censored): (Vec<usize>, Vec<usize>) =
        (0..events.len()).partition(|&i| events[i] > 0.5);
    observed.shuffle(&mut rng);
    censored.shuffle(&mut rng);

    let mut folds = vec![Vec::new(); n_splits];
    for (k, row) in observed.into_iter().chain(censored).enumerate() {
        folds[k % n_splits].push(row);
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    Ok(folds)
}

/// Shuffled `(train, test)` row split; both sides keep at least one row.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rows: Vec<usize> = (0..n).collect();
    rows.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = if n < 2 {
        0
    } else {
        ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1)
    };
    let mut test = rows.split_off(n - n_test);
    rows.sort_unstable();
    test.sort_unstable();
    (rows, test)
}

fn complement(n: usize, rows: &[usize]) -> Vec<usize> {
    let mut keep = vec![true; n];
    for &r in rows {
        keep[r] = false;
    }
    (0..n).filter(|&i| keep[i]).collect()
}

/// Immutable recipe for a model; every fold instantiates its own copy.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTemplate {
    MultiTask(ModelConfig),
    SingleTask(ModelConfig),
    LinearCox(LinearCoxConfig),
}

impl ModelTemplate {
    pub fn from_entry(entry: &ModelEntry) -> Self {
        match entry.kind {
            ModelKind::MultiTask => Self::MultiTask(entry.network.clone().unwrap_or_default()),
            ModelKind::SingleTask => Self::SingleTask(
                entry
                    .network
                    .clone()
                    .unwrap_or_else(ModelConfig::single_task),
            ),
            ModelKind::LinearCox => Self::LinearCox(entry.linear.clone().unwrap_or_default()),
        }
    }

    /// Neural templates benefit from held-out data for early stopping.
    pub fn uses_validation(&self) -> bool {
        !matches!(self, Self::LinearCox(_))
    }

    pub fn instantiate(
        &self,
        settings: &Settings,
        catalog: &TreatmentCatalog,
        feature_names: &[String],
    ) -> Result<Box<dyn SurvivalModel>, ModelError> {
        let grid = TimeGrid::new(settings.time_bins.clone())?;
        Ok(match self {
            Self::MultiTask(config) => Box::new(MultiTaskSurvivalModel::new(
                config.clone(),
                grid,
                catalog,
                &FeatureLayout::resolve(feature_names),
            )?),
            Self::SingleTask(config) => Box::new(SingleTaskSurvivalModel::new(config.clone(), grid)?),
            Self::LinearCox(config) => Box::new(LinearCoxModel::new(config.clone(), grid)?),
        })
    }
}

/// A final model with its cross-validated and hold-out metrics.
pub struct TrainedModel {
    pub name: String,
    pub cv: MetricReport,
    pub holdout: MetricReport,
    pub model: Box<dyn SurvivalModel>,
}

/// Runs folds on a dedicated worker pool and evaluates final models.
///
/// All folds share one matcher; its cache is keyed by the fold's patient ids.
#[derive(Debug)]
pub struct ModelTrainer {
    settings: Settings,
    catalog: TreatmentCatalog,
    matcher: CovariateMatcher,
}

impl ModelTrainer {
    pub fn new(settings: Settings, catalog: TreatmentCatalog) -> Result<Self, EvaluationError> {
        settings.validate()?;
        let matcher = CovariateMatcher::new(settings.matching);
        Ok(Self {
            settings,
            catalog,
            matcher,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn catalog(&self) -> &TreatmentCatalog {
        &self.catalog
    }

    pub fn matcher(&self) -> &CovariateMatcher {
        &self.matcher
    }

    fn fit(
        &self,
        template: &ModelTemplate,
        train: &PatientTable,
        validation: Option<&PatientTable>,
    ) -> Result<Box<dyn SurvivalModel>, EvaluationError> {
        let mut model = template.instantiate(&self.settings, &self.catalog, &train.feature_names)?;
        let validation = validation.map(|v| ValidationSet {
            x: v.features(),
            tasks: Some(v.task_indices.as_slice()),
            targets: &v.targets,
        });
        model.fit(
            train.features(),
            Some(&train.task_indices),
            &train.targets,
            validation,
        )?;
        Ok(model)
    }

    fn run_fold(
        &self,
        template: &ModelTemplate,
        table: &PatientTable,
        validation_rows: &[usize],
    ) -> Result<MetricReport, EvaluationError> {
        let train = table.subset(&complement(table.n_samples(), validation_rows));
        let validation = table.subset(validation_rows);
        let early_stopping = template.uses_validation().then_some(&validation);
        let model = self.fit(template, &train, early_stopping)?;
        evaluate_all_metrics(
            model.as_ref(),
            &validation,
            &train.targets,
            &self.settings,
            &self.catalog,
            &self.matcher,
        )
    }

    /// Mean of the finite per-fold metrics over stratified folds of `table`.
    pub fn cross_validate(
        &self,
        name: &str,
        template: &ModelTemplate,
        table: &PatientTable,
    ) -> Result<MetricReport, EvaluationError> {
        let folds = stratified_folds(
            table.targets.events.view(),
            self.settings.cv_splits,
            self.settings.random_state,
        )?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.n_jobs)
            .build()
            .map_err(|e| EvaluationError::ThreadPool(e.to_string()))?;

        let reports = pool.install(|| {
            folds
                .par_iter()
                .enumerate()
                .map(|(fold, rows)| {
                    self.run_fold(template, table, rows)
                        .map_err(|e| EvaluationError::Fold {
                            model: name.to_string(),
                            fold,
                            source: Box::new(e),
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mean = MetricReport::mean_of(&reports);
        log::info!(
            "{} cross-validation over {} folds: C {:.4}, IBS {:.4}, AUC {:.4}",
            name,
            reports.len(),
            mean.get("c_index").unwrap_or(f64::NAN),
            mean.get("ibs").unwrap_or(f64::NAN),
            mean.get("auc").unwrap_or(f64::NAN)
        );
        Ok(mean)
    }

    /// Fits on all of `train`. Networks that early-stop hold back a small
    /// seeded share of `train` for it.
    pub fn fit_final(
        &self,
        template: &ModelTemplate,
        train: &PatientTable,
    ) -> Result<Box<dyn SurvivalModel>, EvaluationError> {
        if template.uses_validation() && train.n_samples() >= 2 {
            let (fit_rows, early_rows) = train_test_split(
                train.n_samples(),
                FINAL_VALIDATION_FRACTION,
                self.settings.random_state,
            );
            let early = train.subset(&early_rows);
            self.fit(template, &train.subset(&fit_rows), Some(&early))
        } else {
            self.fit(template, train, None)
        }
    }

    /// Matched pairs cached for the folds of a run are useless to the next run.
    pub fn release_matches(&self) {
        log::debug!(
            "Dropping {} cached matchings",
            self.matcher.cached_entries()
        );
        self.matcher.clear_cache();
    }

    /// Cross-validates on `train`, fits a final model on `train` and scores
    /// it on `test`.
    pub fn evaluate_template(
        &self,
        name: &str,
        template: &ModelTemplate,
        train: &PatientTable,
        test: &PatientTable,
    ) -> Result<TrainedModel, EvaluationError> {
        let cv = self.cross_validate(name, template, train)?;
        let model = self.fit_final(template, train)?;
        let holdout = evaluate_all_metrics(
            model.as_ref(),
            test,
            &train.targets,
            &self.settings,
            &self.catalog,
            &self.matcher,
        )?;
        log::info!(
            "{} hold-out: C {:.4}, IBS {:.4}, AUC {:.4}, mean C-for-benefit {:.4}",
            name,
            holdout.get("c_index").unwrap_or(f64::NAN),
            holdout.get("ibs").unwrap_or(f64::NAN),
            holdout.get("auc").unwrap_or(f64::NAN),
            holdout.get("cfb_mean").unwrap_or(f64::NAN)
        );
        Ok(TrainedModel {
            name: name.to_string(),
            cv,
            holdout,
            model,
        })
    }

    /// Evaluates every template on the same split. Folds are shared across
    /// templates, so matchings are only dropped once all of them are done.
    pub fn train_and_evaluate(
        &self,
        templates: &[(String, ModelTemplate)],
        train: &PatientTable,
        test: &PatientTable,
    ) -> Result<Vec<TrainedModel>, EvaluationError> {
        let trained = templates
            .iter()
            .map(|(name, template)| self.evaluate_template(name, template, train, test))
            .collect();
        self.release_matches();
        trained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn folds_partition_rows_and_balance_events() {
        let events = Array1::from_shape_fn(23, |i| f64::from(u8::from(i % 3 != 0)));
        let folds = stratified_folds(events.view(), 5, 7).unwrap();
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        for fold in &folds {
            let observed = fold.iter().filter(|&&i| events[i] > 0.5).count();
            assert!((3..=4).contains(&observed));
        }
        assert_eq!(folds, stratified_folds(events.view(), 5, 7).unwrap());
        assert!(stratified_folds(events.view(), 30, 7).is_err());
    }

    #[test]
    fn split_keeps_both_sides_non_empty() {
        let (train, test) = train_test_split(10, 0.2, 1);
        assert_eq!((train.len(), test.len()), (8, 2));
        assert!(test.iter().all(|t| !train.contains(t)));
        let (train, test) = train_test_split(3, 0.01, 1);
        assert_eq!((train.len(), test.len()), (2, 1));
        assert_eq!(complement(5, &[1, 3]), vec![0, 2, 4]);
    }

    #[test]
    fn templates_follow_the_configured_kind() {
        let entry = ModelEntry {
            name: "single".into(),
            kind: ModelKind::SingleTask,
            network: None,
            linear: None,
        };
        let template = ModelTemplate::from_entry(&entry);
        assert_eq!(template, ModelTemplate::SingleTask(ModelConfig::single_task()));
        assert!(template.uses_validation());

        let names: Vec<String> = vec!["age".into(), "hasMsi".into()];
        let model = template
            .instantiate(&Settings::default(), &TreatmentCatalog::standard(), &names)
            .unwrap();
        assert!(!model.is_multi_task());
        assert_eq!(model.time_grid().unwrap().cuts()[0], 0.0);

        let cox = ModelTemplate::from_entry(&ModelEntry {
            kind: ModelKind::LinearCox,
            ..entry
        });
        assert!(!cox.uses_validation());
    }
}
