//! # Patient tables
//!
//! The numeric patient-time table consumed by every model: a feature matrix,
//! survival targets and the observed treatment-group index of each row. The
//! table arrives already preprocessed (encoded, imputed); this module only
//! enforces the schema and keeps the indexes consistent.
//!
//! - Fixed column names: `duration`, `event` and `treatment_group_idx` are
//!   required; `patient_id` is optional; every other column is a feature.
//! - Failures are input errors and surface as `DataError`.

use crate::catalog::{
    COMPONENT_COUNT, HAS_TREATMENT_COLUMN, TASK_INDEX_COLUMN, TREATMENT_COMPONENT_COLUMNS,
    TreatmentCatalog, is_treatment_column,
};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const DURATION_COLUMN: &str = "duration";
pub const EVENT_COLUMN: &str = "event";
pub const PATIENT_ID_COLUMN: &str = "patient_id";

/// Microsatellite-instability marker consulted by the immunotherapy gate.
pub const MSI_MARKER_COLUMN: &str = "hasMsi";
/// RAS-mutation marker consulted by the anti-EGFR gate.
pub const RAS_MARKER_COLUMN: &str = "hasRasMutation";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to a number. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Missing or null values were found in column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("durations must be non-negative (row {0})")]
    NegativeDuration(usize),
    #[error("event indicators must be 0 or 1 (row {0})")]
    InvalidEventFlag(usize),
    #[error("treatment group index {index} at row {row} is outside the catalog (size {size})")]
    TaskIndexOutOfRange {
        row: usize,
        index: usize,
        size: usize,
    },
    #[error("treatment group index at row {0} is not a non-negative integer")]
    InvalidTaskIndex(usize),
    #[error("expected {expected} rows but {name} has {found}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("table has no feature columns")]
    NoFeatures,
}

/// Observed follow-up: durations in days and 0/1 event indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalTargets {
    pub durations: Array1<f64>,
    pub events: Array1<f64>,
}

impl SurvivalTargets {
    pub fn new(durations: Array1<f64>, events: Array1<f64>) -> Result<Self, DataError> {
        if durations.len() != events.len() {
            return Err(DataError::LengthMismatch {
                name: "events",
                expected: durations.len(),
                found: events.len(),
            });
        }
        for (row, &d) in durations.iter().enumerate() {
            if !d.is_finite() {
                return Err(DataError::NonFiniteValuesFound(DURATION_COLUMN.to_string()));
            }
            if d < 0.0 {
                return Err(DataError::NegativeDuration(row));
            }
        }
        for (row, &e) in events.iter().enumerate() {
            if e != 0.0 && e != 1.0 {
                return Err(DataError::InvalidEventFlag(row));
            }
        }
        Ok(Self { durations, events })
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.events.iter().filter(|&&e| e > 0.5).count()
    }

    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            durations: self.durations.select(Axis(0), rows),
            events: self.events.select(Axis(0), rows),
        }
    }
}

/// Resolved positions of the columns that treatment logic reads or writes.
///
/// Every index is optional; consumers skip work for columns that are absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLayout {
    pub components: [Option<usize>; COMPONENT_COUNT],
    pub has_treatment: Option<usize>,
    pub msi_marker: Option<usize>,
    pub ras_marker: Option<usize>,
    feature_count: usize,
    treatment_mask: Vec<bool>,
}

impl FeatureLayout {
    pub fn resolve(feature_names: &[String]) -> Self {
        let position = |name: &str| feature_names.iter().position(|f| f == name);
        let mut components = [None; COMPONENT_COUNT];
        for (slot, column) in components.iter_mut().zip(TREATMENT_COMPONENT_COLUMNS) {
            *slot = position(column);
        }
        Self {
            components,
            has_treatment: position(HAS_TREATMENT_COLUMN),
            msi_marker: position(MSI_MARKER_COLUMN),
            ras_marker: position(RAS_MARKER_COLUMN),
            feature_count: feature_names.len(),
            treatment_mask: feature_names
                .iter()
                .map(|name| is_treatment_column(name))
                .collect(),
        }
    }

    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    /// Columns usable as baseline covariates for matching.
    pub fn matching_columns(&self) -> Vec<usize> {
        self.treatment_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &is_treatment)| (!is_treatment).then_some(i))
            .collect()
    }

    /// Component columns present in the table.
    pub fn present_components(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.components
            .iter()
            .enumerate()
            .filter_map(|(component, column)| column.map(|c| (component, c)))
    }
}

/// One row per patient-tumor with features, targets and observed task index.
#[derive(Debug, Clone)]
pub struct PatientTable {
    pub ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub features: Array2<f64>,
    pub targets: SurvivalTargets,
    pub task_indices: Vec<usize>,
}

impl PatientTable {
    pub fn new(
        ids: Vec<String>,
        feature_names: Vec<String>,
        features: Array2<f64>,
        targets: SurvivalTargets,
        task_indices: Vec<usize>,
        catalog: &TreatmentCatalog,
    ) -> Result<Self, DataError> {
        let n = features.nrows();
        if feature_names.is_empty() {
            return Err(DataError::NoFeatures);
        }
        if feature_names.len() != features.ncols() {
            return Err(DataError::LengthMismatch {
                name: "feature_names",
                expected: features.ncols(),
                found: feature_names.len(),
            });
        }
        for (name, len) in [
            ("ids", ids.len()),
            ("targets", targets.len()),
            ("task_indices", task_indices.len()),
        ] {
            if len != n {
                return Err(DataError::LengthMismatch {
                    name,
                    expected: n,
                    found: len,
                });
            }
        }
        for (column, name) in features.axis_iter(Axis(1)).zip(&feature_names) {
            if column.iter().any(|v| !v.is_finite()) {
                return Err(DataError::NonFiniteValuesFound(name.clone()));
            }
        }
        for (row, &index) in task_indices.iter().enumerate() {
            if index >= catalog.len() {
                return Err(DataError::TaskIndexOutOfRange {
                    row,
                    index,
                    size: catalog.len(),
                });
            }
        }
        Ok(Self {
            ids,
            feature_names,
            features,
            targets,
            task_indices,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn feature_layout(&self) -> FeatureLayout {
        FeatureLayout::resolve(&self.feature_names)
    }

    pub fn features(&self) -> ArrayView2<'_, f64> {
        self.features.view()
    }

    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            ids: rows.iter().map(|&r| self.ids[r].clone()).collect(),
            feature_names: self.feature_names.clone(),
            features: self.features.select(Axis(0), rows),
            targets: self.targets.subset(rows),
            task_indices: rows.iter().map(|&r| self.task_indices[r]).collect(),
        }
    }

    /// Rows whose component indicator columns disagree with their task index.
    pub fn component_mismatches(&self, catalog: &TreatmentCatalog) -> Vec<usize> {
        let layout = self.feature_layout();
        let mut rows = Vec::new();
        for (row, &task) in self.task_indices.iter().enumerate() {
            let Some(arm) = catalog.arm(task) else {
                rows.push(row);
                continue;
            };
            let disagrees = layout.present_components().any(|(component, column)| {
                let observed = u8::from(self.features[(row, column)] > 0.5);
                observed != arm.components[component]
            });
            if disagrees {
                rows.push(row);
            }
        }
        rows
    }
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };

    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn build_patient_ids(df: &DataFrame, has_ids: bool) -> Result<Vec<String>, DataError> {
    let n = df.height();
    if !has_ids {
        return Ok((1..=n).map(|i| i.to_string()).collect());
    }
    let series = df.column(PATIENT_ID_COLUMN)?;
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let value = series.get(i).unwrap_or(AnyValue::Null);
        ids.push(match value {
            AnyValue::Null => (i + 1).to_string(),
            AnyValue::String(text) => text.to_string(),
            other => other.to_string(),
        });
    }
    Ok(ids)
}

/// Reads a tab-separated patient table.
pub fn load_patient_table(
    path: impl AsRef<Path>,
    catalog: &TreatmentCatalog,
) -> Result<PatientTable, DataError> {
    let path = path.as_ref();
    log::info!("Loading patient table from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let present: HashSet<&str> = columns.iter().map(String::as_str).collect();
    for required in [DURATION_COLUMN, EVENT_COLUMN, TASK_INDEX_COLUMN] {
        if !present.contains(required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let reserved = [
        DURATION_COLUMN,
        EVENT_COLUMN,
        TASK_INDEX_COLUMN,
        PATIENT_ID_COLUMN,
    ];
    let feature_names: Vec<String> = columns
        .iter()
        .filter(|c| !reserved.contains(&c.as_str()))
        .cloned()
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoFeatures);
    }

    let n = df.height();
    let mut features = Array2::<f64>::zeros((n, feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        let values = extract_numeric_column(&df, name)?;
        features.column_mut(j).assign(&Array1::from_vec(values));
    }

    let durations = Array1::from_vec(extract_numeric_column(&df, DURATION_COLUMN)?);
    let events = Array1::from_vec(extract_numeric_column(&df, EVENT_COLUMN)?);
    let targets = SurvivalTargets::new(durations, events)?;

    let raw_tasks = extract_numeric_column(&df, TASK_INDEX_COLUMN)?;
    let mut task_indices = Vec::with_capacity(n);
    for (row, value) in raw_tasks.into_iter().enumerate() {
        if value < 0.0 || value.fract() != 0.0 {
            return Err(DataError::InvalidTaskIndex(row));
        }
        task_indices.push(value as usize);
    }

    let ids = build_patient_ids(&df, present.contains(PATIENT_ID_COLUMN))?;
    let table = PatientTable::new(ids, feature_names, features, targets, task_indices, catalog)?;

    let mismatches = table.component_mismatches(catalog);
    if !mismatches.is_empty() {
        log::warn!(
            "{} rows have treatment component columns that disagree with their treatment group",
            mismatches.len()
        );
    }
    log::info!(
        "Loaded {} patients with {} features ({} events)",
        table.n_samples(),
        table.n_features(),
        table.targets.event_count()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        Ok(file)
    }

    #[test]
    fn loads_features_targets_and_tasks() {
        let content = "patient_id\tage\thasMsi\tsystemicTreatmentPlan_5-FU\tduration\tevent\ttreatment_group_idx\n\
                       p1\t61\t0\t0\t120\t1\t0\n\
                       p2\t55\t1\t1\t400\t0\t1\n\
                       p3\t70\t0\t1\t30\t1\t1";
        let file = create_test_tsv(content).unwrap();
        let table = load_patient_table(file.path(), &TreatmentCatalog::standard()).unwrap();
        assert_eq!(table.n_samples(), 3);
        assert_eq!(
            table.feature_names,
            vec!["age", "hasMsi", "systemicTreatmentPlan_5-FU"]
        );
        assert_eq!(table.ids, vec!["p1", "p2", "p3"]);
        assert_eq!(table.task_indices, vec![0, 1, 1]);
        assert_eq!(table.targets.event_count(), 2);
        assert_eq!(table.features[(1, 0)], 55.0);
        assert!(table.component_mismatches(&TreatmentCatalog::standard()).is_empty());
    }

    #[test]
    fn missing_duration_column_is_reported() {
        let content = "age\tevent\ttreatment_group_idx\n61\t1\t0";
        let file = create_test_tsv(content).unwrap();
        let err = load_patient_table(file.path(), &TreatmentCatalog::standard()).unwrap_err();
        assert!(matches!(err, DataError::ColumnNotFound(ref c) if c == "duration"));
    }

    #[test]
    fn out_of_catalog_task_index_is_rejected() {
        let content = "age\tduration\tevent\ttreatment_group_idx\n61\t10\t1\t42";
        let file = create_test_tsv(content).unwrap();
        let err = load_patient_table(file.path(), &TreatmentCatalog::standard()).unwrap_err();
        assert!(matches!(err, DataError::TaskIndexOutOfRange { index: 42, .. }));
    }

    #[test]
    fn invalid_event_flags_are_rejected() {
        let err = SurvivalTargets::new(array![1.0, 2.0], array![0.0, 2.0]).unwrap_err();
        assert!(matches!(err, DataError::InvalidEventFlag(1)));
    }

    #[test]
    fn layout_excludes_treatment_columns_from_matching() {
        let names: Vec<String> = [
            "age",
            "systemicTreatmentPlan_5-FU",
            "hasTreatment",
            "hasMsi",
            "systemicTreatmentPlan_nivolumab",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let layout = FeatureLayout::resolve(&names);
        assert_eq!(layout.matching_columns(), vec![0, 3]);
        assert_eq!(layout.components[0], Some(1));
        assert_eq!(layout.components[6], Some(4));
        assert_eq!(layout.components[2], None);
        assert_eq!(layout.has_treatment, Some(2));
        assert_eq!(layout.msi_marker, Some(3));
        assert_eq!(layout.ras_marker, None);
    }

    #[test]
    fn detects_component_mismatches() {
        let catalog = TreatmentCatalog::standard();
        let names = vec!["systemicTreatmentPlan_5-FU".to_string()];
        let table = PatientTable::new(
            vec!["a".into(), "b".into()],
            names,
            array![[1.0], [1.0]],
            SurvivalTargets::new(array![10.0, 20.0], array![1.0, 0.0]).unwrap(),
            vec![1, 0],
            &catalog,
        )
        .unwrap();
        assert_eq!(table.component_mismatches(&catalog), vec![1]);
    }
}
