//! # Treatment catalog
//!
//! The ordered, fixed list of mutually exclusive treatment groups. Each group is
//! both a task index for the multi-task network and a 0/1 vector over the
//! treatment component indicator columns that the counterfactual predictor
//! overwrites.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Indicator columns that encode the systemic treatment plan, in catalog vector order.
pub const TREATMENT_COMPONENT_COLUMNS: [&str; 7] = [
    "systemicTreatmentPlan_5-FU",
    "systemicTreatmentPlan_oxaliplatin",
    "systemicTreatmentPlan_irinotecan",
    "systemicTreatmentPlan_bevacizumab",
    "systemicTreatmentPlan_panitumumab",
    "systemicTreatmentPlan_pembrolizumab",
    "systemicTreatmentPlan_nivolumab",
];

pub const COMPONENT_COUNT: usize = TREATMENT_COMPONENT_COLUMNS.len();

/// Derived flag set whenever any component indicator is non-zero.
pub const HAS_TREATMENT_COLUMN: &str = "hasTreatment";

/// Column holding the index of the observed treatment group.
pub const TASK_INDEX_COLUMN: &str = "treatment_group_idx";

/// Label of the all-zero arm every counterfactual contrast is measured against.
pub const REFERENCE_ARM: &str = "No Treatment";

pub const PEMBROLIZUMAB_ARM: &str = "PEMBROLIZUMAB";
pub const PANITUMUMAB_ARM: &str = "5-FU + oxaliplatin + panitumumab";

// Positions inside the component vector.
pub const COMPONENT_PANITUMUMAB: usize = 4;
pub const COMPONENT_PEMBROLIZUMAB: usize = 5;
pub const COMPONENT_NIVOLUMAB: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("treatment catalog must contain at least one arm")]
    Empty,
    #[error("treatment label '{0}' appears more than once")]
    DuplicateLabel(String),
    #[error("treatment '{label}' reuses the component vector of '{other}'")]
    DuplicateComponents { label: String, other: String },
    #[error("the reference arm 'No Treatment' must be present with an all-zero component vector")]
    MissingReference,
    #[error("component values must be 0 or 1 (treatment '{0}')")]
    InvalidComponent(String),
    #[error("unknown treatment label '{0}'")]
    UnknownLabel(String),
}

/// A named treatment group and its component indicator vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentArm {
    pub label: String,
    pub components: [u8; COMPONENT_COUNT],
}

impl TreatmentArm {
    pub fn new(label: impl Into<String>, components: [u8; COMPONENT_COUNT]) -> Self {
        Self {
            label: label.into(),
            components,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.components.iter().all(|&c| c == 0)
    }

    /// Value of the derived `hasTreatment` flag for this arm.
    pub fn has_treatment(&self) -> f64 {
        if self.is_reference() { 0.0 } else { 1.0 }
    }
}

/// Ordered treatment groups; the position of an arm is its task index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentCatalog {
    arms: Vec<TreatmentArm>,
}

impl TreatmentCatalog {
    pub fn new(arms: Vec<TreatmentArm>) -> Result<Self, CatalogError> {
        if arms.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut labels = AHashSet::with_capacity(arms.len());
        for (i, arm) in arms.iter().enumerate() {
            if arm.components.iter().any(|&c| c > 1) {
                return Err(CatalogError::InvalidComponent(arm.label.clone()));
            }
            if !labels.insert(arm.label.as_str()) {
                return Err(CatalogError::DuplicateLabel(arm.label.clone()));
            }
            if let Some(other) = arms[..i].iter().find(|o| o.components == arm.components) {
                return Err(CatalogError::DuplicateComponents {
                    label: arm.label.clone(),
                    other: other.label.clone(),
                });
            }
        }
        let has_reference = arms
            .iter()
            .any(|arm| arm.label == REFERENCE_ARM && arm.is_reference());
        if !has_reference {
            return Err(CatalogError::MissingReference);
        }
        Ok(Self { arms })
    }

    /// The ten treatment groups used as tasks for colorectal metastasis cohorts.
    pub fn standard() -> Self {
        Self {
            arms: standard_arms(),
        }
    }

    /// The standard groups plus combinations that only occur as counterfactual queries.
    pub fn extended() -> Self {
        let mut arms = standard_arms();
        arms.push(TreatmentArm::new("5-FU + bevacizumab", [1, 0, 0, 1, 0, 0, 0]));
        arms.push(TreatmentArm::new(
            "5-FU + irinotecan + panitumumab",
            [1, 0, 1, 0, 1, 0, 0],
        ));
        Self { arms }
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    pub fn arms(&self) -> &[TreatmentArm] {
        &self.arms
    }

    pub fn arm(&self, index: usize) -> Option<&TreatmentArm> {
        self.arms.get(index)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.arms.iter().position(|arm| arm.label == label)
    }

    pub fn require(&self, label: &str) -> Result<(usize, &TreatmentArm), CatalogError> {
        self.index_of(label)
            .map(|idx| (idx, &self.arms[idx]))
            .ok_or_else(|| CatalogError::UnknownLabel(label.to_string()))
    }

    pub fn reference_index(&self) -> usize {
        // Construction guarantees the reference arm exists.
        self.index_of(REFERENCE_ARM).unwrap_or(0)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.arms.iter().map(|arm| arm.label.as_str())
    }

    /// Finds the arm whose component vector equals `components`.
    pub fn match_components(&self, components: &[u8; COMPONENT_COUNT]) -> Option<usize> {
        self.arms.iter().position(|arm| &arm.components == components)
    }
}

/// Which built-in catalog a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    #[default]
    Standard,
    /// Standard arms plus combinations only queried counterfactually.
    Extended,
}

impl CatalogKind {
    pub fn build(self) -> TreatmentCatalog {
        match self {
            CatalogKind::Standard => TreatmentCatalog::standard(),
            CatalogKind::Extended => TreatmentCatalog::extended(),
        }
    }
}

impl Default for TreatmentCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_arms() -> Vec<TreatmentArm> {
    vec![
        TreatmentArm::new(REFERENCE_ARM, [0, 0, 0, 0, 0, 0, 0]),
        TreatmentArm::new("5-FU", [1, 0, 0, 0, 0, 0, 0]),
        TreatmentArm::new("5-FU + oxaliplatin", [1, 1, 0, 0, 0, 0, 0]),
        TreatmentArm::new("5-FU + oxaliplatin + bevacizumab", [1, 1, 0, 1, 0, 0, 0]),
        TreatmentArm::new(PANITUMUMAB_ARM, [1, 1, 0, 0, 1, 0, 0]),
        TreatmentArm::new("5-FU + irinotecan", [1, 0, 1, 0, 0, 0, 0]),
        TreatmentArm::new("5-FU + irinotecan + bevacizumab", [1, 0, 1, 1, 0, 0, 0]),
        TreatmentArm::new("5-FU + oxaliplatin + irinotecan", [1, 1, 1, 0, 0, 0, 0]),
        TreatmentArm::new(
            "5-FU + oxaliplatin + irinotecan + bevacizumab",
            [1, 1, 1, 1, 0, 0, 0],
        ),
        TreatmentArm::new(PEMBROLIZUMAB_ARM, [0, 0, 0, 0, 0, 1, 0]),
    ]
}

/// Lower-case slug of a treatment label for flat metric names.
///
/// `"5-FU + oxaliplatin"` becomes `"5_fu_oxaliplatin"`.
pub fn metric_key(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_separator = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    out
}

/// True for columns that encode treatment and must never act as matching covariates.
pub fn is_treatment_column(name: &str) -> bool {
    name == HAS_TREATMENT_COLUMN
        || name == TASK_INDEX_COLUMN
        || name.starts_with("systemicTreatmentPlan")
        || TREATMENT_COMPONENT_COLUMNS.contains(&name)
}
