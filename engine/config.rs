//! # Configuration
//!
//! Immutable run settings and model hyperparameters. Both are plain serde
//! structs loaded from TOML; a fold or scenario that needs a different horizon
//! clones and overrides (`Settings::with_evaluation_days`) instead of writing
//! into a shared instance.

use crate::benefit::calibration::BinningStrategy;
use crate::benefit::cfb::BenefitEstimator;
use crate::benefit::matching::MatchingMode;
use crate::catalog::CatalogKind;
use crate::net::gate::{GateStrength, RuleGatePolicy};
use crate::net::layers::Activation;
use crate::net::optim::OptimizerKind;
use crate::survival::variant::SurvivalVariant;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown activation '{0}' (expected relu, elu or swish)")]
    UnknownActivation(String),
    #[error("unknown optimizer '{0}' (expected adam or rmsprop)")]
    UnknownOptimizer(String),
    #[error("unknown survival variant '{0}'")]
    UnknownVariant(String),
    #[error("unknown outcome '{0}' (expected os or pfs)")]
    UnknownOutcome(String),
    #[error("hidden layer widths must be non-empty and strictly positive")]
    InvalidHiddenLayers,
    #[error("dropout must lie in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error("learning rate must be positive and finite, got {0}")]
    InvalidLearningRate(f64),
    #[error("{0} must be strictly positive")]
    NonPositive(&'static str),
    #[error("invalid time grid: {0}")]
    InvalidTimeGrid(String),
    #[error("{0}")]
    OutOfRange(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The survival endpoint being modelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Outcome {
    OverallSurvival,
    ProgressionFreeSurvival,
}

impl FromStr for Outcome {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "os" | "overall_survival" => Ok(Outcome::OverallSurvival),
            "pfs" | "progression_free_survival" => Ok(Outcome::ProgressionFreeSurvival),
            other => Err(ConfigError::UnknownOutcome(other.to_string())),
        }
    }
}

impl TryFrom<String> for Outcome {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Outcome> for String {
    fn from(value: Outcome) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::OverallSurvival => write!(f, "os"),
            Outcome::ProgressionFreeSurvival => write!(f, "pfs"),
        }
    }
}

impl Outcome {
    /// Longest follow-up horizon (days) considered for this endpoint.
    pub fn max_time(self) -> f64 {
        match self {
            Outcome::OverallSurvival => 1825.0,
            Outcome::ProgressionFreeSurvival => 1095.0,
        }
    }

    fn quarters(self) -> usize {
        match self {
            Outcome::OverallSurvival => 20,
            Outcome::ProgressionFreeSurvival => 12,
        }
    }

    fn months(self) -> usize {
        self.quarters() * 3
    }
}

/// Run-wide evaluation settings shared by training, evaluation and the benefit engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub outcome: Outcome,
    /// Horizon tau (days) at which benefit is measured.
    pub evaluation_days: f64,
    pub max_time: f64,
    /// Candidate evaluation times for the standard survival metrics.
    pub time_points: Vec<f64>,
    /// Cut points of the discretization grid shared by all tasks.
    pub time_bins: Vec<f64>,
    pub cv_splits: usize,
    pub n_jobs: usize,
    pub random_state: u64,
    pub test_fraction: f64,
    pub calibration_bins: usize,
    pub binning: BinningStrategy,
    pub estimator: BenefitEstimator,
    pub matching: MatchingMode,
    /// Treatment groups that tasks and counterfactual queries range over.
    pub catalog: CatalogKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self::for_outcome(Outcome::OverallSurvival)
    }
}

impl Settings {
    pub fn for_outcome(outcome: Outcome) -> Self {
        let time_points = (1..=outcome.quarters())
            .map(|i| (i as f64 * 365.0 / 4.0).round())
            .collect();
        let time_bins = std::iter::once(0.0)
            .chain((1..=outcome.months()).map(|i| (i as f64 * 365.0 / 12.0).round()))
            .collect();
        Self {
            outcome,
            evaluation_days: 365.0,
            max_time: outcome.max_time(),
            time_points,
            time_bins,
            cv_splits: 5,
            n_jobs: 4,
            random_state: 42,
            test_fraction: 0.2,
            calibration_bins: 10,
            binning: BinningStrategy::Quantile,
            estimator: BenefitEstimator::MeanIte,
            matching: MatchingMode::ManyToOne,
            catalog: CatalogKind::Standard,
        }
    }

    /// Returns a copy measuring benefit at a different horizon.
    pub fn with_evaluation_days(&self, days: f64) -> Self {
        Self {
            evaluation_days: days,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.evaluation_days > 0.0 && self.evaluation_days.is_finite()) {
            return Err(ConfigError::NonPositive("evaluation_days"));
        }
        if !(self.max_time > 0.0 && self.max_time.is_finite()) {
            return Err(ConfigError::NonPositive("max_time"));
        }
        if self.cv_splits < 2 {
            return Err(ConfigError::OutOfRange(
                "cv_splits must be at least 2".to_string(),
            ));
        }
        if self.n_jobs == 0 {
            return Err(ConfigError::NonPositive("n_jobs"));
        }
        if self.calibration_bins == 0 {
            return Err(ConfigError::NonPositive("calibration_bins"));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::OutOfRange(format!(
                "test_fraction must lie in (0, 1), got {}",
                self.test_fraction
            )));
        }
        check_increasing("time_points", &self.time_points, 1)?;
        check_increasing("time_bins", &self.time_bins, 2)?;
        Ok(())
    }
}

fn check_increasing(name: &str, values: &[f64], min_len: usize) -> Result<(), ConfigError> {
    if values.len() < min_len {
        return Err(ConfigError::InvalidTimeGrid(format!(
            "{name} needs at least {min_len} points"
        )));
    }
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(ConfigError::InvalidTimeGrid(format!(
            "{name} must be finite and non-negative"
        )));
    }
    if values.windows(2).any(|w| w[1] <= w[0]) {
        return Err(ConfigError::InvalidTimeGrid(format!(
            "{name} must be strictly increasing"
        )));
    }
    Ok(())
}

/// How the rule-based biomarker gates are wired into the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleGateConfig {
    pub policy: RuleGatePolicy,
    pub strength: GateStrength,
}

impl Default for RuleGateConfig {
    fn default() -> Self {
        Self {
            policy: RuleGatePolicy::Inputs,
            strength: GateStrength::Hard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self {
            patience: 5,
            min_delta: 1e-4,
        }
    }
}

/// Hyperparameters of a neural survival model (multi-task or single-task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub variant: SurvivalVariant,
    pub hidden_layers: Vec<usize>,
    pub activation: Activation,
    pub dropout: f64,
    pub batch_norm: bool,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    pub batch_size: usize,
    pub epochs: usize,
    pub use_attention: bool,
    pub rule_gate: RuleGateConfig,
    pub early_stopping: EarlyStopping,
    /// Weight of the likelihood term in the rank-based loss.
    pub rank_alpha: f64,
    /// Bandwidth of the rank-based ranking penalty.
    pub rank_sigma: f64,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            variant: SurvivalVariant::LogisticHazard,
            hidden_layers: vec![128, 64],
            activation: Activation::Relu,
            dropout: 0.1,
            batch_norm: true,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            optimizer: OptimizerKind::Adam,
            batch_size: 128,
            epochs: 50,
            use_attention: true,
            rule_gate: RuleGateConfig::default(),
            early_stopping: EarlyStopping::default(),
            rank_alpha: 0.2,
            rank_sigma: 0.1,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Defaults used by the single-task baselines.
    pub fn single_task() -> Self {
        Self {
            batch_size: 64,
            use_attention: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hidden_layers.is_empty() || self.hidden_layers.contains(&0) {
            return Err(ConfigError::InvalidHiddenLayers);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::InvalidDropout(self.dropout));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ConfigError::InvalidLearningRate(self.learning_rate));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive("batch_size"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::NonPositive("epochs"));
        }
        if !(self.rank_sigma > 0.0) {
            return Err(ConfigError::NonPositive("rank_sigma"));
        }
        if !(0.0..=1.0).contains(&self.rank_alpha) {
            return Err(ConfigError::OutOfRange(format!(
                "rank_alpha must lie in [0, 1], got {}",
                self.rank_alpha
            )));
        }
        if self.weight_decay < 0.0 || !self.weight_decay.is_finite() {
            return Err(ConfigError::NonPositive("weight_decay"));
        }
        Ok(())
    }
}

/// Hyperparameters of the linear proportional-hazards baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearCoxConfig {
    /// Ridge penalty on the coefficients.
    pub penalizer: f64,
    pub variance_threshold: f64,
    pub correlation_threshold: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LinearCoxConfig {
    fn default() -> Self {
        Self {
            penalizer: 0.1,
            variance_threshold: 1e-5,
            correlation_threshold: 0.95,
            max_iterations: 500,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    MultiTask,
    SingleTask,
    LinearCox,
}

/// One model to train and evaluate in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub network: Option<ModelConfig>,
    #[serde(default)]
    pub linear: Option<LinearCoxConfig>,
}

/// Top-level run file: settings plus the list of models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(text)?;
        config.settings.validate()?;
        for entry in &config.models {
            if let Some(network) = &entry.network {
                network.validate()?;
            }
        }
        Ok(config)
    }
}
