use super::layers::Param;
use crate::config::ConfigError;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const RMSPROP_ALPHA: f64 = 0.99;
const OPTIMIZER_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    RmsProp,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            other => Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(value: OptimizerKind) -> Self {
        value.to_string()
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam => f.write_str("adam"),
            OptimizerKind::RmsProp => f.write_str("rmsprop"),
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    first: Array2<f64>,
    second: Array2<f64>,
}

/// First-order optimizer with L2 weight decay folded into the gradient.
///
/// Moment buffers are matched to parameters by position, so callers must pass
/// parameters in the same order on every step.
#[derive(Debug, Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    learning_rate: f64,
    weight_decay: f64,
    moments: Vec<Moments>,
    steps: i32,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            kind,
            learning_rate,
            weight_decay,
            moments: Vec::new(),
            steps: 0,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn step(&mut self, params: Vec<&mut Param>) {
        if self.moments.len() != params.len() {
            self.moments = params
                .iter()
                .map(|p| Moments {
                    first: Array2::zeros(p.value.raw_dim()),
                    second: Array2::zeros(p.value.raw_dim()),
                })
                .collect();
            self.steps = 0;
        }
        self.steps += 1;
        let lr = self.learning_rate;
        let wd = self.weight_decay;
        let bias1 = 1.0 - ADAM_BETA1.powi(self.steps);
        let bias2 = 1.0 - ADAM_BETA2.powi(self.steps);

        for (param, moments) in params.into_iter().zip(self.moments.iter_mut()) {
            match self.kind {
                OptimizerKind::Adam => {
                    Zip::from(&mut param.value)
                        .and(&param.grad)
                        .and(&mut moments.first)
                        .and(&mut moments.second)
                        .for_each(|w, &g, m, v| {
                            let g = g + wd * *w;
                            *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                            *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                            let m_hat = *m / bias1;
                            let v_hat = *v / bias2;
                            *w -= lr * m_hat / (v_hat.sqrt() + OPTIMIZER_EPS);
                        });
                }
                OptimizerKind::RmsProp => {
                    Zip::from(&mut param.value)
                        .and(&param.grad)
                        .and(&mut moments.second)
                        .for_each(|w, &g, v| {
                            let g = g + wd * *w;
                            *v = RMSPROP_ALPHA * *v + (1.0 - RMSPROP_ALPHA) * g * g;
                            *w -= lr * g / (v.sqrt() + OPTIMIZER_EPS);
                        });
                }
            }
        }
    }
}
