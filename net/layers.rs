use crate::config::ConfigError;
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BATCH_NORM_EPS: f64 = 1e-5;
const BATCH_NORM_MOMENTUM: f64 = 0.1;

/// A learnable tensor and its accumulated gradient.
///
/// Vectors (biases, batch-norm scales) are stored as `1 x d` rows so every
/// parameter shares one optimizer code path.
#[derive(Debug, Clone)]
pub struct Param {
    pub value: Array2<f64>,
    pub grad: Array2<f64>,
}

impl Param {
    pub fn new(value: Array2<f64>) -> Self {
        let grad = Array2::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }
}

/// Fully connected layer `y = x W + b`, with `W` stored as `in x out`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
}

impl Linear {
    /// Uniform initialisation in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let weight = Array2::from_shape_fn((in_features, out_features), |_| dist.sample(rng));
        let bias = Array2::from_shape_fn((1, out_features), |_| dist.sample(rng));
        Self {
            weight: Param::new(weight),
            bias: Param::new(bias),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weight.value) + &self.bias.value
    }

    /// Accumulates parameter gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, input: ArrayView2<'_, f64>, grad_out: ArrayView2<'_, f64>) -> Array2<f64> {
        self.weight.grad += &input.t().dot(&grad_out);
        self.bias.grad += &grad_out.sum_axis(Axis(0)).insert_axis(Axis(0));
        grad_out.dot(&self.weight.value.t())
    }

    pub fn params_mut(&mut self) -> [&mut Param; 2] {
        [&mut self.weight, &mut self.bias]
    }
}

/// Trunk activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Activation {
    Relu,
    Elu,
    Swish,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "elu" => Ok(Activation::Elu),
            "swish" | "silu" => Ok(Activation::Swish),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Activation {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Activation> for String {
    fn from(value: Activation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Elu => "elu",
            Activation::Swish => "swish",
        };
        f.write_str(name)
    }
}

impl Activation {
    pub fn apply(self, pre: &Array2<f64>) -> Array2<f64> {
        match self {
            Activation::Relu => pre.mapv(|v| v.max(0.0)),
            Activation::Elu => pre.mapv(|v| if v > 0.0 { v } else { v.exp_m1() }),
            Activation::Swish => pre.mapv(|v| v * sigmoid(v)),
        }
    }

    /// Multiplies `grad_out` by the derivative evaluated at `pre`.
    pub fn backward(self, pre: &Array2<f64>, grad_out: &Array2<f64>) -> Array2<f64> {
        let mut grad = grad_out.clone();
        Zip::from(&mut grad).and(pre).for_each(|g, &v| {
            let d = match self {
                Activation::Relu => {
                    if v > 0.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Activation::Elu => {
                    if v > 0.0 {
                        1.0
                    } else {
                        v.exp()
                    }
                }
                Activation::Swish => {
                    let s = sigmoid(v);
                    s + v * s * (1.0 - s)
                }
            };
            *g *= d;
        });
        grad
    }
}

/// Numerically stable logistic function.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `log(1 + exp(x))` without overflow.
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else if x < -30.0 {
        x.exp()
    } else {
        x.exp().ln_1p()
    }
}

/// Saved statistics needed to backpropagate through a batch-norm layer.
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: Array2<f64>,
    inv_std: Array1<f64>,
    /// Running statistics were used (batch of one), so the layer acts as a fixed affine map.
    frozen: bool,
}

#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    pub gamma: Param,
    pub beta: Param,
    pub running_mean: Array1<f64>,
    pub running_var: Array1<f64>,
}

impl BatchNorm1d {
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Param::new(Array2::ones((1, features))),
            beta: Param::new(Array2::zeros((1, features))),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
        }
    }

    pub fn forward_eval(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let inv_std = self.running_var.mapv(|v| 1.0 / (v + BATCH_NORM_EPS).sqrt());
        let normalized = (&x - &self.running_mean) * &inv_std;
        normalized * &self.gamma.value + &self.beta.value
    }

    pub fn forward_train(&mut self, x: ArrayView2<'_, f64>) -> (Array2<f64>, BatchNormCache) {
        let n = x.nrows();
        if n < 2 {
            let inv_std = self.running_var.mapv(|v| 1.0 / (v + BATCH_NORM_EPS).sqrt());
            let normalized = (&x - &self.running_mean) * &inv_std;
            let out = &normalized * &self.gamma.value + &self.beta.value;
            return (
                out,
                BatchNormCache {
                    normalized,
                    inv_std,
                    frozen: true,
                },
            );
        }
        let nf = n as f64;
        let mean = x.sum_axis(Axis(0)) / nf;
        let centered = &x - &mean;
        let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / nf;
        let inv_std = var.mapv(|v| 1.0 / (v + BATCH_NORM_EPS).sqrt());
        let normalized = &centered * &inv_std;
        let out = &normalized * &self.gamma.value + &self.beta.value;

        let unbiased = &var * (nf / (nf - 1.0));
        self.running_mean = &self.running_mean * (1.0 - BATCH_NORM_MOMENTUM) + &mean * BATCH_NORM_MOMENTUM;
        self.running_var =
            &self.running_var * (1.0 - BATCH_NORM_MOMENTUM) + &unbiased * BATCH_NORM_MOMENTUM;

        (
            out,
            BatchNormCache {
                normalized,
                inv_std,
                frozen: false,
            },
        )
    }

    pub fn backward(&mut self, cache: &BatchNormCache, grad_out: &Array2<f64>) -> Array2<f64> {
        let gamma = self.gamma.value.row(0).to_owned();
        self.gamma.grad += &(grad_out * &cache.normalized)
            .sum_axis(Axis(0))
            .insert_axis(Axis(0));
        self.beta.grad += &grad_out.sum_axis(Axis(0)).insert_axis(Axis(0));

        let grad_norm = grad_out * &gamma;
        if cache.frozen {
            return grad_norm * &cache.inv_std;
        }
        let n = grad_out.nrows() as f64;
        let sum_grad = grad_norm.sum_axis(Axis(0));
        let sum_grad_norm = (&grad_norm * &cache.normalized).sum_axis(Axis(0));
        let mut grad_in = &grad_norm * n - &sum_grad - &(&cache.normalized * &sum_grad_norm);
        grad_in *= &(&cache.inv_std / n);
        grad_in
    }

    pub fn params_mut(&mut self) -> [&mut Param; 2] {
        [&mut self.gamma, &mut self.beta]
    }
}

/// Inverted dropout mask: kept units are scaled by `1 / (1 - p)`.
pub fn dropout_mask<R: Rng + ?Sized>(shape: (usize, usize), p: f64, rng: &mut R) -> Array2<f64> {
    if p <= 0.0 {
        return Array2::ones(shape);
    }
    let keep = 1.0 - p;
    let scale = 1.0 / keep;
    Array2::from_shape_fn(shape, |_| {
        if rng.gen_range(0.0..1.0) < keep {
            scale
        } else {
            0.0
        }
    })
}
