//! Feature gates applied before the shared trunk and, optionally, to the task
//! head outputs.
//!
//! The learned gate reweights every feature by `sigmoid(MLP(x))`. The rule gate
//! encodes biomarker priors: an immunotherapy signal only counts for MSI-high
//! tumours and anti-EGFR treatment only for RAS wild-type tumours.

use super::layers::{Linear, Param, sigmoid};
use crate::catalog::{
    COMPONENT_NIVOLUMAB, COMPONENT_PANITUMUMAB, COMPONENT_PEMBROLIZUMAB, PANITUMUMAB_ARM,
    PEMBROLIZUMAB_ARM, TreatmentCatalog,
};
use crate::config::RuleGateConfig;
use crate::data::FeatureLayout;
use ndarray::{Array2, ArrayView2, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Element-wise learned gate `x * sigmoid(W2 tanh(W1 x + b1) + b2)`.
#[derive(Debug, Clone)]
pub struct FeatureAttention {
    pub hidden: Linear,
    pub output: Linear,
}

#[derive(Debug, Clone)]
pub struct AttentionCache {
    input: Array2<f64>,
    hidden: Array2<f64>,
    weights: Array2<f64>,
}

impl FeatureAttention {
    pub fn new<R: Rng + ?Sized>(features: usize, rng: &mut R) -> Self {
        Self {
            hidden: Linear::new(features, features, rng),
            output: Linear::new(features, features, rng),
        }
    }

    /// Per-feature weights in (0, 1).
    pub fn weights(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let hidden = self.hidden.forward(x).mapv(f64::tanh);
        self.output.forward(hidden.view()).mapv(sigmoid)
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        &x * &self.weights(x)
    }

    pub fn forward_train(&self, x: ArrayView2<'_, f64>) -> (Array2<f64>, AttentionCache) {
        let hidden = self.hidden.forward(x).mapv(f64::tanh);
        let weights = self.output.forward(hidden.view()).mapv(sigmoid);
        let out = &x * &weights;
        (
            out,
            AttentionCache {
                input: x.to_owned(),
                hidden,
                weights,
            },
        )
    }

    pub fn backward(&mut self, cache: &AttentionCache, grad_out: &Array2<f64>) -> Array2<f64> {
        let direct = grad_out * &cache.weights;
        let mut grad_logits = grad_out * &cache.input;
        Zip::from(&mut grad_logits)
            .and(&cache.weights)
            .for_each(|g, &w| *g *= w * (1.0 - w));
        let mut grad_hidden = self.output.backward(cache.hidden.view(), grad_logits.view());
        Zip::from(&mut grad_hidden)
            .and(&cache.hidden)
            .for_each(|g, &h| *g *= 1.0 - h * h);
        let through_gate = self.hidden.backward(cache.input.view(), grad_hidden.view());
        direct + through_gate
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params: Vec<&mut Param> = self.hidden.params_mut().into_iter().collect();
        params.extend(self.output.params_mut());
        params
    }
}

/// Where biomarker rules act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleGatePolicy {
    Disabled,
    /// Scale treatment indicator inputs before the learned gate.
    Inputs,
    /// Scale whole task-head outputs before the per-sample gather.
    Outputs,
    InputsAndOutputs,
}

/// Marker value at or above which a hard gate counts the biomarker as present.
pub const HARD_GATE_THRESHOLD: f64 = 0.5;

/// Hard gates threshold the marker at [`HARD_GATE_THRESHOLD`]; soft gates use
/// the marker value clamped to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStrength {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq)]
struct MarkerRule {
    marker: usize,
    /// Gate opens when the marker is absent (RAS wild-type) instead of present.
    invert: bool,
    input_columns: Vec<usize>,
    task: Option<usize>,
}

/// Biomarker rules resolved once from feature names. Rules whose marker
/// column is missing are dropped; missing target columns are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleGate {
    policy: RuleGatePolicy,
    strength: GateStrength,
    rules: Vec<MarkerRule>,
}

impl RuleGate {
    pub fn disabled() -> Self {
        Self {
            policy: RuleGatePolicy::Disabled,
            strength: GateStrength::Hard,
            rules: Vec::new(),
        }
    }

    pub fn resolve(
        layout: &FeatureLayout,
        catalog: &TreatmentCatalog,
        config: RuleGateConfig,
    ) -> Self {
        let mut rules = Vec::new();
        if let Some(marker) = layout.msi_marker {
            rules.push(MarkerRule {
                marker,
                invert: false,
                input_columns: [COMPONENT_PEMBROLIZUMAB, COMPONENT_NIVOLUMAB]
                    .iter()
                    .filter_map(|&c| layout.components[c])
                    .collect(),
                task: catalog.index_of(PEMBROLIZUMAB_ARM),
            });
        }
        if let Some(marker) = layout.ras_marker {
            rules.push(MarkerRule {
                marker,
                invert: true,
                input_columns: layout.components[COMPONENT_PANITUMUMAB]
                    .into_iter()
                    .collect(),
                task: catalog.index_of(PANITUMUMAB_ARM),
            });
        }
        if rules.is_empty() && config.policy != RuleGatePolicy::Disabled {
            log::debug!("No biomarker columns found; rule gates pass inputs through unchanged");
        }
        Self {
            policy: config.policy,
            strength: config.strength,
            rules,
        }
    }

    pub fn gates_inputs(&self) -> bool {
        matches!(
            self.policy,
            RuleGatePolicy::Inputs | RuleGatePolicy::InputsAndOutputs
        )
    }

    pub fn gates_outputs(&self) -> bool {
        matches!(
            self.policy,
            RuleGatePolicy::Outputs | RuleGatePolicy::InputsAndOutputs
        ) && self.rules.iter().any(|r| r.task.is_some())
    }

    fn factor(&self, marker_value: f64, invert: bool) -> f64 {
        let open = match self.strength {
            GateStrength::Hard => {
                if marker_value >= HARD_GATE_THRESHOLD {
                    1.0
                } else {
                    0.0
                }
            }
            GateStrength::Soft => marker_value.clamp(0.0, 1.0),
        };
        if invert { 1.0 - open } else { open }
    }

    /// Returns a gated copy of the inputs, or `None` when input gating is off.
    pub fn gate_inputs(&self, x: ArrayView2<'_, f64>) -> Option<Array2<f64>> {
        if !self.gates_inputs() {
            return None;
        }
        let mut gated = x.to_owned();
        for rule in &self.rules {
            for row in 0..gated.nrows() {
                let factor = self.factor(x[(row, rule.marker)], rule.invert);
                for &column in &rule.input_columns {
                    gated[(row, column)] *= factor;
                }
            }
        }
        Some(gated)
    }

    /// Per-sample, per-task multipliers `[n, num_tasks]`, or `None` when output gating is off.
    pub fn output_factors(&self, x: ArrayView2<'_, f64>, num_tasks: usize) -> Option<Array2<f64>> {
        if !self.gates_outputs() {
            return None;
        }
        let mut factors = Array2::ones((x.nrows(), num_tasks));
        for rule in &self.rules {
            let Some(task) = rule.task.filter(|&t| t < num_tasks) else {
                continue;
            };
            for row in 0..x.nrows() {
                factors[(row, task)] *= self.factor(x[(row, rule.marker)], rule.invert);
            }
        }
        Some(factors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn gate(policy: RuleGatePolicy, strength: GateStrength) -> RuleGate {
        let layout = FeatureLayout::resolve(&names(&[
            "hasMsi",
            "hasRasMutation",
            "systemicTreatmentPlan_pembrolizumab",
            "systemicTreatmentPlan_panitumumab",
            "age",
        ]));
        RuleGate::resolve(
            &layout,
            &TreatmentCatalog::standard(),
            RuleGateConfig { policy, strength },
        )
    }

    #[test]
    fn hard_input_gate_suppresses_biomarker_mismatched_treatments() {
        let g = gate(RuleGatePolicy::Inputs, GateStrength::Hard);
        // Row 0: MSI-high, RAS mutant. Row 1: MSS, RAS wild-type.
        let x = array![[1.0, 1.0, 1.0, 1.0, 60.0], [0.0, 0.0, 1.0, 1.0, 70.0]];
        let gated = g.gate_inputs(x.view()).unwrap();
        assert_eq!(gated[(0, 2)], 1.0);
        assert_eq!(gated[(0, 3)], 0.0);
        assert_eq!(gated[(1, 2)], 0.0);
        assert_eq!(gated[(1, 3)], 1.0);
        assert_eq!(gated[(1, 4)], 70.0);
        assert!(g.output_factors(x.view(), 10).is_none());
    }

    #[test]
    fn hard_gate_treats_weak_markers_as_absent() {
        let g = gate(RuleGatePolicy::InputsAndOutputs, GateStrength::Hard);
        // Both markers at 0.3: MSI counts as absent, RAS as wild-type.
        let x = array![[0.3, 0.3, 1.0, 1.0, 55.0], [0.5, 0.5, 1.0, 1.0, 55.0]];
        let gated = g.gate_inputs(x.view()).unwrap();
        assert_eq!(gated[(0, 2)], 0.0);
        assert_eq!(gated[(0, 3)], 1.0);
        assert_eq!(gated[(1, 2)], 1.0);
        assert_eq!(gated[(1, 3)], 0.0);
        let factors = g.output_factors(x.view(), 10).unwrap();
        assert_eq!(factors[(0, 9)], 0.0);
        assert_eq!(factors[(0, 4)], 1.0);
        assert_eq!(factors[(1, 9)], 1.0);

        let soft = gate(RuleGatePolicy::Inputs, GateStrength::Soft);
        let gated = soft.gate_inputs(x.view()).unwrap();
        assert_abs_diff_eq!(gated[(0, 2)], 0.3, epsilon = 1e-12);
        assert_abs_diff_eq!(gated[(0, 3)], 0.7, epsilon = 1e-12);
    }

    #[test]
    fn soft_output_gate_scales_task_columns() {
        let g = gate(RuleGatePolicy::Outputs, GateStrength::Soft);
        let x = array![[0.25, 0.75, 0.0, 0.0, 1.0]];
        assert!(g.gate_inputs(x.view()).is_none());
        let factors = g.output_factors(x.view(), 10).unwrap();
        assert_abs_diff_eq!(factors[(0, 9)], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(factors[(0, 4)], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(factors[(0, 0)], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_markers_skip_rules_without_panicking() {
        let layout = FeatureLayout::resolve(&names(&["age", "systemicTreatmentPlan_5-FU"]));
        let g = RuleGate::resolve(
            &layout,
            &TreatmentCatalog::standard(),
            RuleGateConfig {
                policy: RuleGatePolicy::InputsAndOutputs,
                strength: GateStrength::Hard,
            },
        );
        let x = array![[50.0, -0.5], [40.0, 1.2]];
        let gated = g.gate_inputs(x.view()).unwrap();
        assert_eq!(gated, x);
        assert!(g.output_factors(x.view(), 10).is_none());
    }

    #[test]
    fn attention_backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut attention = FeatureAttention::new(3, &mut rng);
        let x = array![[0.4, -1.2, 0.9], [1.1, 0.3, -0.6]];
        let upstream = array![[0.5, -0.3, 1.0], [0.2, 0.8, -0.4]];
        let (_, cache) = attention.forward_train(x.view());
        let grad_in = attention.backward(&cache, &upstream);

        let h = 1e-6;
        for (i, j) in [(0, 0), (1, 2), (0, 1)] {
            let mut xp = x.clone();
            xp[(i, j)] += h;
            let mut xm = x.clone();
            xm[(i, j)] -= h;
            let fp = (attention.forward(xp.view()) * &upstream).sum();
            let fm = (attention.forward(xm.view()) * &upstream).sum();
            assert_abs_diff_eq!(grad_in[(i, j)], (fp - fm) / (2.0 * h), epsilon = 1e-6);
        }
        let weights = attention.weights(x.view());
        assert!(weights.iter().all(|&w| w > 0.0 && w < 1.0));
    }
}
