use super::NetError;
use super::gate::{AttentionCache, FeatureAttention, RuleGate};
use super::layers::{Activation, Linear, Param};
use super::trunk::{SharedTrunk, TrunkCache};
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

/// Structural hyperparameters of a [`SurvivalNet`].
#[derive(Debug, Clone, PartialEq)]
pub struct NetArchitecture {
    pub input_size: usize,
    pub hidden_layers: Vec<usize>,
    pub activation: Activation,
    pub dropout: f64,
    pub batch_norm: bool,
    pub use_attention: bool,
    /// Width of each head: number of time bins, or 1 for a log-risk.
    pub output_size: usize,
    pub num_tasks: usize,
}

/// Everything [`SurvivalNet::backward`] needs from a training forward pass.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    attention: Option<AttentionCache>,
    trunk: TrunkCache,
    hidden: Array2<f64>,
    output_factors: Option<Array2<f64>>,
    tasks: Vec<usize>,
}

/// Gates, shared trunk and one linear head per task.
///
/// Every head is evaluated for every sample; each sample then keeps the row of
/// its own task. A network with a single head is the single-task baseline.
#[derive(Debug, Clone)]
pub struct SurvivalNet {
    attention: Option<FeatureAttention>,
    rule_gate: RuleGate,
    trunk: SharedTrunk,
    heads: Vec<Linear>,
    input_size: usize,
}

impl SurvivalNet {
    pub fn new<R: Rng + ?Sized>(arch: &NetArchitecture, rule_gate: RuleGate, rng: &mut R) -> Self {
        let attention = arch
            .use_attention
            .then(|| FeatureAttention::new(arch.input_size, rng));
        let trunk = SharedTrunk::new(
            arch.input_size,
            &arch.hidden_layers,
            arch.activation,
            arch.dropout,
            arch.batch_norm,
            rng,
        );
        let heads = (0..arch.num_tasks.max(1))
            .map(|_| Linear::new(trunk.output_size(), arch.output_size, rng))
            .collect();
        Self {
            attention,
            rule_gate,
            trunk,
            heads,
            input_size: arch.input_size,
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.heads.len()
    }

    pub fn output_size(&self) -> usize {
        self.heads.first().map(Linear::out_features).unwrap_or(0)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    fn check_inputs(&self, x: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<(), NetError> {
        if x.ncols() != self.input_size {
            return Err(NetError::FeatureMismatch {
                expected: self.input_size,
                found: x.ncols(),
            });
        }
        if tasks.len() != x.nrows() {
            return Err(NetError::TaskLengthMismatch {
                expected: x.nrows(),
                found: tasks.len(),
            });
        }
        if let Some((row, &index)) = tasks.iter().enumerate().find(|(_, t)| **t >= self.heads.len()) {
            return Err(NetError::TaskIndexOutOfRange {
                row,
                index,
                num_tasks: self.heads.len(),
            });
        }
        Ok(())
    }

    fn gated_representation(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let gated = self.rule_gate.gate_inputs(x);
        let input = gated.as_ref().map(|g| g.view()).unwrap_or(x.view());
        let attended = match &self.attention {
            Some(attention) => attention.forward(input),
            None => input.to_owned(),
        };
        self.trunk.forward(attended.view())
    }

    /// Raw outputs of every head for every sample, before output gating and gather.
    pub fn head_outputs(&self, x: ArrayView2<'_, f64>) -> Result<Vec<Array2<f64>>, NetError> {
        if x.ncols() != self.input_size {
            return Err(NetError::FeatureMismatch {
                expected: self.input_size,
                found: x.ncols(),
            });
        }
        let hidden = self.gated_representation(x);
        Ok(self.heads.iter().map(|head| head.forward(hidden.view())).collect())
    }

    /// Inference-mode forward pass: `[n, output_size]`, row `i` from head `tasks[i]`.
    pub fn forward(&self, x: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<Array2<f64>, NetError> {
        self.check_inputs(x, tasks)?;
        let all_heads = self.head_outputs(x)?;
        let factors = self.rule_gate.output_factors(x, self.heads.len());
        Ok(gather(&all_heads, tasks, factors.as_ref()))
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f64>,
        tasks: &[usize],
        rng: &mut R,
    ) -> Result<(Array2<f64>, ForwardCache), NetError> {
        self.check_inputs(x, tasks)?;
        let gated = self.rule_gate.gate_inputs(x);
        let input = gated.as_ref().map(|g| g.view()).unwrap_or(x.view());
        let (attended, attention_cache) = match &self.attention {
            Some(attention) => {
                let (out, cache) = attention.forward_train(input);
                (out, Some(cache))
            }
            None => (input.to_owned(), None),
        };
        let (hidden, trunk_cache) = self.trunk.forward_train(attended.view(), rng);
        let all_heads: Vec<Array2<f64>> = self
            .heads
            .iter()
            .map(|head| head.forward(hidden.view()))
            .collect();
        let factors = self.rule_gate.output_factors(x, self.heads.len());
        let out = gather(&all_heads, tasks, factors.as_ref());
        Ok((
            out,
            ForwardCache {
                attention: attention_cache,
                trunk: trunk_cache,
                hidden,
                output_factors: factors,
                tasks: tasks.to_vec(),
            },
        ))
    }

    /// Accumulates gradients of every parameter given `d loss / d output`.
    pub fn backward(&mut self, cache: &ForwardCache, grad_out: &Array2<f64>) {
        let mut grad_hidden = Array2::<f64>::zeros(cache.hidden.raw_dim());
        for (task, head) in self.heads.iter_mut().enumerate() {
            let rows: Vec<usize> = cache
                .tasks
                .iter()
                .enumerate()
                .filter_map(|(i, &t)| (t == task).then_some(i))
                .collect();
            if rows.is_empty() {
                continue;
            }
            let mut grad_rows = grad_out.select(Axis(0), &rows);
            if let Some(factors) = &cache.output_factors {
                for (k, &row) in rows.iter().enumerate() {
                    let f = factors[(row, task)];
                    grad_rows.row_mut(k).mapv_inplace(|g| g * f);
                }
            }
            let hidden_rows = cache.hidden.select(Axis(0), &rows);
            let grad_input = head.backward(hidden_rows.view(), grad_rows.view());
            for (k, &row) in rows.iter().enumerate() {
                let mut target = grad_hidden.row_mut(row);
                target += &grad_input.row(k);
            }
        }
        let grad_attended = self.trunk.backward(&cache.trunk, grad_hidden);
        if let (Some(attention), Some(attention_cache)) = (&mut self.attention, &cache.attention) {
            attention.backward(attention_cache, &grad_attended);
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = Vec::new();
        if let Some(attention) = &mut self.attention {
            params.extend(attention.params_mut());
        }
        params.extend(self.trunk.params_mut());
        for head in &mut self.heads {
            params.extend(head.params_mut());
        }
        params
    }

    pub fn zero_grad(&mut self) {
        for param in self.params_mut() {
            param.zero_grad();
        }
    }
}

fn gather(all_heads: &[Array2<f64>], tasks: &[usize], factors: Option<&Array2<f64>>) -> Array2<f64> {
    let width = all_heads.first().map(|h| h.ncols()).unwrap_or(0);
    let mut out = Array2::<f64>::zeros((tasks.len(), width));
    for (i, &task) in tasks.iter().enumerate() {
        let scale = factors.map(|f| f[(i, task)]).unwrap_or(1.0);
        out.row_mut(i)
            .assign(&all_heads[task].row(i).mapv(|v| v * scale));
    }
    out
}
