use super::layers::{Activation, BatchNorm1d, BatchNormCache, Linear, Param, dropout_mask};
use ndarray::{Array2, ArrayView2};
use rand::Rng;

#[derive(Debug, Clone)]
struct DenseBlock {
    linear: Linear,
    batch_norm: Option<BatchNorm1d>,
}

#[derive(Debug, Clone)]
struct BlockCache {
    input: Array2<f64>,
    pre_activation: Array2<f64>,
    batch_norm: Option<BatchNormCache>,
    dropout: Option<Array2<f64>>,
}

/// Activations recorded by [`SharedTrunk::forward_train`].
#[derive(Debug, Clone)]
pub struct TrunkCache {
    blocks: Vec<BlockCache>,
}

/// Feedforward representation shared by every task head:
/// `Linear -> BatchNorm (optional) -> activation -> Dropout`, once per hidden width.
#[derive(Debug, Clone)]
pub struct SharedTrunk {
    blocks: Vec<DenseBlock>,
    activation: Activation,
    dropout: f64,
}

impl SharedTrunk {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        hidden_layers: &[usize],
        activation: Activation,
        dropout: f64,
        batch_norm: bool,
        rng: &mut R,
    ) -> Self {
        let mut blocks = Vec::with_capacity(hidden_layers.len());
        let mut width = input_size;
        for &out in hidden_layers {
            blocks.push(DenseBlock {
                linear: Linear::new(width, out, rng),
                batch_norm: batch_norm.then(|| BatchNorm1d::new(out)),
            });
            width = out;
        }
        Self {
            blocks,
            activation,
            dropout,
        }
    }

    pub fn output_size(&self) -> usize {
        self.blocks
            .last()
            .map(|b| b.linear.out_features())
            .unwrap_or(0)
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut h = x.to_owned();
        for block in &self.blocks {
            let mut pre = block.linear.forward(h.view());
            if let Some(bn) = &block.batch_norm {
                pre = bn.forward_eval(pre.view());
            }
            h = self.activation.apply(&pre);
        }
        h
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f64>,
        rng: &mut R,
    ) -> (Array2<f64>, TrunkCache) {
        let mut h = x.to_owned();
        let mut caches = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            let linear_out = block.linear.forward(h.view());
            let (pre_activation, bn_cache) = match &mut block.batch_norm {
                Some(bn) => {
                    let (out, cache) = bn.forward_train(linear_out.view());
                    (out, Some(cache))
                }
                None => (linear_out, None),
            };
            let mut activated = self.activation.apply(&pre_activation);
            let mask = (self.dropout > 0.0).then(|| dropout_mask(activated.dim(), self.dropout, rng));
            if let Some(mask) = &mask {
                activated *= mask;
            }
            caches.push(BlockCache {
                input: h,
                pre_activation,
                batch_norm: bn_cache,
                dropout: mask,
            });
            h = activated;
        }
        (h, TrunkCache { blocks: caches })
    }

    /// Accumulates parameter gradients; returns the gradient w.r.t. the trunk input.
    pub fn backward(&mut self, cache: &TrunkCache, grad_out: Array2<f64>) -> Array2<f64> {
        let mut grad = grad_out;
        for (block, saved) in self.blocks.iter_mut().zip(&cache.blocks).rev() {
            if let Some(mask) = &saved.dropout {
                grad *= mask;
            }
            grad = self.activation.backward(&saved.pre_activation, &grad);
            if let (Some(bn), Some(bn_cache)) = (&mut block.batch_norm, &saved.batch_norm) {
                grad = bn.backward(bn_cache, &grad);
            }
            grad = block.linear.backward(saved.input.view(), grad.view());
        }
        grad
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = Vec::new();
        for block in &mut self.blocks {
            params.extend(block.linear.params_mut());
            if let Some(bn) = &mut block.batch_norm {
                params.extend(bn.params_mut());
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn trunk_backward_matches_finite_differences_without_dropout() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut trunk = SharedTrunk::new(3, &[4, 2], Activation::Elu, 0.0, false, &mut rng);
        let x = array![[0.1, -0.4, 1.2], [0.7, 0.2, -0.9], [-1.1, 0.5, 0.3]];
        let upstream = array![[1.0, -0.5], [0.2, 0.3], [-0.7, 0.9]];
        let (_, cache) = trunk.forward_train(x.view(), &mut rng);
        let grad_in = trunk.backward(&cache, upstream.clone());

        let h = 1e-6;
        for (i, j) in [(0, 0), (1, 2), (2, 1)] {
            let mut xp = x.clone();
            xp[(i, j)] += h;
            let mut xm = x.clone();
            xm[(i, j)] -= h;
            let fp = (trunk.forward(xp.view()) * &upstream).sum();
            let fm = (trunk.forward(xm.view()) * &upstream).sum();
            assert_abs_diff_eq!(grad_in[(i, j)], (fp - fm) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn output_width_follows_last_hidden_layer() {
        let mut rng = StdRng::seed_from_u64(1);
        let trunk = SharedTrunk::new(5, &[8, 3], Activation::Relu, 0.1, true, &mut rng);
        assert_eq!(trunk.output_size(), 3);
        let out = trunk.forward(Array2::zeros((4, 5)).view());
        assert_eq!(out.dim(), (4, 3));
    }
}
