//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b`.
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]
//! Output: y [seq_len, out_features]
//! ```
//!
//! Backward, by the chain rule:
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```

use rand::Rng;
use rand_distr::StandardNormal;

use crate::tensor::Tensor;

/// Draw `size` values from `N(0, std^2)`
pub fn normal_init<R: Rng + ?Sized>(size: usize, std: f32, rng: &mut R) -> Vec<f32> {
    (0..size)
        .map(|_| {
            let z: f32 = rng.sample(StandardNormal);
            z * std
        })
        .collect()
}

/// Linear layer `y = x @ W + b`
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Weights from `N(0, 0.02^2)` as in GPT-2, zero bias
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self::with_std(in_features, out_features, 0.02, rng)
    }

    /// Weights from `N(0, std^2)`, zero bias
    pub fn with_std<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        std: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, std, rng),
                vec![in_features, out_features],
            ),
            bias: Tensor::zeros(vec![out_features]),
        }
    }

    /// Forward pass; caches `x` for backward
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x.matmul(&self.weight).add(&self.bias);
        (y, LinearCache { x: x.clone() })
    }

    /// Forward pass without a cache, for evaluation and sampling
    pub fn apply(&self, x: &Tensor) -> Tensor {
        x.matmul(&self.weight).add(&self.bias)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose().matmul(grad_out),
            bias: grad_out.sum_rows(),
            x: grad_out.matmul(&self.weight.transpose()),
        }
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Values saved by [`Linear::forward`]
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for a linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Tensor,
    /// Gradient to pass to the previous layer
    pub x: Tensor,
}

impl LinearGradients {
    /// Parameter gradients in [`Linear::parameters`] order
    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_forward_shape_and_bias() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut layer = Linear::new(3, 2, &mut rng);
        layer.bias = Tensor::new(vec![1.0, -1.0], vec![2]);
        layer.weight = Tensor::zeros(vec![3, 2]);

        let x = Tensor::new(vec![1.0; 12], vec![4, 3]);
        let (y, _) = layer.forward(&x);
        assert_eq!(y.shape, vec![4, 2]);
        assert_eq!(&y.data[..2], &[1.0, -1.0]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Linear::with_std(3, 2, 0.5, &mut rng);
        let x = Tensor::new(normal_init(6, 1.0, &mut rng), vec![2, 3]);

        // loss = sum(y)
        let (y, cache) = layer.forward(&x);
        let grads = layer.backward(&Tensor::full(y.shape.clone(), 1.0), &cache);

        let eps = 1e-2;
        let idx = 4;
        let base: f32 = layer.apply(&x).data.iter().sum();
        layer.weight.data[idx] += eps;
        let bumped: f32 = layer.apply(&x).data.iter().sum();
        let numeric = (bumped - base) / eps;
        assert!((numeric - grads.weight.data[idx]).abs() < 1e-2);
        assert_eq!(grads.bias.data, vec![2.0, 2.0]);
    }
}
