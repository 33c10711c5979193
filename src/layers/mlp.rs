//! Multi-Layer Perceptron (MLP)
//!
//! The position-wise feedforward network of each transformer block:
//!
//! ```text
//! x → fc1 [C, 4C] → GELU → fc2 [4C, C] → dropout → y
//! ```
//!
//! The 4× expansion is the usual GPT choice.

use rand::RngCore;

use super::activation::{gelu_backward, gelu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use crate::tensor::Tensor;

pub struct Mlp {
    pub fc1: Linear,
    pub fc2: Linear,
    pub resid_dropout: Dropout,
}

impl Mlp {
    pub fn new<R: rand::Rng + ?Sized>(embedding_dim: usize, dropout: f32, rng: &mut R) -> Self {
        let hidden = embedding_dim * 4;
        Self {
            fc1: Linear::new(embedding_dim, hidden, rng),
            fc2: Linear::new(hidden, embedding_dim, rng),
            resid_dropout: Dropout::new(dropout),
        }
    }

    /// `x` is `[seq_len, C]`; dropout is active only when `rng` is given
    pub fn forward(&self, x: &Tensor, rng: Option<&mut dyn RngCore>) -> (Tensor, MlpCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let activated = gelu_forward(&h);
        let (projected, fc2_cache) = self.fc2.forward(&activated);
        let (y, dropout_cache) = self.resid_dropout.forward(&projected, rng);

        (
            y,
            MlpCache {
                fc1_cache,
                h,
                fc2_cache,
                dropout_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &MlpCache) -> MlpGradients {
        let grad_projected = self.resid_dropout.backward(grad_out, &cache.dropout_cache);
        let fc2 = self.fc2.backward(&grad_projected, &cache.fc2_cache);
        let grad_h = gelu_backward(&fc2.x, &cache.h);
        let fc1 = self.fc1.backward(&grad_h, &cache.fc1_cache);

        MlpGradients { fc1, fc2 }
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}

pub struct MlpCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation, needed by the GELU backward
    pub h: Tensor,
    pub fc2_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

/// Parameter gradients; the input gradient is `fc1.x`
pub struct MlpGradients {
    pub fc1: LinearGradients,
    pub fc2: LinearGradients,
}

impl MlpGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut grads = self.fc1.tensors();
        grads.extend(self.fc2.tensors());
        grads
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads = self.fc1.tensors_mut();
        grads.extend(self.fc2.tensors_mut());
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(8, 0.0, &mut rng);
        let x = Tensor::full(vec![3, 8], 0.5);
        let (y, cache) = mlp.forward(&x, None);
        assert_eq!(y.shape, vec![3, 8]);
        assert_eq!(cache.h.shape, vec![3, 32]);

        let grads = mlp.backward(&Tensor::full(vec![3, 8], 1.0), &cache);
        assert_eq!(grads.fc1.x.shape, vec![3, 8]);
        let shapes: Vec<_> = grads.tensors().iter().map(|t| t.shape.clone()).collect();
        let expected: Vec<_> = mlp.parameters().iter().map(|t| t.shape.clone()).collect();
        assert_eq!(shapes, expected);
    }
}
