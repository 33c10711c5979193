//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the standard optimizer for transformers.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (if applicable)
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! with β₁ = 0.9, β₂ = 0.95 and ε = 1e-8.
//!
//! ## Selective Weight Decay
//!
//! Decay applies only to 2-D weight matrices outside the embedding tables.
//! Biases, LayerNorm scale/shift and embeddings are left alone; the model
//! tags each parameter accordingly (see
//! [`ParameterMut::weight_decay`](crate::model::ParameterMut)).
//!
//! ## Ownership
//!
//! The optimizer owns only its moment buffers, indexed in model parameter
//! order. Parameters are borrowed mutably from the model for each step.
//!
//! ## Example
//!
//! ```rust
//! use charlm::{AdamW, LanguageModel, ModelConfig};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let mut model = LanguageModel::new(&ModelConfig::tiny(3), &mut rng)?;
//! let mut optimizer = AdamW::new(&model);
//!
//! let inputs = vec![vec![0, 1, 2]];
//! let targets = vec![vec![1, 2, 0]];
//! let (_, grads) = model.loss_and_gradients(&inputs, &targets, &mut rng)?;
//! optimizer.step(model.parameters_mut(), &grads, 1e-3, 0.1);
//! assert_eq!(optimizer.steps(), 1);
//! # Ok::<(), charlm::Error>(())
//! ```

use rayon::prelude::*;

use crate::gradients::Gradients;
use crate::model::{LanguageModel, ParameterMut};
use crate::tensor::Tensor;

/// Tensors above this size are updated in parallel
const PARALLEL_THRESHOLD: usize = 1000;

pub struct AdamW {
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    step: usize,
}

impl AdamW {
    /// Zeroed moments shaped like the model parameters
    pub fn new(model: &LanguageModel) -> Self {
        let zeros = || {
            model
                .parameters()
                .iter()
                .map(|p| Tensor::zeros(p.shape.clone()))
                .collect::<Vec<_>>()
        };
        Self {
            m: zeros(),
            v: zeros(),
            beta1: 0.9,
            beta2: 0.95,
            epsilon: 1e-8,
            step: 0,
        }
    }

    /// Number of updates applied so far
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Apply one AdamW update to every parameter
    ///
    /// # Panics
    ///
    /// Panics if `params` and `grads` do not line up with the moment buffers
    pub fn step(
        &mut self,
        params: Vec<ParameterMut<'_>>,
        grads: &Gradients,
        lr: f32,
        weight_decay: f32,
    ) {
        assert_eq!(params.len(), self.m.len(), "parameter count mismatch");
        assert_eq!(grads.len(), self.m.len(), "gradient count mismatch");

        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for (((param, grad), m), v) in params
            .into_iter()
            .zip(grads.tensors())
            .zip(&mut self.m)
            .zip(&mut self.v)
        {
            let decay = if param.weight_decay {
                1.0 - lr * weight_decay
            } else {
                1.0
            };
            let update = |((p, &g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            };

            let data = &mut param.tensor.data;
            if data.len() > PARALLEL_THRESHOLD {
                data.par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                    .for_each(update);
            } else {
                data.iter_mut()
                    .zip(grad.data.iter())
                    .zip(m.data.iter_mut().zip(v.data.iter_mut()))
                    .for_each(update);
            }
        }
    }
}
