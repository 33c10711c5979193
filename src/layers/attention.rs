//! Causal Multi-Head Self-Attention
//!
//! Each position attends to itself and every earlier position. The embedding
//! is split into `num_heads` heads of width `head_dim = C / num_heads` that
//! attend independently:
//!
//! ```text
//! Q, K, V = x @ W_q, x @ W_k, x @ W_v            [T, C]
//! for each head h (columns h*d .. (h+1)*d):
//!     scores_h  = Q_h @ K_h^T / √d               [T, T]
//!     weights_h = softmax(causal_mask(scores_h))
//!     out_h     = dropout(weights_h) @ V_h       [T, d]
//! y = dropout(concat(out_h) @ W_o)
//! ```
//!
//! Dividing by √d keeps the dot products from saturating the softmax.
//!
//! ## Backward Pass
//!
//! Per head, in reverse:
//!
//! ```text
//! grad_V_h       = dropout(weights_h)^T @ grad_out_h
//! grad_weights_h = dropout_backward(grad_out_h @ V_h^T)
//! grad_scores_h  = weights_h * (grad_weights_h - rowsum(grad_weights_h * weights_h))
//! grad_Q_h       = grad_scores_h @ K_h / √d
//! grad_K_h       = grad_scores_h^T @ Q_h / √d
//! ```
//!
//! Masked positions have zero weight, so no gradient flows into the future.

use rand::{Rng, RngCore};

use super::dropout::{reborrow, Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use crate::tensor::Tensor;

pub struct CausalSelfAttention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl CausalSelfAttention {
    /// # Panics
    ///
    /// Panics if `embedding_dim` is not divisible by `num_heads`
    pub fn new<R: Rng + ?Sized>(
        embedding_dim: usize,
        num_heads: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        assert!(
            num_heads > 0 && embedding_dim % num_heads == 0,
            "embedding_dim {} must be divisible by num_heads {}",
            embedding_dim,
            num_heads
        );
        Self {
            q_proj: Linear::new(embedding_dim, embedding_dim, rng),
            k_proj: Linear::new(embedding_dim, embedding_dim, rng),
            v_proj: Linear::new(embedding_dim, embedding_dim, rng),
            out_proj: Linear::new(embedding_dim, embedding_dim, rng),
            attn_dropout: Dropout::new(dropout),
            resid_dropout: Dropout::new(dropout),
            num_heads,
            head_dim: embedding_dim / num_heads,
        }
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Attend over `x` `[seq_len, C]`
    ///
    /// Dropout on the attention weights and on the projected output is
    /// active only when `rng` is given.
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut dyn RngCore>) -> (Tensor, AttentionCache) {
        let seq_len = x.rows();
        let scale = self.scale();

        let (q, q_cache) = self.q_proj.forward(x);
        let (k, k_cache) = self.k_proj.forward(x);
        let (v, v_cache) = self.v_proj.forward(x);

        let mut attn_out = Tensor::zeros(vec![seq_len, self.num_heads * self.head_dim]);
        let mut heads = Vec::with_capacity(self.num_heads);

        for h in 0..self.num_heads {
            let start = h * self.head_dim;
            let q_h = q.narrow_cols(start, self.head_dim);
            let k_h = k.narrow_cols(start, self.head_dim);
            let v_h = v.narrow_cols(start, self.head_dim);

            let mut scores = q_h.matmul(&k_h.transpose()).mul_scalar(scale);
            apply_causal_mask(&mut scores);
            let weights = scores.softmax_rows();

            let (dropped, dropout_cache) = self.attn_dropout.forward(&weights, reborrow(&mut rng));
            attn_out.write_cols(start, &dropped.matmul(&v_h));

            heads.push(HeadCache {
                weights,
                dropped,
                dropout_cache,
            });
        }

        let (projected, out_cache) = self.out_proj.forward(&attn_out);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&projected, rng);

        let cache = AttentionCache {
            q,
            k,
            v,
            heads,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let scale = self.scale();

        let grad_projected = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let out = self.out_proj.backward(&grad_projected, &cache.out_cache);

        let mut grad_q = Tensor::zeros(cache.q.shape.clone());
        let mut grad_k = Tensor::zeros(cache.k.shape.clone());
        let mut grad_v = Tensor::zeros(cache.v.shape.clone());

        for (h, head) in cache.heads.iter().enumerate() {
            let start = h * self.head_dim;
            let q_h = cache.q.narrow_cols(start, self.head_dim);
            let k_h = cache.k.narrow_cols(start, self.head_dim);
            let v_h = cache.v.narrow_cols(start, self.head_dim);
            let grad_out_h = out.x.narrow_cols(start, self.head_dim);

            grad_v.write_cols(start, &head.dropped.transpose().matmul(&grad_out_h));

            let grad_dropped = grad_out_h.matmul(&v_h.transpose());
            let grad_weights = self
                .attn_dropout
                .backward(&grad_dropped, &head.dropout_cache);
            let grad_scores = softmax_backward(&head.weights, &grad_weights);

            grad_q.write_cols(start, &grad_scores.matmul(&k_h).mul_scalar(scale));
            grad_k.write_cols(
                start,
                &grad_scores.transpose().matmul(&q_h).mul_scalar(scale),
            );
        }

        let q = self.q_proj.backward(&grad_q, &cache.q_cache);
        let k = self.k_proj.backward(&grad_k, &cache.k_cache);
        let v = self.v_proj.backward(&grad_v, &cache.v_cache);

        // Q, K and V all read the same input
        let mut x = q.x.clone();
        x.add_assign(&k.x);
        x.add_assign(&v.x);

        AttentionGradients { q, k, v, out, x }
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.q_proj.parameters();
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.q_proj.parameters_mut();
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params
    }
}

/// Set every score above the diagonal to -inf
fn apply_causal_mask(scores: &mut Tensor) {
    let n = scores.cols();
    for (i, row) in scores.data.chunks_mut(n).enumerate() {
        for v in &mut row[i + 1..] {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Row-wise softmax Jacobian-vector product
fn softmax_backward(weights: &Tensor, grad_weights: &Tensor) -> Tensor {
    let n = weights.cols();
    let mut data = Vec::with_capacity(weights.len());
    for (w_row, g_row) in weights.data.chunks(n).zip(grad_weights.data.chunks(n)) {
        let dot: f32 = w_row.iter().zip(g_row).map(|(w, g)| w * g).sum();
        data.extend(w_row.iter().zip(g_row).map(|(w, g)| w * (g - dot)));
    }
    Tensor::new(data, weights.shape.clone())
}

pub struct HeadCache {
    /// Attention weights after softmax, before dropout
    pub weights: Tensor,
    /// Weights actually applied to V
    pub dropped: Tensor,
    pub dropout_cache: DropoutCache,
}

pub struct AttentionCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub heads: Vec<HeadCache>,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}

pub struct AttentionGradients {
    pub q: LinearGradients,
    pub k: LinearGradients,
    pub v: LinearGradients,
    pub out: LinearGradients,
    pub x: Tensor,
}

impl AttentionGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut grads = self.q.tensors();
        grads.extend(self.k.tensors());
        grads.extend(self.v.tensors());
        grads.extend(self.out.tensors());
        grads
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads = self.q.tensors_mut();
        grads.extend(self.k.tensors_mut());
        grads.extend(self.v.tensors_mut());
        grads.extend(self.out.tensors_mut());
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::normal_init;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_weights_are_causal_and_normalized() {
        let mut rng = StdRng::seed_from_u64(1);
        let attn = CausalSelfAttention::new(8, 2, 0.0, &mut rng);
        let x = Tensor::new(normal_init(5 * 8, 1.0, &mut rng), vec![5, 8]);
        let (y, cache) = attn.forward(&x, None);

        assert_eq!(y.shape, vec![5, 8]);
        assert_eq!(cache.heads.len(), 2);
        for head in &cache.heads {
            for (i, row) in head.weights.data.chunks(5).enumerate() {
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5);
                assert!(row[i + 1..].iter().all(|&w| w == 0.0));
            }
        }
    }

    #[test]
    fn test_future_tokens_do_not_change_earlier_outputs() {
        let mut rng = StdRng::seed_from_u64(2);
        let attn = CausalSelfAttention::new(4, 2, 0.0, &mut rng);
        let x = Tensor::new(normal_init(3 * 4, 1.0, &mut rng), vec![3, 4]);
        let mut changed = x.clone();
        for v in &mut changed.data[8..] {
            *v += 3.0;
        }

        let (a, _) = attn.forward(&x, None);
        let (b, _) = attn.forward(&changed, None);
        for (p, q) in a.data[..8].iter().zip(&b.data[..8]) {
            assert!((p - q).abs() < 1e-6);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(3);
        let attn = CausalSelfAttention::new(4, 2, 0.0, &mut rng);
        let x = Tensor::new(normal_init(3 * 4, 1.0, &mut rng), vec![3, 4]);
        let upstream = normal_init(3 * 4, 1.0, &mut rng);
        let loss = |x: &Tensor| -> f32 {
            let (y, _) = attn.forward(x, None);
            y.data.iter().zip(&upstream).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = attn.forward(&x, None);
        let grads = attn.backward(&Tensor::new(upstream.clone(), vec![3, 4]), &cache);

        let eps = 1e-2;
        for i in [0, 5, 11] {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - grads.x.data[i]).abs() < 1e-3,
                "index {}: numeric {} analytic {}",
                i,
                numeric,
                grads.x.data[i]
            );
        }
    }
}
