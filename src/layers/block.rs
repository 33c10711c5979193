//! Transformer Block
//!
//! Pre-norm residual block:
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → MLP → (+) → output
//! │                            ↑  │                     ↑
//! └────────────────────────────┘  └─────────────────────┘
//! ```
//!
//! At each residual connection the incoming gradient splits into the skip
//! path and the sublayer path; the two contributions are summed.

use rand::{Rng, RngCore};

use super::attention::{AttentionCache, AttentionGradients, CausalSelfAttention};
use super::dropout::reborrow;
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::mlp::{Mlp, MlpCache, MlpGradients};
use crate::tensor::Tensor;

pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln2: LayerNorm,
    pub mlp: Mlp,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(
        embedding_dim: usize,
        num_heads: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            ln1: LayerNorm::new(embedding_dim),
            attn: CausalSelfAttention::new(embedding_dim, num_heads, dropout, rng),
            ln2: LayerNorm::new(embedding_dim),
            mlp: Mlp::new(embedding_dim, dropout, rng),
        }
    }

    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut dyn RngCore>) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, reborrow(&mut rng));
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (mlp_out, mlp_cache) = self.mlp.forward(&ln2_out, rng);
        let y = x_after_attn.add(&mlp_out);

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            mlp_cache,
        };
        (y, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        let mlp = self.mlp.backward(grad_out, &cache.mlp_cache);
        let ln2 = self.ln2.backward(&mlp.fc1.x, &cache.ln2_cache);
        let mut grad_x_after_attn = grad_out.clone();
        grad_x_after_attn.add_assign(&ln2.x);

        let attn = self.attn.backward(&grad_x_after_attn, &cache.attn_cache);
        let ln1 = self.ln1.backward(&attn.x, &cache.ln1_cache);
        let mut x = grad_x_after_attn;
        x.add_assign(&ln1.x);

        BlockGradients {
            ln1,
            attn,
            ln2,
            mlp,
            x,
        }
    }

    /// ln1, attention, ln2, MLP
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.ln1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.mlp.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.ln1.parameters_mut();
        params.extend(self.attn.parameters_mut());
        params.extend(self.ln2.parameters_mut());
        params.extend(self.mlp.parameters_mut());
        params
    }
}

pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln2_cache: LayerNormCache,
    pub mlp_cache: MlpCache,
}

pub struct BlockGradients {
    pub ln1: LayerNormGradients,
    pub attn: AttentionGradients,
    pub ln2: LayerNormGradients,
    pub mlp: MlpGradients,
    /// Gradient to pass to the previous block
    pub x: Tensor,
}

impl BlockGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut grads = self.ln1.tensors();
        grads.extend(self.attn.tensors());
        grads.extend(self.ln2.tensors());
        grads.extend(self.mlp.tensors());
        grads
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut grads = self.ln1.tensors_mut();
        grads.extend(self.attn.tensors_mut());
        grads.extend(self.ln2.tensors_mut());
        grads.extend(self.mlp.tensors_mut());
        grads
    }
}
