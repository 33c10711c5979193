//! Character-Level Transformer Language Model
//!
//! A decoder-only transformer that predicts the next character at every
//! position of its input:
//!
//! ```text
//! token ids [B, T]
//!   → token embedding [V, C] + position embedding [block_size, C]
//!   → num_layers × TransformerBlock
//!   → final LayerNorm
//!   → output projection [C, V]
//!   → logits [B, T, V]
//! ```
//!
//! ## Training
//!
//! Loss is the mean cross-entropy over all `B·T` positions. Its gradient
//! with respect to the logits is the usual
//!
//! ```text
//! grad_logits = (softmax(logits) - one_hot(target)) / (B·T)
//! ```
//!
//! which [`LanguageModel::loss_and_gradients`] pushes back through the
//! output projection, final norm, every block in reverse, and finally into
//! the embedding tables. Batch rows are processed one at a time and their
//! gradients summed into a single [`Gradients`].
//!
//! ## Parameter Order
//!
//! [`LanguageModel::parameters`] always enumerates:
//!
//! ```text
//! token_embedding, position_embedding,
//! for each block: ln1.{gamma,beta}, attn.{q,k,v,out}.{weight,bias},
//!                 ln2.{gamma,beta}, mlp.{fc1,fc2}.{weight,bias}
//! ln_final.{gamma,beta}, output_weight
//! ```
//!
//! Gradients, optimizer state and checkpoint files all rely on this order.

use rand::{Rng, RngCore};
use rayon::prelude::*;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::gradients::Gradients;
use crate::layers::dropout::reborrow;
use crate::layers::{normal_init, BlockCache, LayerNorm, LayerNormCache, TransformerBlock};
use crate::tensor::{softmax, Tensor};

const INIT_STD: f32 = 0.02;

pub struct LanguageModel {
    token_embedding: Tensor,
    position_embedding: Tensor,
    blocks: Vec<TransformerBlock>,
    ln_final: LayerNorm,
    output_weight: Tensor,
    config: ModelConfig,
}

/// Mutable access to one learnable tensor
pub struct ParameterMut<'a> {
    pub tensor: &'a mut Tensor,
    /// Whether decoupled weight decay applies (2-D non-embedding matrices)
    pub weight_decay: bool,
}

struct SequenceCache {
    input_ids: Vec<usize>,
    block_caches: Vec<BlockCache>,
    ln_final_cache: LayerNormCache,
    x_final: Tensor,
}

impl LanguageModel {
    /// Randomly initialised model; weights drawn from `N(0, 0.02²)`
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let v = config.vocab_size;
        let c = config.embedding_dim;

        let token_embedding = Tensor::new(normal_init(v * c, INIT_STD, rng), vec![v, c]);
        let position_embedding = Tensor::new(
            normal_init(config.block_size * c, INIT_STD, rng),
            vec![config.block_size, c],
        );
        let blocks = (0..config.num_layers)
            .map(|_| TransformerBlock::new(c, config.num_heads, config.dropout, rng))
            .collect();
        let output_weight = Tensor::new(normal_init(c * v, INIT_STD, rng), vec![c, v]);

        Ok(Self {
            token_embedding,
            position_embedding,
            blocks,
            ln_final: LayerNorm::new(c),
            output_weight,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Evaluation-mode logits `[B, T, V]` for a batch of token rows
    pub fn forward(&self, inputs: &[Vec<usize>]) -> Result<Tensor> {
        self.check_inputs(inputs)?;
        let rows: Vec<Tensor> = inputs
            .par_iter()
            .map(|row| self.forward_sequence(row, None).0)
            .collect();
        Ok(Tensor::stack(&rows))
    }

    /// Evaluation-mode mean cross-entropy and logits
    pub fn forward_with_loss(
        &self,
        inputs: &[Vec<usize>],
        targets: &[Vec<usize>],
    ) -> Result<(f32, Tensor)> {
        self.check_targets(inputs, targets)?;
        let logits = self.forward(inputs)?;

        let v = self.config.vocab_size;
        let total: f32 = logits
            .data
            .chunks(v)
            .zip(targets.iter().flatten())
            .map(|(row, &target)| cross_entropy(row, target))
            .sum();
        let loss = total / (logits.len() / v) as f32;

        check_finite(loss)?;
        Ok((loss, logits))
    }

    /// Training-mode loss and gradients for one batch
    ///
    /// Dropout draws from `rng`. Gradients start from zero on every call.
    pub fn loss_and_gradients(
        &self,
        inputs: &[Vec<usize>],
        targets: &[Vec<usize>],
        rng: &mut dyn RngCore,
    ) -> Result<(f32, Gradients)> {
        self.check_inputs(inputs)?;
        self.check_targets(inputs, targets)?;

        let v = self.config.vocab_size;
        let positions: usize = inputs.iter().map(Vec::len).sum();
        let norm = 1.0 / positions as f32;

        let mut grads = Gradients::zeros(self.parameters());
        let mut total = 0.0;

        for (row, row_targets) in inputs.iter().zip(targets) {
            let (logits, cache) = self.forward_sequence(row, Some(&mut *rng));

            let mut grad_logits = Vec::with_capacity(logits.len());
            for (logit_row, &target) in logits.data.chunks(v).zip(row_targets) {
                total += cross_entropy(logit_row, target);
                let mut probs = softmax(logit_row);
                probs[target] -= 1.0;
                grad_logits.extend(probs.into_iter().map(|p| p * norm));
            }
            let grad_logits = Tensor::new(grad_logits, logits.shape.clone());

            self.backward_sequence(&grad_logits, &cache, &mut grads);
        }

        let loss = total * norm;
        check_finite(loss)?;
        Ok((loss, grads))
    }

    /// Every learnable tensor, in the fixed order described above
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.token_embedding, &self.position_embedding];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.ln_final.parameters());
        params.push(&self.output_weight);
        params
    }

    /// Mutable parameters tagged with their weight-decay eligibility
    pub fn parameters_mut(&mut self) -> Vec<ParameterMut<'_>> {
        let mut params = vec![&mut self.token_embedding, &mut self.position_embedding];
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.extend(self.ln_final.parameters_mut());
        params.push(&mut self.output_weight);

        params
            .into_iter()
            .enumerate()
            .map(|(i, tensor)| {
                let weight_decay = i >= 2 && tensor.shape.len() == 2;
                ParameterMut {
                    tensor,
                    weight_decay,
                }
            })
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|t| t.len()).sum()
    }

    fn check_inputs(&self, inputs: &[Vec<usize>]) -> Result<()> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::Shape("batch is empty".into()))?;
        let seq_len = first.len();
        if seq_len == 0 || seq_len > self.config.block_size {
            return Err(Error::Shape(format!(
                "sequence length {} must be in 1..={}",
                seq_len, self.config.block_size
            )));
        }
        for row in inputs {
            if row.len() != seq_len {
                return Err(Error::Shape(format!(
                    "ragged batch: rows of length {} and {}",
                    seq_len,
                    row.len()
                )));
            }
            self.check_ids(row)?;
        }
        Ok(())
    }

    fn check_targets(&self, inputs: &[Vec<usize>], targets: &[Vec<usize>]) -> Result<()> {
        if targets.len() != inputs.len() {
            return Err(Error::Shape(format!(
                "{} target rows for {} input rows",
                targets.len(),
                inputs.len()
            )));
        }
        for (input, target) in inputs.iter().zip(targets) {
            if input.len() != target.len() {
                return Err(Error::Shape(format!(
                    "target row of length {} for input row of length {}",
                    target.len(),
                    input.len()
                )));
            }
            self.check_ids(target)?;
        }
        Ok(())
    }

    fn check_ids(&self, ids: &[usize]) -> Result<()> {
        let size = self.config.vocab_size;
        match ids.iter().find(|&&id| id >= size) {
            Some(&id) => Err(Error::Range { id, size }),
            None => Ok(()),
        }
    }

    /// Logits `[T, V]` for one already validated row
    fn forward_sequence(
        &self,
        input_ids: &[usize],
        mut rng: Option<&mut dyn RngCore>,
    ) -> (Tensor, SequenceCache) {
        let c = self.config.embedding_dim;
        let mut embedded = Vec::with_capacity(input_ids.len() * c);
        for (pos, &id) in input_ids.iter().enumerate() {
            let tok = &self.token_embedding.data[id * c..(id + 1) * c];
            let p = &self.position_embedding.data[pos * c..(pos + 1) * c];
            embedded.extend(tok.iter().zip(p).map(|(a, b)| a + b));
        }
        let mut x = Tensor::new(embedded, vec![input_ids.len(), c]);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (next, cache) = block.forward(&x, reborrow(&mut rng));
            block_caches.push(cache);
            x = next;
        }

        let (x_final, ln_final_cache) = self.ln_final.forward(&x);
        let logits = x_final.matmul(&self.output_weight);

        let cache = SequenceCache {
            input_ids: input_ids.to_vec(),
            block_caches,
            ln_final_cache,
            x_final,
        };
        (logits, cache)
    }

    /// Backpropagate one row and add its gradients into `grads`
    fn backward_sequence(&self, grad_logits: &Tensor, cache: &SequenceCache, grads: &mut Gradients) {
        let c = self.config.embedding_dim;

        let grad_output_weight = cache.x_final.transpose().matmul(grad_logits);
        let grad_x_final = grad_logits.matmul(&self.output_weight.transpose());
        let ln_final = self.ln_final.backward(&grad_x_final, &cache.ln_final_cache);

        let mut grad_x = ln_final.x.clone();
        let mut block_grads = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.block_caches).rev() {
            let g = block.backward(&grad_x, block_cache);
            grad_x = g.x.clone();
            block_grads.push(g);
        }
        block_grads.reverse();

        let mut grad_token = Tensor::zeros(self.token_embedding.shape.clone());
        let mut grad_position = Tensor::zeros(self.position_embedding.shape.clone());
        for (pos, &id) in cache.input_ids.iter().enumerate() {
            let g = &grad_x.data[pos * c..(pos + 1) * c];
            for (t, v) in grad_token.data[id * c..(id + 1) * c].iter_mut().zip(g) {
                *t += v;
            }
            grad_position.data[pos * c..(pos + 1) * c].copy_from_slice(g);
        }

        let mut parts = vec![&grad_token, &grad_position];
        for g in &block_grads {
            parts.extend(g.tensors());
        }
        parts.extend(ln_final.tensors());
        parts.push(&grad_output_weight);
        grads.accumulate(parts);
    }
}

/// `-log softmax(logits)[target]`
fn cross_entropy(logits: &[f32], target: usize) -> f32 {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum();
    (max + sum.ln()) - logits[target]
}

fn check_finite(loss: f32) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(Error::Numeric(format!("loss is {}", loss)))
    }
}
