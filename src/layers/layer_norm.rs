//! Layer Normalization
//!
//! Normalizes each row to zero mean and unit variance, then applies a
//! learnable scale (gamma) and shift (beta).
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)^2) / N
//! x_norm = (x - mean) / sqrt(var + eps)
//! y      = gamma * x_norm + beta
//! ```
//!
//! The backward pass is the tricky part because mean and variance depend on
//! every element of the row:
//!
//! ```text
//! grad_gamma  = sum(grad_y * x_norm)
//! grad_beta   = sum(grad_y)
//! grad_x_norm = grad_y * gamma
//! grad_x = (grad_x_norm - mean(grad_x_norm) - x_norm * mean(grad_x_norm * x_norm)) / std
//! ```

use crate::tensor::Tensor;

pub struct LayerNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    /// gamma = 1, beta = 0, eps = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: 1e-5,
        }
    }

    /// Normalize every row of `x` `[seq_len, n_embd]`
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n = self.gamma.len();
        let rows = x.len() / n;

        let mut y = Vec::with_capacity(x.len());
        let mut x_norm = Vec::with_capacity(x.len());
        let mut std = Vec::with_capacity(rows);

        for row in x.data.chunks(n) {
            let mean = row.iter().sum::<f32>() / n as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
            let s = (var + self.eps).sqrt();
            std.push(s);
            for (j, &v) in row.iter().enumerate() {
                let normed = (v - mean) / s;
                x_norm.push(normed);
                y.push(normed * self.gamma.data[j] + self.beta.data[j]);
            }
        }

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n = self.gamma.len();
        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        let mut grad_x = vec![0.0; grad_out.len()];

        for (i, (grad_row, x_norm_row)) in grad_out
            .data
            .chunks(n)
            .zip(cache.x_norm.data.chunks(n))
            .enumerate()
        {
            let mut mean_grad = 0.0;
            let mut mean_grad_x = 0.0;
            for j in 0..n {
                grad_gamma[j] += grad_row[j] * x_norm_row[j];
                grad_beta[j] += grad_row[j];
                let g = grad_row[j] * self.gamma.data[j];
                mean_grad += g;
                mean_grad_x += g * x_norm_row[j];
            }
            mean_grad /= n as f32;
            mean_grad_x /= n as f32;

            let std = cache.std[i];
            for j in 0..n {
                let g = grad_row[j] * self.gamma.data[j];
                grad_x[i * n + j] = (g - mean_grad - x_norm_row[j] * mean_grad_x) / std;
            }
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n]),
            beta: Tensor::new(grad_beta, vec![n]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row standard deviation `sqrt(var + eps)`
    pub std: Vec<f32>,
}

pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub fn tensors(&self) -> Vec<&Tensor> {
        vec![&self.gamma, &self.beta]
    }

    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 14.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for row in y.data.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut ln = LayerNorm::new(3);
        ln.gamma = Tensor::new(vec![0.5, 1.5, -1.0], vec![3]);
        let x = Tensor::new(vec![0.3, -1.2, 2.0], vec![1, 3]);
        let weights = [1.0, -2.0, 0.5];
        let loss = |ln: &LayerNorm, x: &Tensor| -> f32 {
            let (y, _) = ln.forward(x);
            y.data.iter().zip(weights).map(|(a, w)| a * w).sum()
        };

        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&Tensor::new(weights.to_vec(), vec![1, 3]), &cache);

        let eps = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus.data[i] += eps;
            let mut minus = x.clone();
            minus.data[i] -= eps;
            let numeric = (loss(&ln, &plus) - loss(&ln, &minus)) / (2.0 * eps);
            assert!(
                (numeric - grads.x.data[i]).abs() < 1e-2,
                "index {}: numeric {} analytic {}",
                i,
                numeric,
                grads.x.data[i]
            );
        }
    }
}
