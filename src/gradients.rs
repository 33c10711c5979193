//! Gradient Utilities
//!
//! [`Gradients`] holds one tensor per model parameter, in the same order as
//! [`LanguageModel::parameters`](crate::model::LanguageModel::parameters).
//! Gradients for a batch are accumulated row by row into this flat list.
//!
//! ## Gradient Clipping
//!
//! An occasional batch can produce a very large gradient and knock training
//! off course. Clipping rescales every gradient by the same factor when the
//! global L2 norm exceeds a threshold, which keeps the update direction and
//! bounds its size:
//!
//! ```text
//! norm = √(Σ g²)           over every element of every gradient
//! if norm > max_norm:
//!     g *= max_norm / norm
//! ```

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Parameter gradients in model parameter order
#[derive(Clone, Debug)]
pub struct Gradients {
    tensors: Vec<Tensor>,
}

impl Gradients {
    /// Zero gradients shaped like `shapes`
    pub fn zeros<'a, I>(shapes: I) -> Self
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        Self {
            tensors: shapes
                .into_iter()
                .map(|t| Tensor::zeros(t.shape.clone()))
                .collect(),
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor] {
        &mut self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Add `parts` element-wise, in order
    ///
    /// # Panics
    ///
    /// Panics if the number or shapes of `parts` differ
    pub fn accumulate<'a, I>(&mut self, parts: I)
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        let mut count = 0;
        for (acc, part) in self.tensors.iter_mut().zip(parts) {
            acc.add_assign(part);
            count += 1;
        }
        assert_eq!(count, self.tensors.len(), "gradient count mismatch");
    }

    /// Global L2 norm √(Σ g²)
    ///
    /// Per-tensor sums run in parallel but are combined in parameter order,
    /// so the result does not depend on thread scheduling.
    pub fn norm(&self) -> f32 {
        let partial: Vec<f32> = self
            .tensors
            .par_iter()
            .map(Tensor::sum_of_squares)
            .collect();
        partial.iter().sum::<f32>().sqrt()
    }

    /// Scale every gradient so the global norm is at most `max_norm`
    ///
    /// Returns the norm measured before clipping. A non-finite norm is a
    /// [`Error::Numeric`].
    pub fn clip(&mut self, max_norm: f32) -> Result<f32> {
        let norm = self.norm();
        if !norm.is_finite() {
            return Err(Error::Numeric(format!("gradient norm is {}", norm)));
        }

        if norm > max_norm {
            let scale = max_norm / norm;
            self.tensors
                .par_iter_mut()
                .for_each(|t| t.data.iter_mut().for_each(|v| *v *= scale));
        }
        Ok(norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Gradients {
        Gradients {
            tensors: vec![
                Tensor::new(vec![3.0, 0.0], vec![2]),
                Tensor::new(vec![0.0, 4.0], vec![1, 2]),
            ],
        }
    }

    #[test]
    fn test_norm() {
        assert!((sample().norm() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut grads = sample();
        let before = grads.clip(1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        assert!((grads.norm() - 1.0).abs() < 1e-5);
        assert!((grads.tensors()[0].data[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let mut grads = sample();
        grads.clip(10.0).unwrap();
        assert_eq!(grads.tensors()[1].data, vec![0.0, 4.0]);
    }

    #[test]
    fn test_non_finite_norm_is_numeric_error() {
        let mut grads = sample();
        grads.tensors_mut()[0].data[1] = f32::NAN;
        assert!(matches!(grads.clip(1.0), Err(Error::Numeric(_))));
    }

    #[test]
    fn test_accumulate() {
        let mut grads = Gradients::zeros(sample().tensors());
        let other = sample();
        grads.accumulate(other.tensors());
        grads.accumulate(other.tensors());
        assert_eq!(grads.tensors()[0].data, vec![6.0, 0.0]);
    }
}
