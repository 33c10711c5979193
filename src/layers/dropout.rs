//! Dropout Layer
//!
//! Randomly zeros activations during training and rescales the survivors by
//! `1 / (1 - rate)` so the expected value is unchanged. Evaluation and
//! sampling pass values through untouched.
//!
//! Whether dropout is active is decided per call: passing a random number
//! generator means training mode, passing `None` means evaluation mode.

use rand::{Rng, RngCore};

use crate::tensor::Tensor;

/// Reborrow an optional generator so it can be handed to several layers
pub fn reborrow<'a>(rng: &'a mut Option<&mut dyn RngCore>) -> Option<&'a mut dyn RngCore> {
    match rng {
        Some(rng) => Some(&mut **rng),
        None => None,
    }
}

pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    /// # Panics
    ///
    /// Panics unless `rate` is in `[0, 1)`
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0, 1)"
        );
        Self { rate }
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut dyn RngCore>) -> (Tensor, DropoutCache) {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => {
                return (
                    x.clone(),
                    DropoutCache {
                        mask: None,
                        scale: 1.0,
                    },
                )
            }
        };

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.len());
        let mut output = Tensor::zeros(x.shape.clone());

        for (out, &v) in output.data.iter_mut().zip(&x.data) {
            let keep = rng.random::<f32>() >= self.rate;
            mask.push(keep);
            if keep {
                *out = v * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Route gradients through the same mask used in forward
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

pub struct DropoutCache {
    /// true = kept; `None` when dropout was inactive
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_inactive_without_rng() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::full(vec![4, 4], 2.0);
        let (y, cache) = dropout.forward(&x, None);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_training_mode_scales_survivors() {
        let dropout = Dropout::new(0.25);
        let x = Tensor::full(vec![1000], 1.0);
        let mut rng = StdRng::seed_from_u64(5);
        let (y, cache) = dropout.forward(&x, Some(&mut rng));

        let kept = cache.mask.as_ref().unwrap().iter().filter(|&&k| k).count();
        assert!(kept > 650 && kept < 850, "kept {}", kept);
        for &v in &y.data {
            assert!(v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-6);
        }

        let grad = dropout.backward(&Tensor::full(vec![1000], 1.0), &cache);
        assert_eq!(grad, y);
    }
}
