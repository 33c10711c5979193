//! Neural Network Layers
//!
//! Every trainable layer follows the same pattern: `forward` returns the
//! output together with a cache of the values its `backward` needs, and
//! `backward` returns a gradients struct holding one tensor per parameter
//! plus the gradient with respect to the layer input.
//!
//! ```rust,ignore
//! let (y, cache) = layer.forward(&x, rng);
//! let grads = layer.backward(&grad_y, &cache);
//! ```
//!
//! `parameters()` on a layer and `tensors()` on its gradients enumerate in
//! the same order, which is what lets the optimizer pair them up.
//!
//! Layers that use dropout take `Option<&mut dyn RngCore>`: `Some` selects
//! training mode, `None` evaluation mode.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{AttentionCache, AttentionGradients, CausalSelfAttention};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{normal_init, Linear, LinearCache, LinearGradients};
pub use mlp::{Mlp, MlpCache, MlpGradients};
