//! charlm: Character-Level Language Model
//!
//! A small GPT-style transformer trained from scratch on plain text, one
//! character at a time, with hand-written forward and backward passes and
//! no machine learning framework underneath.
//!
//! # Modules
//!
//! - [`vocab`] - Character vocabulary (encode/decode)
//! - [`data`] - Corpus loading and random batch sampling
//! - [`tensor`] - Minimal dense tensor with parallel matmul
//! - [`layers`] - Trainable layers with explicit backward passes
//! - [`model`] - The transformer language model
//! - [`gradients`] - Gradient container and norm clipping
//! - [`optimizer`] - AdamW
//! - [`trainer`] - The training loop, cancellation and run state
//! - [`checkpoint`] - Binary checkpoint files and retention
//! - [`generate`] - Autoregressive sampling
//! - [`metrics`] - Training history, summary and CSV log
//! - [`config`] - Hyperparameters, loadable from TOML
//!
//! # Example
//!
//! ```rust,no_run
//! use charlm::{Trainer, TrainingConfig};
//!
//! let config = TrainingConfig::from_toml_file("tiny.toml")?;
//! let mut trainer = Trainer::new(config)?;
//! let summary = trainer.run()?;
//! println!("best loss {:.3} at iteration {}", summary.best.loss, summary.best.iteration);
//!
//! let text = trainer.generator(1337).generate(200, Some("ROMEO:"))?;
//! println!("{}", text);
//! # Ok::<(), charlm::Error>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod layers;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod trainer;
pub mod vocab;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata, LoadedCheckpoint};
pub use config::{CheckpointConfig, DatasetConfig, ModelConfig, OptimizationConfig, TrainingConfig};
pub use data::{Batch, Corpus, Datasets};
pub use error::{Error, Result};
pub use generate::Generator;
pub use gradients::Gradients;
pub use metrics::{EvaluationMetrics, RunOutcome, TrainingStepMetrics, TrainingSummary};
pub use model::LanguageModel;
pub use optimizer::AdamW;
pub use tensor::Tensor;
pub use trainer::{CancellationToken, Trainer, TrainerState};
pub use vocab::Vocabulary;
