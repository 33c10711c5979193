//! Training Configuration
//!
//! Hyperparameters are split into four value objects, mirroring how a run is
//! described:
//!
//! - [`ModelConfig`]: architecture (shape of the transformer)
//! - [`OptimizationConfig`]: batching, AdamW, evaluation cadence
//! - [`DatasetConfig`]: where the training and validation text live
//! - [`CheckpointConfig`]: where and how often parameters are persisted
//!
//! [`TrainingConfig`] bundles them and can be read from TOML:
//!
//! ```toml
//! seed = 1337
//!
//! [model]
//! block_size = 64
//! embedding_dim = 64
//! num_layers = 2
//! num_heads = 4
//! dropout = 0.1
//!
//! [optimization]
//! batch_size = 8
//! learning_rate = 3e-4
//! max_iters = 2000
//! eval_interval = 100
//! eval_iters = 20
//!
//! [dataset]
//! training_file = "data/train.txt"
//! validation_file = "data/val.txt"
//!
//! [checkpoint]
//! output_directory = "runs/tiny"
//! save_interval = 500
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transformer architecture
///
/// `vocab_size` is a placeholder until the training vocabulary is built; the
/// trainer overwrites it before the model is constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Context length: the most tokens the model ever sees at once
    pub block_size: usize,
    pub embedding_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Dropout probability used in training mode
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 65,
            block_size: 256,
            embedding_dim: 384,
            num_layers: 6,
            num_heads: 6,
            dropout: 0.2,
        }
    }
}

impl ModelConfig {
    /// Very small model for smoke tests and quick experiments
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            block_size: 32,
            embedding_dim: 32,
            num_layers: 2,
            num_heads: 2,
            dropout: 0.0,
        }
    }

    /// A model that learns something useful from a few MB of text on a laptop
    pub fn small(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            block_size: 128,
            embedding_dim: 128,
            num_layers: 4,
            num_heads: 4,
            dropout: 0.1,
        }
    }

    /// Width of a single attention head
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Configuration("vocab_size must be greater than zero".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Configuration("block_size must be greater than zero".into()));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Configuration("embedding_dim must be greater than zero".into()));
        }
        if self.num_layers == 0 {
            return Err(Error::Configuration("num_layers must be greater than zero".into()));
        }
        if self.num_heads == 0 {
            return Err(Error::Configuration("num_heads must be greater than zero".into()));
        }
        if self.embedding_dim % self.num_heads != 0 {
            return Err(Error::Configuration(format!(
                "embedding_dim ({}) must be divisible by num_heads ({})",
                self.embedding_dim, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Configuration("dropout must be in [0, 1)".into()));
        }
        Ok(())
    }
}

/// Optimization hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub batch_size: usize,
    /// Peak learning rate
    pub learning_rate: f32,
    pub max_iters: usize,
    /// Evaluate on validation data every N iterations
    pub eval_interval: usize,
    /// Validation batches averaged per evaluation
    pub eval_iters: usize,
    /// Decoupled AdamW weight decay, applied to weight matrices only
    pub weight_decay: f32,
    /// Global gradient-norm clip threshold; 0 disables clipping
    pub gradient_clip: f32,
    /// Linear warmup length in iterations; 0 disables warmup
    pub warmup_iters: usize,
    /// Cosine-decay floor. `None` keeps the learning rate constant after warmup
    pub min_learning_rate: Option<f32>,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            learning_rate: 3e-4,
            max_iters: 5000,
            eval_interval: 500,
            eval_iters: 200,
            weight_decay: 0.1,
            gradient_clip: 1.0,
            warmup_iters: 0,
            min_learning_rate: None,
        }
    }
}

impl OptimizationConfig {
    /// Learning rate at 1-based iteration `iter`
    ///
    /// ```text
    /// iter <= warmup:         lr * iter / warmup
    /// no min_learning_rate:   lr
    /// otherwise:              min + 0.5 * (lr - min) * (1 + cos(pi * progress))
    /// ```
    pub fn learning_rate_at(&self, iter: usize) -> f32 {
        if self.warmup_iters > 0 && iter <= self.warmup_iters {
            return self.learning_rate * iter as f32 / self.warmup_iters as f32;
        }
        let Some(min_lr) = self.min_learning_rate else {
            return self.learning_rate;
        };
        let decay_span = self.max_iters.saturating_sub(self.warmup_iters).max(1);
        let progress = (iter.saturating_sub(self.warmup_iters) as f32 / decay_span as f32).min(1.0);
        let coeff = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
        min_lr + coeff * (self.learning_rate - min_lr)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be greater than zero".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::Configuration("learning_rate must be positive".into()));
        }
        if self.eval_interval == 0 {
            return Err(Error::Configuration("eval_interval must be greater than zero".into()));
        }
        if self.eval_iters == 0 {
            return Err(Error::Configuration("eval_iters must be greater than zero".into()));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::Configuration("weight_decay must not be negative".into()));
        }
        if self.gradient_clip < 0.0 {
            return Err(Error::Configuration("gradient_clip must not be negative".into()));
        }
        if let Some(min_lr) = self.min_learning_rate {
            if !(0.0..=self.learning_rate).contains(&min_lr) {
                return Err(Error::Configuration(
                    "min_learning_rate must be in [0, learning_rate]".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Paths to raw text files
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub training_file: Option<PathBuf>,
    pub validation_file: Option<PathBuf>,
}

impl DatasetConfig {
    pub fn new(training_file: impl Into<PathBuf>, validation_file: impl Into<PathBuf>) -> Self {
        Self {
            training_file: Some(training_file.into()),
            validation_file: Some(validation_file.into()),
        }
    }

    /// Both paths, or a configuration error naming the missing one
    pub fn paths(&self) -> Result<(&Path, &Path)> {
        let training = required_path(self.training_file.as_deref(), "training_file")?;
        let validation = required_path(self.validation_file.as_deref(), "validation_file")?;
        Ok((training, validation))
    }
}

fn required_path<'a>(path: Option<&'a Path>, name: &str) -> Result<&'a Path> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Err(Error::Configuration(format!("dataset.{name} is required"))),
    }
}

/// Checkpoint location and cadence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub output_directory: PathBuf,
    /// Unconditional checkpoint every N iterations; 0 disables
    pub save_interval: usize,
    /// File stem prefix, e.g. `model` -> `model-iter000100.ckpt`
    pub prefix: String,
    /// Keep only the N most recent checkpoints plus the best one; 0 keeps all
    pub keep_last: usize,
    /// Write `training_log.csv` next to the checkpoints
    pub write_training_log: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from("checkpoints"),
            save_interval: 0,
            prefix: "model".to_string(),
            keep_last: 0,
            write_training_log: true,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.contains(['/', '\\']) {
            return Err(Error::Configuration(format!(
                "checkpoint prefix {:?} must be a non-empty file name",
                self.prefix
            )));
        }
        Ok(())
    }
}

/// Everything needed to run one training job
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimization: OptimizationConfig,
    pub dataset: DatasetConfig,
    pub checkpoint: CheckpointConfig,
    /// Seed for batch sampling, dropout and initialization; random when absent
    pub seed: Option<u64>,
}

impl TrainingConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate everything except the model's `vocab_size`, which is only known
    /// once the dataset has been read.
    pub fn validate(&self) -> Result<()> {
        let mut model = self.model.clone();
        model.vocab_size = model.vocab_size.max(1);
        model.validate()?;
        self.optimization.validate()?;
        self.checkpoint.validate()
    }
}
