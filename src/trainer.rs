//! Training Loop
//!
//! [`Trainer`] owns everything a run mutates: the model, the optimizer, both
//! corpora, the random number generator and the metrics history. Each
//! iteration:
//!
//! 1. Sample a training batch
//! 2. Forward with loss, backward into freshly zeroed gradients
//! 3. Clip the global gradient norm (when `gradient_clip > 0`)
//! 4. One AdamW step at the scheduled learning rate
//! 5. Every `eval_interval` iterations, average `eval_iters` validation
//!    losses; a new best writes a checkpoint
//! 6. Append the iteration's metrics to the history
//! 7. Every `save_interval` iterations write a checkpoint, unless step 5
//!    already wrote one for this iteration
//! 8. Stop early if the [`CancellationToken`] has been triggered
//!
//! A run that never reached an evaluation gets one after the loop so the
//! summary always carries a best loss.
//!
//! ## Example
//!
//! ```rust,no_run
//! use charlm::{Trainer, TrainingConfig};
//!
//! let config = TrainingConfig::from_toml_file("train.toml")?;
//! let mut trainer = Trainer::new(config)?;
//!
//! let token = trainer.cancellation_token();
//! ctrlc_handler(move || token.cancel());
//!
//! let summary = trainer.run()?;
//! println!("best validation loss {:.4}", summary.best.loss);
//! # fn ctrlc_handler(_f: impl FnOnce()) {}
//! # Ok::<(), charlm::Error>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{apply_retention, checkpoint_path, save_checkpoint, CheckpointMetadata};
use crate::config::TrainingConfig;
use crate::data::Datasets;
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::metrics::{
    EvaluationMetrics, RunOutcome, TrainingLogger, TrainingStepMetrics, TrainingSummary,
};
use crate::model::LanguageModel;
use crate::optimizer::AdamW;
use crate::vocab::Vocabulary;

pub const TRAINING_LOG_FILE: &str = "training_log.csv";
pub const SUMMARY_FILE: &str = "summary.json";

/// Lifecycle of a [`Trainer`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Cooperative stop signal, checked once per iteration
///
/// Clones share the same flag, so a token can be handed to another thread
/// or a signal handler.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Trainer {
    config: TrainingConfig,
    model: LanguageModel,
    optimizer: AdamW,
    datasets: Datasets,
    rng: StdRng,
    state: TrainerState,
    cancel: CancellationToken,
    history: Vec<TrainingStepMetrics>,
}

impl Trainer {
    /// Read the dataset files named in `config` and build a fresh model
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let datasets = Datasets::load(&config.dataset, config.model.block_size)?;
        Self::with_datasets(config, datasets)
    }

    /// Train on in-memory text instead of files
    pub fn from_texts(config: TrainingConfig, train_text: &str, validation_text: &str) -> Result<Self> {
        config.validate()?;
        let datasets = Datasets::from_texts(train_text, validation_text, config.model.block_size)?;
        Self::with_datasets(config, datasets)
    }

    fn with_datasets(mut config: TrainingConfig, datasets: Datasets) -> Result<Self> {
        config.model.vocab_size = datasets.vocab.size();

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let model = LanguageModel::new(&config.model, &mut rng)?;
        let optimizer = AdamW::new(&model);

        info!(
            parameters = model.num_parameters(),
            vocab_size = config.model.vocab_size,
            layers = config.model.num_layers,
            heads = config.model.num_heads,
            "initialized model"
        );

        Ok(Self {
            config,
            model,
            optimizer,
            datasets,
            rng,
            state: TrainerState::Initializing,
            cancel: CancellationToken::new(),
            history: Vec::new(),
        })
    }

    /// Token that stops [`run`](Self::run) at the next iteration boundary
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.datasets.vocab
    }

    /// Sample from the current model with a seeded generator
    pub fn generator(&self, seed: u64) -> Generator<'_> {
        Generator::new(&self.model, &self.datasets.vocab, StdRng::seed_from_u64(seed))
    }

    /// Train for up to `max_iters` iterations
    ///
    /// A trainer runs once; calling `run` again is a configuration error.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        if self.state != TrainerState::Initializing {
            return Err(Error::Configuration(format!(
                "trainer cannot run from state {:?}",
                self.state
            )));
        }
        self.state = TrainerState::Running;

        match self.train() {
            Ok(summary) => {
                self.state = match summary.outcome {
                    RunOutcome::Completed => TrainerState::Completed,
                    RunOutcome::Cancelled => TrainerState::Cancelled,
                };
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "training failed");
                self.state = TrainerState::Failed;
                Err(e)
            }
        }
    }

    fn train(&mut self) -> Result<TrainingSummary> {
        let opt = self.config.optimization.clone();
        let ckpt = self.config.checkpoint.clone();
        fs::create_dir_all(&ckpt.output_directory)?;

        let mut logger = if ckpt.write_training_log {
            Some(TrainingLogger::new(ckpt.output_directory.join(TRAINING_LOG_FILE))?)
        } else {
            None
        };

        info!(
            max_iters = opt.max_iters,
            batch_size = opt.batch_size,
            train_tokens = self.datasets.train.len(),
            validation_tokens = self.datasets.validation.len(),
            "starting training"
        );

        let mut best: Option<EvaluationMetrics> = None;
        let mut best_path: Option<PathBuf> = None;
        let mut last_eval: Option<EvaluationMetrics> = None;
        let mut last_checkpoint: Option<PathBuf> = None;
        let mut iterations_completed = 0;
        let mut outcome = RunOutcome::Completed;

        for iter in 1..=opt.max_iters {
            let batch = self
                .datasets
                .train
                .sample_batch(opt.batch_size, &mut self.rng);
            let (loss, mut grads) =
                self.model
                    .loss_and_gradients(&batch.inputs, &batch.targets, &mut self.rng)?;

            let grad_norm = if opt.gradient_clip > 0.0 {
                Some(grads.clip(opt.gradient_clip)?)
            } else {
                None
            };

            let lr = opt.learning_rate_at(iter);
            self.optimizer
                .step(self.model.parameters_mut(), &grads, lr, opt.weight_decay);
            debug!(iter, loss, lr, ?grad_norm, "step");

            let mut wrote_checkpoint = false;
            let mut validation_loss = None;

            if iter % opt.eval_interval == 0 {
                let eval = self.evaluate(iter)?;
                validation_loss = Some(eval.loss);
                last_eval = Some(eval);
                info!(
                    iter,
                    train_loss = loss,
                    val_loss = eval.loss,
                    perplexity = eval.perplexity,
                    "evaluation"
                );

                if best.map_or(true, |b| eval.loss < b.loss) {
                    best = Some(eval);
                    let path = self.write_checkpoint(iter, Some(eval), None)?;
                    info!(iter, path = %path.display(), "new best checkpoint");
                    best_path = Some(path.clone());
                    last_checkpoint = Some(path);
                    wrote_checkpoint = true;
                }
            }

            let step = TrainingStepMetrics {
                iteration: iter,
                training_loss: loss,
                validation_loss,
                learning_rate: lr,
                timestamp: Utc::now(),
            };
            if let Some(logger) = logger.as_mut() {
                logger.log(&step)?;
            }
            self.history.push(step);

            if ckpt.save_interval > 0 && iter % ckpt.save_interval == 0 && !wrote_checkpoint {
                let path = self.write_checkpoint(iter, last_eval, best_path.as_deref())?;
                info!(iter, path = %path.display(), "periodic checkpoint");
                last_checkpoint = Some(path);
            }

            iterations_completed = iter;
            if self.cancel.is_cancelled() {
                info!(iter, "training cancelled");
                outcome = RunOutcome::Cancelled;
                break;
            }
        }

        let best = match best {
            Some(best) => best,
            None => self.evaluate(iterations_completed)?,
        };

        let summary = TrainingSummary {
            best,
            history: self.history.clone(),
            last_checkpoint_path: last_checkpoint,
            outcome,
            iterations_completed,
        };
        summary.save_json(ckpt.output_directory.join(SUMMARY_FILE))?;

        info!(
            ?outcome,
            iterations = iterations_completed,
            best_loss = best.loss,
            best_iter = best.iteration,
            "training finished"
        );
        Ok(summary)
    }

    /// Mean validation loss over `eval_iters` batches, without dropout
    fn evaluate(&mut self, iteration: usize) -> Result<EvaluationMetrics> {
        let opt = &self.config.optimization;
        let mut total = 0.0;
        for _ in 0..opt.eval_iters {
            let batch = self
                .datasets
                .validation
                .sample_batch(opt.batch_size, &mut self.rng);
            let (loss, _) = self.model.forward_with_loss(&batch.inputs, &batch.targets)?;
            total += loss;
        }
        Ok(EvaluationMetrics::from_loss(
            iteration,
            total / opt.eval_iters as f32,
        ))
    }

    /// Write a checkpoint for `iteration` and apply the retention policy
    ///
    /// `protect` is the current best checkpoint. A freshly written best
    /// passes `None` since it is also the newest file.
    fn write_checkpoint(
        &self,
        iteration: usize,
        evaluation: Option<EvaluationMetrics>,
        protect: Option<&Path>,
    ) -> Result<PathBuf> {
        let ckpt = &self.config.checkpoint;
        let path = checkpoint_path(&ckpt.output_directory, &ckpt.prefix, iteration);
        let metadata = CheckpointMetadata {
            iteration,
            evaluation,
        };
        save_checkpoint(&path, &self.model, &self.datasets.vocab, &metadata)?;

        let protect = protect.unwrap_or(path.as_path());
        match apply_retention(
            &ckpt.output_directory,
            &ckpt.prefix,
            ckpt.keep_last,
            Some(protect),
        ) {
            Ok(removed) if !removed.is_empty() => {
                debug!(count = removed.len(), "removed old checkpoints")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "checkpoint retention failed"),
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    const TEXT: &str = "the quick brown fox jumps over the lazy dog. \
                        pack my box with five dozen liquor jugs. ";

    fn config(dir: &Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.model = ModelConfig::tiny(0);
        config.model.block_size = 8;
        config.model.embedding_dim = 16;
        config.optimization.batch_size = 2;
        config.optimization.max_iters = 5;
        config.optimization.eval_interval = 2;
        config.optimization.eval_iters = 2;
        config.optimization.learning_rate = 1e-3;
        config.checkpoint.output_directory = dir.to_path_buf();
        config.seed = Some(42);
        config
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::from_texts(config(dir.path()), TEXT, TEXT).unwrap();
        assert_eq!(trainer.state(), TrainerState::Initializing);
        trainer.run().unwrap();
        assert_eq!(trainer.state(), TrainerState::Completed);
        assert!(matches!(trainer.run(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_non_finite_loss_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::from_texts(config(dir.path()), TEXT, TEXT).unwrap();
        if let Some(head) = trainer.model.parameters_mut().pop() {
            head.tensor.data.fill(f32::NAN);
        }

        assert!(matches!(trainer.run(), Err(Error::Numeric(_))));
        assert_eq!(trainer.state(), TrainerState::Failed);
        assert!(!dir.path().join(SUMMARY_FILE).exists());
        assert!(matches!(trainer.run(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_vocab_size_taken_from_data() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = Trainer::from_texts(config(dir.path()), TEXT, TEXT).unwrap();
        assert_eq!(
            trainer.model().config().vocab_size,
            Vocabulary::from_text(TEXT).size()
        );
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Trainer::from_texts(config(a_dir.path()), TEXT, TEXT)
            .unwrap()
            .run()
            .unwrap();
        let b = Trainer::from_texts(config(b_dir.path()), TEXT, TEXT)
            .unwrap()
            .run()
            .unwrap();
        let losses = |s: &TrainingSummary| s.history.iter().map(|h| h.training_loss).collect::<Vec<_>>();
        assert_eq!(losses(&a), losses(&b));
        assert_eq!(a.best, b.best);
    }

    #[test]
    fn test_evaluation_after_loop_when_none_ran() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.optimization.max_iters = 3;
        config.optimization.eval_interval = 10;
        let summary = Trainer::from_texts(config, TEXT, TEXT).unwrap().run().unwrap();
        assert_eq!(summary.best.iteration, 3);
        assert!(summary.history.iter().all(|h| h.validation_loss.is_none()));
        assert!(summary.last_checkpoint_path.is_none());
    }

    #[test]
    fn test_writes_log_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        Trainer::from_texts(config(dir.path()), TEXT, TEXT)
            .unwrap()
            .run()
            .unwrap();
        let log = fs::read_to_string(dir.path().join(TRAINING_LOG_FILE)).unwrap();
        assert_eq!(log.lines().count(), 6);
        assert!(dir.path().join(SUMMARY_FILE).exists());
    }

    #[test]
    fn test_retention_keeps_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.optimization.max_iters = 8;
        config.optimization.eval_interval = 100;
        config.checkpoint.save_interval = 1;
        config.checkpoint.keep_last = 2;
        let summary = Trainer::from_texts(config, TEXT, TEXT).unwrap().run().unwrap();

        let remaining = crate::checkpoint::list_checkpoints(dir.path(), "model").unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            summary.last_checkpoint_path,
            Some(checkpoint_path(dir.path(), "model", 8))
        );
    }
}
