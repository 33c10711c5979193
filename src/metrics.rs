//! Training Metrics and Logging
//!
//! Records produced by a training run, plus a CSV logger that streams them to
//! disk as training progresses.
//!
//! ## Perplexity
//!
//! Perplexity measures how "surprised" the model is by the data:
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A model that guesses uniformly over `V` characters has perplexity `V`; a
//! perfect model has perplexity 1.
//!
//! ## CSV Format
//!
//! One row per iteration, flushed immediately so a crash loses nothing:
//!
//! ```text
//! step,elapsed_seconds,learning_rate,train_loss,val_loss,val_perplexity
//! 1,0.12,0.000300,4.1744,,
//! 2,0.25,0.000300,4.1523,4.1480,63.31
//! ```
//!
//! Validation columns are empty on iterations without an evaluation.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One entry of the training history
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingStepMetrics {
    /// 1-based iteration number
    pub iteration: usize,
    pub training_loss: f32,
    /// Present only on iterations that ran an evaluation
    pub validation_loss: Option<f32>,
    pub learning_rate: f32,
    pub timestamp: DateTime<Utc>,
}

/// Validation loss measured at one iteration
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub iteration: usize,
    pub loss: f32,
    pub perplexity: f32,
}

impl EvaluationMetrics {
    pub fn from_loss(iteration: usize, loss: f32) -> Self {
        Self {
            iteration,
            loss,
            perplexity: loss.exp(),
        }
    }
}

/// How a training run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Result of a training run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Lowest validation loss seen during the run
    pub best: EvaluationMetrics,
    pub history: Vec<TrainingStepMetrics>,
    pub last_checkpoint_path: Option<PathBuf>,
    pub outcome: RunOutcome,
    pub iterations_completed: usize,
}

impl TrainingSummary {
    /// Write the summary as pretty-printed JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// CSV sink for per-iteration metrics
pub struct TrainingLogger {
    log_file: File,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create `log_path` and write the header row
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = File::create(log_path)?;
        writeln!(
            log_file,
            "step,elapsed_seconds,learning_rate,train_loss,val_loss,val_perplexity"
        )?;

        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    pub fn log(&mut self, step: &TrainingStepMetrics) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let (val_loss, val_perplexity) = match step.validation_loss {
            Some(loss) => (format!("{:.4}", loss), format!("{:.2}", loss.exp())),
            None => (String::new(), String::new()),
        };

        writeln!(
            self.log_file,
            "{},{:.2},{:.6},{:.4},{},{}",
            step.iteration, elapsed, step.learning_rate, step.training_loss, val_loss, val_perplexity
        )?;
        self.log_file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(iteration: usize, validation_loss: Option<f32>) -> TrainingStepMetrics {
        TrainingStepMetrics {
            iteration,
            training_loss: 2.0,
            validation_loss,
            learning_rate: 3e-4,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_perplexity_is_exp_loss() {
        let m = EvaluationMetrics::from_loss(4, 0.0);
        assert_eq!(m.perplexity, 1.0);
        let m = EvaluationMetrics::from_loss(4, 2.0);
        assert!((m.perplexity - 7.389056).abs() < 1e-4);
        assert_eq!(m.iteration, 4);
    }

    #[test]
    fn test_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = TrainingLogger::new(&path).unwrap();
        logger.log(&step(1, None)).unwrap();
        logger.log(&step(2, Some(1.5))).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,"));
        assert!(lines[1].starts_with("1,") && lines[1].ends_with(",2.0000,,"));
        assert!(lines[2].ends_with(",2.0000,1.5000,4.48"));
    }

    #[test]
    fn test_summary_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = TrainingSummary {
            best: EvaluationMetrics::from_loss(2, 1.0),
            history: vec![step(1, None), step(2, Some(1.0))],
            last_checkpoint_path: Some(PathBuf::from("out/model-iter000002.ckpt")),
            outcome: RunOutcome::Cancelled,
            iterations_completed: 2,
        };
        summary.save_json(&path).unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"cancelled\""));
        let restored: TrainingSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, summary);
    }
}
