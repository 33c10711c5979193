//! End-to-end training, checkpointing and sampling on tiny corpora.

use std::fs;
use std::path::Path;

use charlm::checkpoint::{checkpoint_path, list_checkpoints, metrics_path};
use charlm::{
    load_checkpoint, DatasetConfig, Error, ModelConfig, RunOutcome, Trainer, TrainerState,
    TrainingConfig,
};

const TRAIN: &str = "First Citizen:\nBefore we proceed any further, hear me speak.\n\n\
                     All:\nSpeak, speak.\n\nFirst Citizen:\nYou are all resolved rather \
                     to die than to famish?\n";
const VALID: &str = "All:\nResolved. resolved.\n\nFirst Citizen:\nFirst, you know Caius \
                     Marcius is chief enemy to the people.\n";

fn tiny_config(dir: &Path, max_iters: usize, eval_interval: usize) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model = ModelConfig::tiny(0);
    config.model.block_size = 8;
    config.model.embedding_dim = 16;
    config.model.num_heads = 2;
    config.optimization.batch_size = 2;
    config.optimization.learning_rate = 3e-3;
    config.optimization.max_iters = max_iters;
    config.optimization.eval_interval = eval_interval;
    config.optimization.eval_iters = 2;
    config.checkpoint.output_directory = dir.to_path_buf();
    config.seed = Some(7);
    config
}

#[test]
fn history_has_one_entry_per_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Trainer::from_texts(tiny_config(dir.path(), 6, 3), TRAIN, VALID)
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.iterations_completed, 6);
    let iterations: Vec<usize> = summary.history.iter().map(|h| h.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3, 4, 5, 6]);
    for step in &summary.history {
        assert!(step.training_loss.is_finite() && step.training_loss >= 0.0);
    }
    assert!(summary
        .history
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn evaluations_follow_the_interval() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Trainer::from_texts(tiny_config(dir.path(), 5, 2), TRAIN, VALID)
        .unwrap()
        .run()
        .unwrap();

    let evaluated: Vec<usize> = summary
        .history
        .iter()
        .filter(|h| h.validation_loss.is_some())
        .map(|h| h.iteration)
        .collect();
    assert_eq!(evaluated, vec![2, 4]);
}

#[test]
fn best_is_the_minimum_validation_loss() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Trainer::from_texts(tiny_config(dir.path(), 12, 2), TRAIN, VALID)
        .unwrap()
        .run()
        .unwrap();

    // Running best never increases
    let mut running = f32::INFINITY;
    let mut bests = Vec::new();
    for loss in summary.history.iter().filter_map(|h| h.validation_loss) {
        running = running.min(loss);
        bests.push(running);
    }
    assert!(bests.windows(2).all(|w| w[1] <= w[0]));
    assert_eq!(summary.best.loss, running);
    assert!((summary.best.perplexity - running.exp()).abs() < 1e-3);

    let at_best = &summary.history[summary.best.iteration - 1];
    assert_eq!(at_best.validation_loss, Some(summary.best.loss));
}

#[test]
fn checkpoints_on_new_best_and_save_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_config(dir.path(), 6, 2);
    config.checkpoint.save_interval = 3;
    let summary = Trainer::from_texts(config, TRAIN, VALID)
        .unwrap()
        .run()
        .unwrap();

    // The first evaluation is always a new best
    assert!(checkpoint_path(dir.path(), "model", 2).exists());
    assert!(metrics_path(&checkpoint_path(dir.path(), "model", 2)).exists());
    assert!(checkpoint_path(dir.path(), "model", 3).exists());
    assert!(checkpoint_path(dir.path(), "model", 6).exists());
    assert!(!checkpoint_path(dir.path(), "model", 1).exists());
    assert!(!checkpoint_path(dir.path(), "model", 5).exists());

    // Every checkpoint is either a save_interval multiple or a new best
    let mut running = f32::INFINITY;
    let mut best_iters = Vec::new();
    for h in &summary.history {
        if let Some(loss) = h.validation_loss {
            if loss < running {
                running = loss;
                best_iters.push(h.iteration);
            }
        }
    }
    for (iteration, _) in list_checkpoints(dir.path(), "model").unwrap() {
        assert!(iteration % 3 == 0 || best_iters.contains(&iteration));
    }

    assert_eq!(
        summary.last_checkpoint_path,
        Some(checkpoint_path(dir.path(), "model", 6))
    );
}

#[test]
fn cancellation_stops_after_the_current_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let mut trainer = Trainer::from_texts(tiny_config(dir.path(), 50, 10), TRAIN, VALID).unwrap();
    trainer.cancellation_token().cancel();

    let summary = trainer.run().unwrap();
    assert_eq!(trainer.state(), TrainerState::Cancelled);
    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.iterations_completed, 1);
    assert_eq!(summary.history.len(), 1);
    // No evaluation ran during the loop, so one runs at the end
    assert_eq!(summary.best.iteration, 1);
    assert!(summary.best.loss.is_finite());
    assert!(dir.path().join("summary.json").exists());
}

#[test]
fn train_from_files_then_sample_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let train_path = dir.path().join("train.txt");
    let valid_path = dir.path().join("valid.txt");
    fs::write(&train_path, TRAIN).unwrap();
    fs::write(&valid_path, VALID).unwrap();

    let out = dir.path().join("run");
    let mut config = tiny_config(&out, 4, 2);
    config.dataset = DatasetConfig::new(&train_path, &valid_path);
    config.checkpoint.save_interval = 4;

    let mut trainer = Trainer::new(config).unwrap();
    let summary = trainer.run().unwrap();
    assert_eq!(trainer.state(), TrainerState::Completed);

    let path = summary.last_checkpoint_path.unwrap();
    let loaded = load_checkpoint(&path).unwrap();
    assert_eq!(&loaded.vocab, trainer.vocabulary());

    let mut generator = charlm::Generator::new(
        &loaded.model,
        &loaded.vocab,
        rand::SeedableRng::seed_from_u64(3),
    );
    assert_eq!(generator.generate(0, Some("F")).unwrap(), "");
    let text = generator.generate(20, Some("First")).unwrap();
    assert_eq!(text.chars().count(), 20);

    // Same weights and seed sample the same text as the live model
    let live = trainer.generator(11).generate(15, Some("All")).unwrap();
    let restored = charlm::Generator::new(
        &loaded.model,
        &loaded.vocab,
        rand::SeedableRng::seed_from_u64(11),
    )
    .generate(15, Some("All"))
    .unwrap();
    assert_eq!(live, restored);
}

#[test]
fn missing_dataset_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_config(dir.path(), 2, 1);
    config.dataset = DatasetConfig::new(dir.path().join("nope.txt"), dir.path().join("nope2.txt"));
    assert!(matches!(Trainer::new(config), Err(Error::Configuration(_))));

    let config = tiny_config(dir.path(), 2, 1);
    assert!(matches!(Trainer::new(config), Err(Error::Configuration(_))));
}

#[test]
fn corpus_too_small_is_a_data_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(dir.path(), 2, 1);
    assert!(matches!(
        Trainer::from_texts(config, "tiny", VALID),
        Err(Error::Data(_))
    ));
}
