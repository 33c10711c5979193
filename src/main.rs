//! charlm command-line driver
//!
//! ```bash
//! # Train from a TOML config; prints the summary as JSON
//! charlm train --config tiny.toml --seed 1337
//!
//! # Sample from a checkpoint
//! charlm generate --checkpoint runs/tiny/model-iter002000.ckpt \
//!     --prompt "ROMEO:" --max-tokens 300 --temperature 0.8
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use charlm::{load_checkpoint, Generator, Trainer, TrainingConfig};

#[derive(Parser)]
#[command(name = "charlm", about = "Train and sample a character-level language model")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a model from a TOML configuration file
    Train {
        /// Path to the training configuration
        #[arg(long)]
        config: PathBuf,

        /// Override optimization.max_iters
        #[arg(long)]
        max_iters: Option<usize>,

        /// Override the random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Override checkpoint.output_directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Generate text from a checkpoint
    Generate {
        /// Checkpoint file written during training
        #[arg(long)]
        checkpoint: PathBuf,

        /// Number of characters to generate
        #[arg(long, default_value_t = 500)]
        max_tokens: usize,

        /// Text to continue; defaults to a single space
        #[arg(long)]
        prompt: Option<String>,

        /// Sampling seed; random when absent
        #[arg(long)]
        seed: Option<u64>,

        /// Softmax temperature
        #[arg(long, default_value_t = 1.0)]
        temperature: f32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "charlm failed");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Train {
            config,
            max_iters,
            seed,
            output,
        } => {
            let mut config = TrainingConfig::from_toml_file(&config)?;
            if let Some(max_iters) = max_iters {
                config.optimization.max_iters = max_iters;
            }
            if seed.is_some() {
                config.seed = seed;
            }
            if let Some(output) = output {
                config.checkpoint.output_directory = output;
            }

            let mut trainer = Trainer::new(config)?;
            let summary = trainer.run()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Generate {
            checkpoint,
            max_tokens,
            prompt,
            seed,
            temperature,
        } => {
            let loaded = load_checkpoint(&checkpoint)?;
            let rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            let mut generator =
                Generator::new(&loaded.model, &loaded.vocab, rng).with_temperature(temperature)?;
            let text = generator.generate(max_tokens, prompt.as_deref())?;
            println!("{}{}", prompt.as_deref().unwrap_or(""), text);
        }
    }
    Ok(())
}
