//! Error Types
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is the single [`Error`] enum below. Variants follow the failure classes of
//! the training pipeline:
//!
//! - **Configuration**: missing dataset paths or invalid hyperparameters
//! - **Data**: a corpus too small to sample a window from
//! - **Encoding**: a character that is not part of the vocabulary
//! - **Range**: a token id outside `[0, vocab_size)`
//! - **Shape**: a malformed batch (empty, ragged, longer than the context)
//! - **Numeric**: a loss or gradient norm that is NaN or infinite
//! - **Checkpoint**: a checkpoint file that cannot be decoded
//!
//! Cancelling a training run is not an error: it yields a partial
//! [`TrainingSummary`](crate::metrics::TrainingSummary).

use thiserror::Error;

/// Errors raised by vocabulary, data, model, trainer and checkpoint code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("encoding error: character {0:?} is not in the vocabulary")]
    Encoding(char),

    #[error("range error: token id {id} is outside vocabulary of size {size}")]
    Range { id: usize, size: usize },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
