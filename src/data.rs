//! Training Data Loading
//!
//! A [`Corpus`] holds one encoded token stream (training or validation) and
//! samples fixed-length windows from it at random positions:
//!
//! ```text
//! Tokens:     [a, b, c, d, e, f, g, h]     block_size = 3
//! start = 2:  input  [c, d, e]
//!             target [d, e, f]
//! ```
//!
//! The target is always the input shifted by one position, teaching the
//! model to predict the next token. Every row picks its own start offset,
//! uniformly from `[0, len - block_size - 1)`, with replacement.
//!
//! Randomness comes from the generator passed to
//! [`Corpus::sample_batch`]; seed it for reproducible batches.

use std::fs;
use std::path::Path;

use rand::Rng;
use tracing::info;

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::vocab::Vocabulary;

/// Input/target windows sampled from a corpus
///
/// `inputs` and `targets` both have shape `[batch_size][block_size]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
    /// Start offset of each row in the corpus
    pub starts: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// An encoded token sequence with a fixed window length
#[derive(Clone, Debug)]
pub struct Corpus {
    tokens: Vec<usize>,
    block_size: usize,
}

impl Corpus {
    /// Wrap an encoded token sequence
    ///
    /// Fails with [`Error::Data`] unless `tokens.len() > block_size + 1`;
    /// shorter sequences leave no valid start offset.
    pub fn new(tokens: Vec<usize>, block_size: usize) -> Result<Self> {
        if tokens.len() <= block_size + 1 {
            return Err(Error::Data(format!(
                "corpus of {} tokens is too small for block_size {} (need more than {})",
                tokens.len(),
                block_size,
                block_size + 1
            )));
        }
        Ok(Self { tokens, block_size })
    }

    /// Encode `text` with `vocab` and wrap it
    pub fn from_text(text: &str, vocab: &Vocabulary, block_size: usize) -> Result<Self> {
        Self::new(vocab.encode(text)?, block_size)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn tokens(&self) -> &[usize] {
        &self.tokens
    }

    /// Number of distinct start offsets a window can take
    pub fn num_windows(&self) -> usize {
        self.tokens.len() - self.block_size - 1
    }

    /// Sample `batch_size` random input/target windows
    pub fn sample_batch<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Batch {
        let upper = self.num_windows();
        let mut inputs = Vec::with_capacity(batch_size);
        let mut targets = Vec::with_capacity(batch_size);
        let mut starts = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let start = rng.random_range(0..upper);
            inputs.push(self.tokens[start..start + self.block_size].to_vec());
            targets.push(self.tokens[start + 1..start + self.block_size + 1].to_vec());
            starts.push(start);
        }

        Batch {
            inputs,
            targets,
            starts,
        }
    }
}

/// Training and validation corpora sharing one vocabulary
pub struct Datasets {
    pub vocab: Vocabulary,
    pub train: Corpus,
    pub validation: Corpus,
}

impl Datasets {
    /// Build the vocabulary from both texts, then encode each split
    ///
    /// Building from the union means validation text can never contain an
    /// unknown character.
    pub fn from_texts(train_text: &str, validation_text: &str, block_size: usize) -> Result<Self> {
        let vocab = Vocabulary::from_chars(train_text.chars().chain(validation_text.chars()));
        let train = Corpus::from_text(train_text, &vocab, block_size)?;
        let validation = Corpus::from_text(validation_text, &vocab, block_size)?;
        Ok(Self {
            vocab,
            train,
            validation,
        })
    }

    /// Read both files named by `config`
    pub fn load(config: &DatasetConfig, block_size: usize) -> Result<Self> {
        let (train_path, validation_path) = config.paths()?;
        let train_text = read_text(train_path)?;
        let validation_text = read_text(validation_path)?;

        let datasets = Self::from_texts(&train_text, &validation_text, block_size)?;
        info!(
            train_tokens = datasets.train.len(),
            validation_tokens = datasets.validation.len(),
            vocab_size = datasets.vocab.size(),
            "loaded datasets"
        );
        Ok(datasets)
    }
}

fn read_text(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(Error::Configuration(format!(
            "dataset file {} does not exist",
            path.display()
        )));
    }
    Ok(fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn alphabet_corpus(block_size: usize) -> (Vocabulary, Corpus) {
        let vocab = Vocabulary::from_text("abcdefgh");
        let corpus = Corpus::from_text("abcdefgh", &vocab, block_size).unwrap();
        (vocab, corpus)
    }

    #[test]
    fn test_batch_shapes_and_shift() {
        let vocab = Vocabulary::from_text("the quick brown fox jumps over the lazy dog");
        let corpus = Corpus::from_text(
            "the quick brown fox jumps over the lazy dog",
            &vocab,
            8,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let batch = corpus.sample_batch(5, &mut rng);
        assert_eq!(batch.inputs.len(), 5);
        assert_eq!(batch.targets.len(), 5);

        for ((input, target), &start) in batch.inputs.iter().zip(&batch.targets).zip(&batch.starts) {
            assert_eq!(input.len(), 8);
            assert_eq!(target.len(), 8);
            for t in 0..8 {
                assert_eq!(input[t], corpus.tokens()[start + t]);
                assert_eq!(target[t], corpus.tokens()[start + t + 1]);
            }
        }
    }

    #[test]
    fn test_eight_token_corpus_start_range() {
        let (vocab, corpus) = alphabet_corpus(3);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = [false; 4];

        for _ in 0..500 {
            let batch = corpus.sample_batch(1, &mut rng);
            let start = batch.starts[0];
            assert!(start <= 4, "start {} outside [0, 4]", start);
            assert!(start < corpus.num_windows());
            seen[start] = true;

            let input = &batch.inputs[0];
            let target = &batch.targets[0];
            assert_eq!(input.len(), 3);
            assert_eq!(&input[1..], &target[..2]);

            let text = vocab.decode(input).unwrap();
            assert_eq!(text, &"abcdefgh"[start..start + 3]);
        }
        assert!(seen.iter().all(|&s| s), "every start offset should be drawn");
    }

    #[test]
    fn test_too_small_corpus_is_data_error() {
        let vocab = Vocabulary::from_text("abcd");
        assert!(matches!(
            Corpus::from_text("abcd", &vocab, 3),
            Err(Error::Data(_))
        ));
        assert!(matches!(
            Corpus::from_text("abc", &vocab, 3),
            Err(Error::Data(_))
        ));
        assert!(Corpus::new(vec![0; 5], 3).is_ok());

        let wider = Vocabulary::from_text("abcde");
        let corpus = Corpus::from_text("abcde", &wider, 3).unwrap();
        assert_eq!(corpus.num_windows(), 1);
    }

    #[test]
    fn test_seeded_sampling_is_deterministic() {
        let (_, corpus) = alphabet_corpus(2);
        let a = corpus.sample_batch(4, &mut StdRng::seed_from_u64(9));
        let b = corpus.sample_batch(4, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_datasets_share_vocabulary() {
        let datasets = Datasets::from_texts("aaaaabbbbb", "cccccc", 2).unwrap();
        assert_eq!(datasets.vocab.size(), 3);
        assert_eq!(datasets.validation.tokens()[0], datasets.vocab.encode_char('c').unwrap());
    }

    #[test]
    fn test_load_missing_file_is_configuration_error() {
        let config = DatasetConfig::new("/definitely/not/here.txt", "/nor/here.txt");
        assert!(matches!(
            Datasets::load(&config, 4),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            Datasets::load(&DatasetConfig::default(), 4),
            Err(Error::Configuration(_))
        ));
    }
}
