//! Autoregressive Text Generation
//!
//! Starting from a prompt, repeatedly predict a distribution over the next
//! character, draw one, append it and feed the longer sequence back in:
//!
//! ```text
//! context = last min(len, block_size) tokens
//! probs   = softmax(logits[last position] / temperature)
//! next    ~ Categorical(probs)
//! ```
//!
//! Temperatures below 1 sharpen the distribution, above 1 flatten it.
//!
//! ## Example
//!
//! ```rust
//! use charlm::{Generator, LanguageModel, ModelConfig, Vocabulary};
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let vocab = Vocabulary::from_text("to be or not to be");
//! let model = LanguageModel::new(&ModelConfig::tiny(vocab.size()), &mut StdRng::seed_from_u64(0))?;
//!
//! let mut generator = Generator::new(&model, &vocab, StdRng::seed_from_u64(1));
//! let text = generator.generate(10, Some("to "))?;
//! assert_eq!(text.chars().count(), 10);
//! # Ok::<(), charlm::Error>(())
//! ```

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::model::LanguageModel;
use crate::tensor::softmax;
use crate::vocab::Vocabulary;

/// Prompt used when none is given
pub const DEFAULT_PROMPT: &str = " ";

pub struct Generator<'a> {
    model: &'a LanguageModel,
    vocab: &'a Vocabulary,
    rng: StdRng,
    temperature: f32,
}

impl<'a> Generator<'a> {
    pub fn new(model: &'a LanguageModel, vocab: &'a Vocabulary, rng: StdRng) -> Self {
        Self {
            model,
            vocab,
            rng,
            temperature: 1.0,
        }
    }

    /// Scale logits by `1 / temperature` before sampling
    pub fn with_temperature(mut self, temperature: f32) -> Result<Self> {
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(Error::Configuration(format!(
                "temperature must be positive, got {}",
                temperature
            )));
        }
        self.temperature = temperature;
        Ok(self)
    }

    /// Generate `max_new_tokens` characters after `prompt`
    ///
    /// Returns only the new text. An absent or empty prompt means
    /// [`DEFAULT_PROMPT`]; characters outside the vocabulary are an
    /// [`Error::Encoding`].
    pub fn generate(&mut self, max_new_tokens: usize, prompt: Option<&str>) -> Result<String> {
        let prompt = prompt.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PROMPT);
        let mut tokens = self.vocab.encode(prompt)?;
        let prompt_len = tokens.len();
        let block_size = self.model.config().block_size;

        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(block_size);
            let next = self.next_token(&tokens[start..])?;
            tokens.push(next);
        }

        self.vocab.decode(&tokens[prompt_len..])
    }

    fn next_token(&mut self, context: &[usize]) -> Result<usize> {
        let logits = self.model.forward(&[context.to_vec()])?;
        let v = self.model.config().vocab_size;
        let last = &logits.data[logits.len() - v..];

        let scaled: Vec<f32> = last.iter().map(|&l| l / self.temperature).collect();
        let probs = softmax(&scaled);
        if probs.iter().any(|p| !p.is_finite()) {
            return Err(Error::Numeric("sampling distribution is not finite".into()));
        }
        Ok(sample_from_probs(&probs, &mut self.rng))
    }
}

/// Draw an index from a categorical distribution by inverting its CDF
pub fn sample_from_probs<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r: f32 = rng.random();
    let mut cumulative = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if r < cumulative {
            return i;
        }
    }
    // Rounding can leave the total just under 1
    probs.len() - 1
}
