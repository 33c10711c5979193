//! Character Vocabulary
//!
//! Maps every distinct character of the training text to a dense integer id.
//! Symbols are sorted by code point, so the same text always produces the
//! same ids.
//!
//! ```text
//! Text:  "hello"
//! Chars: ['e', 'h', 'l', 'o']
//! Ids:    e=0   h=1   l=2   o=3
//! "hello" -> [1, 0, 2, 2, 3]
//! ```
//!
//! ## Example
//!
//! ```rust
//! use charlm::Vocabulary;
//!
//! let vocab = Vocabulary::from_text("hello");
//! assert_eq!(vocab.size(), 4);
//!
//! let ids = vocab.encode("hell")?;
//! assert_eq!(vocab.decode(&ids)?, "hell");
//! # Ok::<(), charlm::Error>(())
//! ```

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bijection between characters and contiguous ids `[0, size)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<char>", into = "Vec<char>")]
pub struct Vocabulary {
    id_to_char: Vec<char>,
    char_to_id: HashMap<char, usize>,
}

impl Vocabulary {
    /// Build a vocabulary from any character stream
    ///
    /// Duplicates are removed and symbols are ordered by code point.
    pub fn from_chars<I>(chars: I) -> Self
    where
        I: IntoIterator<Item = char>,
    {
        let unique: BTreeSet<char> = chars.into_iter().collect();
        Self::from(unique.into_iter().collect::<Vec<_>>())
    }

    /// Build a vocabulary from the characters of `text`
    pub fn from_text(text: &str) -> Self {
        Self::from_chars(text.chars())
    }

    /// Number of distinct symbols
    pub fn size(&self) -> usize {
        self.id_to_char.len()
    }

    /// True when `c` was seen during construction
    pub fn contains(&self, c: char) -> bool {
        self.char_to_id.contains_key(&c)
    }

    /// Symbols in id order
    pub fn chars(&self) -> &[char] {
        &self.id_to_char
    }

    /// Id of a single character
    pub fn encode_char(&self, c: char) -> Result<usize> {
        self.char_to_id.get(&c).copied().ok_or(Error::Encoding(c))
    }

    /// Ids of every character of `text`, in order
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars().map(|c| self.encode_char(c)).collect()
    }

    /// Concatenate the characters for `ids`
    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.id_to_char.get(id).copied().ok_or(Error::Range {
                    id,
                    size: self.size(),
                })
            })
            .collect()
    }
}

impl From<Vec<char>> for Vocabulary {
    fn from(mut chars: Vec<char>) -> Self {
        chars.sort_unstable();
        chars.dedup();
        let char_to_id = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self {
            id_to_char: chars,
            char_to_id,
        }
    }
}

impl From<Vocabulary> for Vec<char> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.id_to_char
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_symbol_vocabulary() {
        let vocab = Vocabulary::from_text("ab");
        assert_eq!(vocab.size(), 2);

        let a = vocab.encode_char('a').unwrap();
        let b = vocab.encode_char('b').unwrap();
        assert_ne!(a, b);
        assert_eq!(vocab.decode(&[a, b]).unwrap(), "ab");
    }

    #[test]
    fn test_size_counts_distinct_characters() {
        let vocab = Vocabulary::from_text("mississippi");
        assert_eq!(vocab.size(), 4);
        assert_eq!(vocab.chars(), &['i', 'm', 'p', 's']);
    }

    #[test]
    fn test_ids_sorted_by_code_point() {
        let vocab = Vocabulary::from_text("zA a");
        assert_eq!(vocab.encode(" Aaz").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let text = "To be, or not to be: that is the question.\nÀ bientôt, 日本語";
        let vocab = Vocabulary::from_text(text);
        let ids = vocab.encode(text).unwrap();
        assert_eq!(ids.len(), text.chars().count());
        assert_eq!(vocab.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_unknown_character_is_encoding_error() {
        let vocab = Vocabulary::from_text("abc");
        match vocab.encode("abx") {
            Err(Error::Encoding('x')) => {}
            other => panic!("expected encoding error, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_id_is_range_error() {
        let vocab = Vocabulary::from_text("abc");
        match vocab.decode(&[0, 3]) {
            Err(Error::Range { id: 3, size: 3 }) => {}
            other => panic!("expected range error, got {:?}", other),
        }
    }

    #[test]
    fn test_serde_roundtrip_preserves_ids() {
        let vocab = Vocabulary::from_text("hello world");
        let json = serde_json::to_string(&vocab).unwrap();
        let restored: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, vocab);
        assert_eq!(restored.encode("low").unwrap(), vocab.encode("low").unwrap());
    }
}
