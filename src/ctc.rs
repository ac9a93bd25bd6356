//! Greedy CTC decoding of recognizer output.

use float_ord::FloatOrd;
use ndarray::{Array2, ArrayView2, ArrayViewD, Axis, Ix3};
use thiserror::Error;
use tracing::instrument;

use crate::DecodedText;

/// Class index reserved for the CTC blank.
pub const BLANK: usize = 0;

/// Characters the bundled recognizer was trained on, in class order (class
/// `i + 1` is the `i`-th character).
pub const CYRILLIC_CHARACTERS: &str = concat!(
    "0123456789!",
    "ABCDEFGHIJKLMNOPQRSTUVWXYZ",
    "abcdefghijklmnopqrstuvwxyz",
    "АБВГДЕЁЖЗИЙКЛМНОПРСТУФХЦЧШЩЪЫЬЭЮЯ",
    "абвгдеёжзийклмнопрстуфхцчшщъыьэюя",
    "ЂђЃѓЄєІіЇїЈјЉљЊњЋћЌќЎўЏџҐґҒғҚқҮүҲҳҶҷӀӏӢӣӨөӮӯ",
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("class index {index} is outside the vocabulary of {size} classes")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("expected a (1, T, V) tensor, got shape {0:?}")]
    InvalidShape(Vec<usize>),
}

/// Class-index to character table. Index 0 is the blank and has no character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    characters: Vec<char>,
}

impl Vocabulary {
    pub fn new(characters: &str) -> Self {
        Self {
            characters: characters.chars().collect(),
        }
    }

    /// Number of classes, blank included.
    pub fn len(&self) -> usize {
        self.characters.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<char> {
        index
            .checked_sub(1)
            .and_then(|i| self.characters.get(i))
            .copied()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(CYRILLIC_CHARACTERS)
    }
}

/// `prod(p) ^ (2 / sqrt(n))`; zero when no step survived.
pub fn confidence_score(max_probs: &[f32]) -> f32 {
    if max_probs.is_empty() {
        return 0.0;
    }
    let product: f64 = max_probs.iter().map(|&p| p as f64).product();
    let exponent = 2.0 / (max_probs.len() as f64).sqrt();
    product.powf(exponent) as f32
}

#[derive(Debug, Clone)]
pub struct CtcDecoder {
    vocabulary: Vocabulary,
    apply_softmax: bool,
}

impl CtcDecoder {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            apply_softmax: false,
        }
    }

    /// Treat recognizer output as raw logits and run a softmax before normalising.
    pub fn with_softmax(mut self, apply_softmax: bool) -> Self {
        self.apply_softmax = apply_softmax;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Decodes a `(1, T, V)` tensor.
    #[instrument(level = "trace", skip(self, scores))]
    pub fn decode_greedy(&self, scores: ArrayViewD<f32>) -> Result<DecodedText, DecodeError> {
        let shape = scores.shape().to_vec();
        let scores = scores
            .into_dimensionality::<Ix3>()
            .map_err(|_| DecodeError::InvalidShape(shape.clone()))?;
        if scores.len_of(Axis(0)) != 1 {
            return Err(DecodeError::InvalidShape(shape));
        }
        self.decode_steps(scores.index_axis(Axis(0), 0))
    }

    /// Decodes a `(T, V)` matrix of per-step class scores.
    pub fn decode_steps(&self, steps: ArrayView2<f32>) -> Result<DecodedText, DecodeError> {
        let probs = self.normalize(steps);

        let mut text = String::new();
        let mut character_scores = Vec::new();
        let mut previous = None;
        for row in probs.outer_iter() {
            let (index, prob) = row
                .iter()
                .enumerate()
                .fold((BLANK, f32::NEG_INFINITY), |best, (i, &p)| {
                    if FloatOrd(p) > FloatOrd(best.1) {
                        (i, p)
                    } else {
                        best
                    }
                });
            if index != BLANK {
                character_scores.push(prob);
                if previous != Some(index) {
                    let character =
                        self.vocabulary
                            .get(index)
                            .ok_or(DecodeError::IndexOutOfRange {
                                index,
                                size: self.vocabulary.len(),
                            })?;
                    text.push(character);
                }
            }
            previous = Some(index);
        }

        let confidence = confidence_score(&character_scores);
        log::trace!("Decoded '{text}' with confidence {confidence}");
        Ok(DecodedText {
            text,
            confidence,
            character_scores,
        })
    }

    fn normalize(&self, steps: ArrayView2<f32>) -> Array2<f32> {
        let mut probs = steps.to_owned();
        for mut row in probs.outer_iter_mut() {
            if self.apply_softmax {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                row.mapv_inplace(|v| (v - max).exp());
            }
            let sum = row.sum();
            if sum > 0.0 {
                row.mapv_inplace(|v| v / sum);
            }
        }
        probs
    }
}

impl Default for CtcDecoder {
    fn default() -> Self {
        Self::new(Vocabulary::default())
    }
}
