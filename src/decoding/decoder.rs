//! Continuous samples -> token ids -> text
//!
//! Every position is scored against the vocabulary by a [`LogitsProjection`]
//! and the top-1 index is kept. Ties go to the lowest index so the same
//! scores always decode to the same sequence.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::Linear;

use crate::embedding::EmbeddingTable;
use crate::error::{Result, SampleError};

use super::vocab::Vocabulary;

/// Maps (batch, seq_len, dim) samples to (batch, seq_len, vocab) scores
pub trait LogitsProjection {
    fn logits(&self, sample: &Tensor) -> Result<Tensor>;
}

/// Scores are negative squared distances to the embedding rows, so an
/// unperturbed embedding always decodes back to its own id.
impl LogitsProjection for EmbeddingTable {
    fn logits(&self, sample: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = sample.dims3()?;
        let dist = self.squared_distances(sample)?;
        Ok(dist.neg()?.reshape((batch, seq_len, self.vocab_size()))?)
    }
}

/// Language-model head: `x W^T + b`
#[derive(Debug, Clone)]
pub struct LinearProjection {
    head: Linear,
}

impl LinearProjection {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            head: Linear::new(weight, bias),
        }
    }

    /// Head tied to the word embedding
    pub fn tied(table: &EmbeddingTable) -> Self {
        Self::new(table.weight().clone(), None)
    }

    /// (vocab, dim)
    pub fn dims(&self) -> (usize, usize) {
        let dims = self.head.weight().dims();
        (
            dims.first().copied().unwrap_or(0),
            dims.last().copied().unwrap_or(0),
        )
    }
}

impl LogitsProjection for LinearProjection {
    fn logits(&self, sample: &Tensor) -> Result<Tensor> {
        Ok(self.head.forward(&sample.to_dtype(DType::F32)?)?)
    }
}

/// Ordered vocabulary ids for one sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSequence {
    ids: Vec<u32>,
}

impl DecodedSequence {
    pub fn new(ids: Vec<u32>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Top-1 decoder over a fixed vocabulary
#[derive(Debug, Clone)]
pub struct TokenDecoder {
    vocab: Vocabulary,
    seq_len: usize,
}

impl TokenDecoder {
    pub fn new(vocab: Vocabulary, seq_len: usize) -> Self {
        Self { vocab, seq_len }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// One sequence of `seq_len` ids per batch element
    pub fn decode<P: LogitsProjection + ?Sized>(
        &self,
        sample: &Tensor,
        projection: &P,
    ) -> Result<Vec<DecodedSequence>> {
        let (_, seq_len, _) = sample.dims3()?;
        if seq_len != self.seq_len {
            return Err(SampleError::config(format!(
                "sample has sequence length {}, expected {}",
                seq_len, self.seq_len
            )));
        }

        // Only the (batch, seq_len) ids leave the device
        let ids: Vec<Vec<u32>> = projection
            .logits(sample)?
            .to_dtype(DType::F32)?
            .argmax(D::Minus1)?
            .to_vec2()?;
        Ok(ids.into_iter().map(DecodedSequence::new).collect())
    }

    /// Map ids to tokens; an id missing from the vocabulary is fatal
    pub fn render(&self, sequences: &[DecodedSequence]) -> Result<Vec<Vec<String>>> {
        sequences
            .iter()
            .enumerate()
            .map(|(sequence, decoded)| {
                decoded
                    .ids()
                    .iter()
                    .enumerate()
                    .map(|(position, &index)| {
                        self.vocab
                            .get(index)
                            .map(str::to_string)
                            .ok_or_else(|| SampleError::Decoding {
                                sequence,
                                position,
                                index,
                            })
                    })
                    .collect::<Result<Vec<String>>>()
            })
            .collect()
    }

    /// Decode and render to space-joined lines
    pub fn decode_to_text<P: LogitsProjection + ?Sized>(
        &self,
        sample: &Tensor,
        projection: &P,
    ) -> Result<Vec<String>> {
        let sequences = self.decode(sample, projection)?;
        Ok(self
            .render(&sequences)?
            .into_iter()
            .map(|tokens| tokens.join(" "))
            .collect())
    }
}
