//! Error taxonomy for the sampling pipeline
//!
//! Every variant names the stage that failed so a diagnostic can be traced
//! back without re-running with extra instrumentation.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, SampleError>;

#[derive(Error, Debug)]
pub enum SampleError {
    /// Incompatible or missing run configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Non-finite value produced mid-diffusion
    #[error("numerical error at diffusion step {step}: non-finite value {value} at element {position}")]
    Numerical {
        step: usize,
        position: usize,
        value: f32,
    },

    /// Worker desync, dropout or malformed contribution
    #[error("distributed error on rank {rank}: {reason}")]
    Distributed { rank: usize, reason: String },

    /// Vocabulary index without a display string
    #[error("decoding error: sequence {sequence}, position {position}: index {index} has no vocabulary entry")]
    Decoding {
        sequence: usize,
        position: usize,
        index: u32,
    },

    /// Generated output diverges from the sanity reference
    #[error("validation error: {0}")]
    Validation(Box<ValidationFailure>),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("weights error: {0}")]
    Weights(String),
}

impl SampleError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn distributed(rank: usize, reason: impl Into<String>) -> Self {
        Self::Distributed {
            rank,
            reason: reason.into(),
        }
    }

    /// Short stage label, used by the CLI when reporting a failure
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Numerical { .. } => "diffusion",
            Self::Distributed { .. } => "aggregation",
            Self::Decoding { .. } => "decoding",
            Self::Validation(_) => "validation",
            Self::Tensor(_) => "tensor",
            Self::Io(_) | Self::Json(_) => "io",
            Self::Weights(_) => "weights",
        }
    }
}

/// Diagnostic payload for a line that failed the similarity check
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    /// Line index in both the generated corpus and the reference
    pub index: usize,
    /// Jaccard similarity of the two token sets
    pub similarity: f64,
    pub generated: BTreeSet<String>,
    pub reference: BTreeSet<String>,
    /// Tokens present in exactly one of the two sets
    pub symmetric_difference: BTreeSet<String>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {} is not similar enough: jaccard={:.4} generated={:?} reference={:?} differing={:?}",
            self.index, self.similarity, self.generated, self.reference, self.symmetric_difference
        )
    }
}
