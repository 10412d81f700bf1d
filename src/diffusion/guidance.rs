//! Guidance strategies applied to the predicted clean sample
//!
//! Rounding keeps the trajectory on the embedding manifold: every position of
//! x_0 is snapped to its nearest vocabulary vector before the next latent is
//! computed.

use std::sync::Arc;

use candle_core::Tensor;

use crate::config::GuidanceMode;
use crate::embedding::EmbeddingTable;
use crate::error::Result;

/// Projection applied to the predicted x_0 at every reverse step
pub trait GuidanceFunction: Send + Sync {
    /// `step` is the 1-based reverse step index (T down to 1)
    fn apply(&self, predicted: &Tensor, step: usize) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

/// Identity guidance
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuidance;

impl GuidanceFunction for NoGuidance {
    fn apply(&self, predicted: &Tensor, _step: usize) -> Result<Tensor> {
        Ok(predicted.clone())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Nearest-embedding rounding ("clamp")
#[derive(Debug, Clone)]
pub struct RoundingGuidance {
    table: Arc<EmbeddingTable>,
}

impl RoundingGuidance {
    pub fn new(table: Arc<EmbeddingTable>) -> Self {
        Self { table }
    }
}

impl GuidanceFunction for RoundingGuidance {
    fn apply(&self, predicted: &Tensor, step: usize) -> Result<Tensor> {
        tracing::trace!("Rounding {:?} onto embeddings at step {}", predicted.dims(), step);
        self.table.round(predicted)
    }

    fn name(&self) -> &'static str {
        "clamp"
    }
}

/// Select the guidance strategy for a run
pub fn build_guidance(mode: GuidanceMode, table: Arc<EmbeddingTable>) -> Box<dyn GuidanceFunction> {
    match mode {
        GuidanceMode::Clamp => Box::new(RoundingGuidance::new(table)),
        GuidanceMode::None => Box::new(NoGuidance),
    }
}
