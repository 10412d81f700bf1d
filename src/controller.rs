//! Sampling loop controller
//!
//! Repeats diffusion + gather rounds until the corpus holds enough samples,
//! then trims it to the exact target:
//!
//! ```text
//! Collecting --(accumulated >= target)--> Ready --> Truncating --> Done
//! ```
//!
//! Transitions only move forward. A failure in any round aborts the whole
//! controller; a partial corpus is never returned.

use candle_core::{Device, Tensor};

use crate::cluster::{Communicator, DistributedAggregator};
use crate::diffusion::{Denoiser, NoiseSource, ReverseDiffusionProcess};
use crate::error::{Result, SampleError};

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Collecting,
    Ready,
    Truncating,
    Done,
}

/// Shape of the work each worker does per round
#[derive(Debug, Clone, Copy)]
pub struct RoundShape {
    pub batch_size: usize,
    pub seq_len: usize,
    pub dim: usize,
}

/// Statistics from a finished collection
#[derive(Debug, Default, Clone)]
pub struct CollectionStats {
    pub rounds: usize,
    /// Samples gathered before truncation
    pub gathered: usize,
    /// Samples dropped from the tail
    pub dropped: usize,
}

pub struct SamplingLoopController {
    state: CollectionState,
    shape: RoundShape,
    target: usize,
    batches: Vec<Tensor>,
    accumulated: usize,
    stats: CollectionStats,
}

impl SamplingLoopController {
    pub fn new(shape: RoundShape, target: usize) -> Result<Self> {
        if target == 0 {
            return Err(SampleError::config("target sample count must be positive"));
        }
        if shape.batch_size == 0 {
            return Err(SampleError::config("batch size must be positive"));
        }
        Ok(Self {
            state: CollectionState::Collecting,
            shape,
            target,
            batches: Vec::new(),
            accumulated: 0,
            stats: CollectionStats::default(),
        })
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn accumulated(&self) -> usize {
        self.accumulated
    }

    pub fn stats(&self) -> &CollectionStats {
        &self.stats
    }

    fn transition(&mut self, next: CollectionState) {
        tracing::debug!("Controller {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Add one gathered round while collecting
    pub fn push_round(&mut self, gathered: Tensor) -> Result<()> {
        if self.state != CollectionState::Collecting {
            return Err(SampleError::config(format!(
                "cannot add samples in state {:?}",
                self.state
            )));
        }
        let n = gathered.dims().first().copied().unwrap_or(0);
        if n == 0 {
            return Err(SampleError::config("gathered round is empty"));
        }
        self.accumulated += n;
        self.stats.rounds += 1;
        self.batches.push(gathered);
        tracing::info!("created {} samples", self.accumulated);

        if self.accumulated >= self.target {
            self.transition(CollectionState::Ready);
        }
        Ok(())
    }

    /// Concatenate and trim to exactly `target` samples, dropping the tail
    pub fn finish(&mut self) -> Result<Tensor> {
        if self.state != CollectionState::Ready {
            return Err(SampleError::config(format!(
                "cannot truncate in state {:?}",
                self.state
            )));
        }
        self.transition(CollectionState::Truncating);

        let corpus = Tensor::cat(&self.batches, 0)?;
        self.batches.clear();
        let corpus = corpus.narrow(0, 0, self.target)?;
        self.stats.gathered = self.accumulated;
        self.stats.dropped = self.accumulated - self.target;

        self.transition(CollectionState::Done);
        Ok(corpus)
    }

    /// Drive rounds of diffusion + gather until done
    pub fn run<D, C>(
        &mut self,
        process: &ReverseDiffusionProcess<'_>,
        denoiser: &D,
        aggregator: &DistributedAggregator<C>,
        conditioning: Option<&Tensor>,
        noise: &mut NoiseSource,
        device: &Device,
    ) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
        C: Communicator,
    {
        let shape = (self.shape.batch_size, self.shape.seq_len, self.shape.dim);
        while self.state == CollectionState::Collecting {
            let local = process.sample(denoiser, shape, conditioning, noise, device)?;
            let gathered = aggregator.gather(&local)?;
            self.push_round(gathered)?;
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn shape() -> RoundShape {
        RoundShape {
            batch_size: 2,
            seq_len: 3,
            dim: 4,
        }
    }

    #[test]
    fn test_state_machine_truncates_tail() -> Result<()> {
        let mut controller = SamplingLoopController::new(shape(), 5)?;
        assert_eq!(controller.state(), CollectionState::Collecting);

        for round in 0..3 {
            let batch = Tensor::full(round as f32, (2, 3, 4), &Device::Cpu)?;
            controller.push_round(batch)?;
        }
        assert_eq!(controller.state(), CollectionState::Ready);
        assert_eq!(controller.accumulated(), 6);

        let corpus = controller.finish()?;
        assert_eq!(controller.state(), CollectionState::Done);
        assert_eq!(corpus.dims(), &[5, 3, 4]);
        assert_eq!(controller.stats().dropped, 1);

        let first: Vec<f32> = corpus.narrow(0, 4, 1)?.flatten_all()?.to_vec1()?;
        assert!(first.iter().all(|&v| v == 2.0));
        Ok(())
    }

    #[test]
    fn test_no_backward_transitions() -> Result<()> {
        let mut controller = SamplingLoopController::new(shape(), 2)?;
        assert!(controller.finish().is_err());

        controller.push_round(Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?)?;
        assert!(controller
            .push_round(Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?)
            .is_err());
        controller.finish()?;
        assert!(controller.finish().is_err());
        Ok(())
    }

    #[test]
    fn test_zero_target_rejected() {
        assert!(SamplingLoopController::new(shape(), 0).is_err());
    }
}
