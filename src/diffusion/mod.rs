//! Reverse diffusion over continuous token embeddings
//!
//! - `schedule`: noise schedule and posterior coefficients
//! - `sampler`: sampling parameters, seeded (and top-p truncated) noise
//! - `guidance`: projection strategies for the predicted clean sample
//! - `process`: the stepwise reverse loop

pub mod guidance;
pub mod process;
pub mod sampler;
pub mod schedule;

pub use guidance::{build_guidance, GuidanceFunction, NoGuidance, RoundingGuidance};
pub use process::{Denoiser, ReverseDiffusionProcess};
pub use sampler::{NoiseSource, SamplingParams};
pub use schedule::{DiffusionSchedule, PredictionType};
