//! Reverse diffusion over token embeddings
//!
//! Starting from Gaussian noise, the latent is refined for T steps:
//!
//! 1. the denoiser predicts x_0 (or the noise, converted to x_0)
//! 2. guidance projects x_0, optionally followed by clipping to [-1, 1]
//! 3. the next latent is drawn from the posterior (ancestral) or computed with
//!    the eta = 0 DDIM update (deterministic)
//!
//! Any non-finite value aborts the run with the offending step index. There is
//! no retry: a broken schedule or denoiser must surface, not be resampled away.

use candle_core::{DType, Device, Tensor};

use crate::config::SamplingMode;
use crate::error::{Result, SampleError};

use super::guidance::GuidanceFunction;
use super::sampler::{find_non_finite, NoiseSource, SamplingParams};
use super::schedule::{DiffusionSchedule, PredictionType};

/// Learned denoising function.
///
/// Receives the noisy latent (batch, seq_len, dim), one timestep value per
/// batch element, and optional conditioning. Returns either x_0 or the noise,
/// per the schedule's [`PredictionType`], with the latent's shape.
pub trait Denoiser {
    fn denoise(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> candle_core::Result<Tensor>,
{
    fn denoise(
        &self,
        x_t: &Tensor,
        timesteps: &Tensor,
        conditioning: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        self(x_t, timesteps, conditioning)
    }
}

/// Stepwise reverse process for one batch
pub struct ReverseDiffusionProcess<'a> {
    schedule: &'a DiffusionSchedule,
    params: SamplingParams,
    guidance: &'a dyn GuidanceFunction,
}

impl<'a> ReverseDiffusionProcess<'a> {
    pub fn new(
        schedule: &'a DiffusionSchedule,
        params: SamplingParams,
        guidance: &'a dyn GuidanceFunction,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            schedule,
            params,
            guidance,
        })
    }

    pub fn num_steps(&self) -> usize {
        self.schedule.num_steps()
    }

    /// Draw initial noise of `shape` and run all reverse steps
    pub fn sample<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        shape: (usize, usize, usize),
        conditioning: Option<&Tensor>,
        noise: &mut NoiseSource,
        device: &Device,
    ) -> Result<Tensor> {
        let x_t = noise.standard_normal(shape, device)?;
        self.sample_from(denoiser, x_t, conditioning, noise)
    }

    /// Run all reverse steps from a given starting latent
    pub fn sample_from<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x_t: Tensor,
        conditioning: Option<&Tensor>,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let mut x = x_t;
        for step in (1..=self.num_steps()).rev() {
            x = self.step(denoiser, &x, step, conditioning, noise)?;
        }
        Ok(x)
    }

    /// One reverse step; `step` is 1-based, the schedule index is `step - 1`
    fn step<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        x: &Tensor,
        step: usize,
        conditioning: Option<&Tensor>,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let t = step - 1;
        let s = self.schedule;
        let device = x.device();
        let batch = x.dims()[0];

        let timesteps = Tensor::full(s.model_timestep(t) as f32, batch, device)?;
        let output = denoiser
            .denoise(x, &timesteps, conditioning)?
            .to_dtype(DType::F32)?;
        if output.dims() != x.dims() {
            return Err(SampleError::config(format!(
                "denoiser returned {:?} for latent {:?}",
                output.dims(),
                x.dims()
            )));
        }
        ensure_finite(&output, step)?;

        let ab = s.alpha_cumprod(t);
        let ab_prev = s.alpha_cumprod_prev(t);

        let pred_x0 = match s.prediction_type() {
            PredictionType::Sample => output,
            PredictionType::Epsilon => x
                .sub(&output.affine((1.0 - ab).sqrt(), 0.0)?)?
                .affine(1.0 / ab.sqrt(), 0.0)?,
        };
        let pred_x0 = self.guidance.apply(&pred_x0, step)?;
        let pred_x0 = if self.params.clip_denoised {
            pred_x0.clamp(-1f32, 1f32)?
        } else {
            pred_x0
        };

        let next = match self.params.mode {
            SamplingMode::Ancestral => {
                let (c1, c2) = s.posterior_mean_coefs(t);
                let mean = pred_x0.affine(c1, 0.0)?.add(&x.affine(c2, 0.0)?)?;
                if t > 0 {
                    let z = noise.truncated_normal(x.shape(), self.params.top_p, device)?;
                    mean.add(&z.affine(s.posterior_variance(t).sqrt(), 0.0)?)?
                } else {
                    mean
                }
            }
            SamplingMode::Deterministic => {
                let eps = x
                    .sub(&pred_x0.affine(ab.sqrt(), 0.0)?)?
                    .affine(1.0 / (1.0 - ab).sqrt(), 0.0)?;
                pred_x0
                    .affine(ab_prev.sqrt(), 0.0)?
                    .add(&eps.affine((1.0 - ab_prev).sqrt(), 0.0)?)?
            }
        };
        ensure_finite(&next, step)?;

        tracing::trace!("Reverse step {} done (t={})", step, t);
        Ok(next)
    }
}

fn ensure_finite(tensor: &Tensor, step: usize) -> Result<()> {
    match find_non_finite(tensor)? {
        Some((position, value)) => Err(SampleError::Numerical {
            step,
            position,
            value,
        }),
        None => Ok(()),
    }
}
