//! Noise schedule and posterior coefficients
//!
//! All per-timestep quantities are precomputed in f64 once per run; the
//! schedule is immutable afterwards.

use crate::config::{NoiseSchedule, RunConfig};
use crate::error::{Result, SampleError};

/// Maximum beta, as in improved DDPM
const MAX_BETA: f64 = 0.999;

/// What the denoiser returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// The clean sample x_0
    Sample,
    /// The noise that was added
    Epsilon,
}

/// Immutable diffusion schedule for one run
#[derive(Debug, Clone)]
pub struct DiffusionSchedule {
    num_steps: usize,
    rescale_timesteps: bool,
    prediction_type: PredictionType,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl DiffusionSchedule {
    pub fn new(
        num_steps: usize,
        noise_schedule: NoiseSchedule,
        prediction_type: PredictionType,
        rescale_timesteps: bool,
    ) -> Result<Self> {
        let betas = betas_for_schedule(noise_schedule, num_steps);
        if let Some(bad) = betas.iter().find(|b| !(**b > 0.0 && **b <= 1.0)) {
            return Err(SampleError::config(format!(
                "noise schedule produced invalid beta {bad}"
            )));
        }

        let mut alphas_cumprod = Vec::with_capacity(num_steps);
        for &beta in &betas {
            let alpha = 1.0 - beta;
            alphas_cumprod.push(alpha * *alphas_cumprod.last().unwrap_or(&1f64));
        }
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(num_steps)
            .collect();

        // q(x_{t-1} | x_t, x_0), formula (7) of https://arxiv.org/abs/2006.11239
        let mut posterior_variance = Vec::with_capacity(num_steps);
        let mut posterior_mean_coef1 = Vec::with_capacity(num_steps);
        let mut posterior_mean_coef2 = Vec::with_capacity(num_steps);
        for t in 0..num_steps {
            let beta = betas[t];
            let ab = alphas_cumprod[t];
            let ab_prev = alphas_cumprod_prev[t];
            posterior_variance.push(beta * (1.0 - ab_prev) / (1.0 - ab));
            posterior_mean_coef1.push(beta * ab_prev.sqrt() / (1.0 - ab));
            posterior_mean_coef2.push((1.0 - ab_prev) * (1.0 - beta).sqrt() / (1.0 - ab));
        }

        tracing::debug!(
            "Diffusion schedule: {} steps, {:?}, {:?}, rescale={}",
            num_steps,
            noise_schedule,
            prediction_type,
            rescale_timesteps
        );

        Ok(Self {
            num_steps,
            rescale_timesteps,
            prediction_type,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            posterior_variance,
            posterior_mean_coef1,
            posterior_mean_coef2,
        })
    }

    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let prediction_type = if config.predict_xstart {
            PredictionType::Sample
        } else {
            PredictionType::Epsilon
        };
        Self::new(
            config.diffusion_steps,
            config.noise_schedule,
            prediction_type,
            config.rescale_timesteps,
        )
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn rescale_timesteps(&self) -> bool {
        self.rescale_timesteps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn beta(&self, t: usize) -> f64 {
        self.betas[t]
    }

    pub fn alpha_cumprod(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    pub fn alpha_cumprod_prev(&self, t: usize) -> f64 {
        self.alphas_cumprod_prev[t]
    }

    /// (coef for x_0, coef for x_t) of the posterior mean
    pub fn posterior_mean_coefs(&self, t: usize) -> (f64, f64) {
        (self.posterior_mean_coef1[t], self.posterior_mean_coef2[t])
    }

    /// Posterior variance; t = 0 borrows t = 1 like the clipped log-variance
    /// of improved DDPM, though no noise is added at t = 0 anyway.
    pub fn posterior_variance(&self, t: usize) -> f64 {
        if t == 0 && self.num_steps > 1 {
            self.posterior_variance[1]
        } else {
            self.posterior_variance[t]
        }
    }

    /// Value handed to the denoiser for internal timestep `t`
    pub fn model_timestep(&self, t: usize) -> f64 {
        if self.rescale_timesteps {
            t as f64 * (1000.0 / self.num_steps as f64)
        } else {
            t as f64
        }
    }
}

fn betas_for_schedule(schedule: NoiseSchedule, num_steps: usize) -> Vec<f64> {
    match schedule {
        NoiseSchedule::Linear => {
            // Scaled so the endpoints match the 1000-step reference schedule
            let scale = 1000.0 / num_steps.max(1) as f64;
            let (start, end) = (scale * 0.0001, scale * 0.02);
            if num_steps == 1 {
                return vec![start];
            }
            (0..num_steps)
                .map(|i| start + (end - start) * i as f64 / (num_steps - 1) as f64)
                .collect()
        }
        NoiseSchedule::Cosine => betas_for_alpha_bar(num_steps, |t| {
            ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2)
        }),
        NoiseSchedule::Sqrt => betas_for_alpha_bar(num_steps, |t| 1.0 - (t + 0.0001).sqrt()),
    }
}

/// Discretize a continuous alpha_bar(t), t in [0, 1], into betas
fn betas_for_alpha_bar(num_steps: usize, alpha_bar: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..num_steps)
        .map(|i| {
            let t1 = i as f64 / num_steps as f64;
            let t2 = (i + 1) as f64 / num_steps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphas_cumprod_decreasing() {
        for kind in [NoiseSchedule::Sqrt, NoiseSchedule::Linear, NoiseSchedule::Cosine] {
            let s = DiffusionSchedule::new(50, kind, PredictionType::Sample, true).unwrap();
            for t in 1..50 {
                assert!(s.alpha_cumprod(t) < s.alpha_cumprod(t - 1), "{kind:?} at {t}");
            }
            assert_eq!(s.alpha_cumprod_prev(0), 1.0);
            assert_eq!(s.alpha_cumprod_prev(10), s.alpha_cumprod(9));
        }
    }

    #[test]
    fn test_rescaled_timesteps() {
        let s = DiffusionSchedule::new(200, NoiseSchedule::Sqrt, PredictionType::Sample, true)
            .unwrap();
        assert_eq!(s.model_timestep(0), 0.0);
        assert_eq!(s.model_timestep(100), 500.0);

        let s = DiffusionSchedule::new(200, NoiseSchedule::Sqrt, PredictionType::Sample, false)
            .unwrap();
        assert_eq!(s.model_timestep(100), 100.0);
    }

    #[test]
    fn test_posterior_first_step_keeps_x0() {
        let s = DiffusionSchedule::new(10, NoiseSchedule::Sqrt, PredictionType::Sample, true)
            .unwrap();
        let (c1, c2) = s.posterior_mean_coefs(0);
        assert!((c1 - 1.0).abs() < 1e-9);
        assert!(c2.abs() < 1e-12);
    }

    #[test]
    fn test_zero_steps() {
        let s = DiffusionSchedule::new(0, NoiseSchedule::Sqrt, PredictionType::Sample, true)
            .unwrap();
        assert_eq!(s.num_steps(), 0);
    }
}
