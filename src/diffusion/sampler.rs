//! Sampling parameters and seeded noise generation

use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::config::{RunConfig, SamplingMode};
use crate::error::{Result, SampleError};

/// Per-run sampling parameters
#[derive(Clone, Debug)]
pub struct SamplingParams {
    /// Noise truncation threshold in (0, 1]
    pub top_p: f64,
    pub mode: SamplingMode,
    /// Clamp predicted x_0 to [-1, 1] after guidance
    pub clip_denoised: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_p: 1.0,
            mode: SamplingMode::Ancestral,
            clip_denoised: false,
        }
    }
}

impl SamplingParams {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            top_p: config.top_p,
            mode: config.sampling,
            clip_denoised: config.clip_denoised,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SampleError::config(format!(
                "top_p must lie in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Seeded source of Gaussian noise.
///
/// Noise is drawn on the host so runs with the same seed reproduce exactly,
/// whatever the device.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Independent stream for one worker of a group
    pub fn for_rank(seed: u64, rank: usize) -> Self {
        Self::new(seed.wrapping_add(rank as u64))
    }

    /// N(0, 1) noise of the given shape
    pub fn standard_normal<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    /// N(0, 1) noise with every element redrawn until |z| <= top_p
    pub fn truncated_normal<S: Into<Shape>>(
        &mut self,
        shape: S,
        top_p: f64,
        device: &Device,
    ) -> Result<Tensor> {
        if !(top_p > 0.0) {
            return Err(SampleError::config(format!("top_p must be positive, got {top_p}")));
        }
        let shape = shape.into();
        let bound = top_p as f32;
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| loop {
                let z: f32 = self.rng.sample(StandardNormal);
                if z.abs() <= bound {
                    break z;
                }
            })
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

/// First non-finite element of a tensor, as (flat index, value).
///
/// A finite sum on the device rules out any NaN or infinity; the tensor is
/// only copied to the host when that check fails.
pub fn find_non_finite(tensor: &Tensor) -> Result<Option<(usize, f32)>> {
    let tensor = tensor.to_dtype(DType::F32)?;
    let sum: f32 = tensor.sum_all()?.to_scalar()?;
    if sum.is_finite() {
        return Ok(None);
    }
    // Finite values can still overflow the sum, so scan before reporting
    let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
    Ok(values
        .into_iter()
        .enumerate()
        .find(|(_, v)| !v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_noise() -> Result<()> {
        let a = NoiseSource::new(101).standard_normal((2, 3, 4), &Device::Cpu)?;
        let b = NoiseSource::new(101).standard_normal((2, 3, 4), &Device::Cpu)?;
        assert_eq!(a.to_vec3::<f32>()?, b.to_vec3::<f32>()?);

        let c = NoiseSource::for_rank(101, 1).standard_normal((2, 3, 4), &Device::Cpu)?;
        assert_ne!(a.to_vec3::<f32>()?, c.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_truncated_noise_bounded() -> Result<()> {
        let mut noise = NoiseSource::new(7);
        let z = noise.truncated_normal((16, 32), 0.3, &Device::Cpu)?;
        let values: Vec<f32> = z.flatten_all()?.to_vec1()?;
        assert_eq!(values.len(), 512);
        assert!(values.iter().all(|v| v.abs() <= 0.3));
        Ok(())
    }

    #[test]
    fn test_find_non_finite() -> Result<()> {
        let t = Tensor::new(&[1f32, 2.0, f32::INFINITY, f32::NAN], &Device::Cpu)?;
        let (idx, value) = find_non_finite(&t)?.unwrap();
        assert_eq!(idx, 2);
        assert!(value.is_infinite());

        let ok = Tensor::new(&[0f32, -1.0], &Device::Cpu)?;
        assert!(find_non_finite(&ok)?.is_none());

        // Overflowing sum of finite values
        let large = Tensor::new(&[f32::MAX, f32::MAX], &Device::Cpu)?;
        assert!(find_non_finite(&large)?.is_none());
        Ok(())
    }

    #[test]
    fn test_params_validate() {
        let mut params = SamplingParams::default();
        assert!(params.validate().is_ok());
        params.top_p = 0.0;
        assert!(params.validate().is_err());
    }
}
