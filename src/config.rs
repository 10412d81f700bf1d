//! Run configuration for diffusion sampling

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SampleError};

/// How predicted clean samples are projected during sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidanceMode {
    /// Snap every position onto its nearest embedding row
    Clamp,
    /// Leave predictions untouched
    None,
}

/// Reverse-process update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Stochastic posterior sampling (DDPM)
    Ancestral,
    /// Fixed update with no noise after the initial draw (DDIM, eta = 0)
    Deterministic,
}

/// Shape of the noise schedule the model was trained with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSchedule {
    /// alpha_bar(t) = 1 - sqrt(t + 1e-4), the usual choice for text diffusion
    Sqrt,
    Linear,
    Cosine,
}

/// Configuration for one sampling run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Samples drawn per worker per round
    pub batch_size: usize,

    /// Requested number of output sequences
    pub num_samples: usize,

    /// Candidates kept per requested sample (MBR decoding)
    #[serde(default = "default_candidates", alias = "mbr_sample")]
    pub candidates_per_sample: usize,

    /// Number of reverse diffusion steps
    pub diffusion_steps: usize,

    /// Tokens per sequence
    pub sequence_len: usize,

    /// Embedding dimension
    pub in_channel: usize,

    /// Truncation threshold for the sampling noise, in (0, 1]
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_clamp")]
    pub clamp: GuidanceMode,

    #[serde(default = "default_sampling")]
    pub sampling: SamplingMode,

    /// Clamp predicted clean samples to [-1, 1]
    #[serde(default)]
    pub clip_denoised: bool,

    /// Feed timesteps to the denoiser on a 0..1000 scale
    #[serde(default = "default_true")]
    pub rescale_timesteps: bool,

    #[serde(default = "default_noise_schedule")]
    pub noise_schedule: NoiseSchedule,

    /// Denoiser predicts x_0 directly (otherwise the noise)
    #[serde(default = "default_true")]
    pub predict_xstart: bool,

    pub out_dir: PathBuf,

    /// Path of the checkpoint file; the output name is derived from it
    pub model_name_or_path: PathBuf,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Reference file for the post-run sanity check
    #[serde(default)]
    pub sanity_reference: Option<PathBuf>,
}

fn default_candidates() -> usize {
    1
}

fn default_top_p() -> f64 {
    1.0
}

fn default_clamp() -> GuidanceMode {
    GuidanceMode::Clamp
}

fn default_sampling() -> SamplingMode {
    SamplingMode::Ancestral
}

fn default_true() -> bool {
    true
}

fn default_noise_schedule() -> NoiseSchedule {
    NoiseSchedule::Sqrt
}

fn default_seed() -> u64 {
    crate::DEFAULT_SEED
}

/// Architecture keys a checkpoint's training_args.json may override
#[derive(Debug, Default, Deserialize)]
struct TrainingArgs {
    #[serde(default)]
    sequence_len: Option<usize>,
    #[serde(default)]
    in_channel: Option<usize>,
    #[serde(default)]
    noise_schedule: Option<NoiseSchedule>,
    #[serde(default)]
    predict_xstart: Option<bool>,
    #[serde(default)]
    rescale_timesteps: Option<bool>,
}

impl RunConfig {
    /// Load configuration from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Merge the architecture settings a checkpoint was trained with.
    ///
    /// The run's own batch size and step count always win.
    pub fn apply_training_args<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let args: TrainingArgs = serde_json::from_str(&content)?;
        if let Some(v) = args.sequence_len {
            self.sequence_len = v;
        }
        if let Some(v) = args.in_channel {
            self.in_channel = v;
        }
        if let Some(v) = args.noise_schedule {
            self.noise_schedule = v;
        }
        if let Some(v) = args.predict_xstart {
            self.predict_xstart = v;
        }
        if let Some(v) = args.rescale_timesteps {
            self.rescale_timesteps = v;
        }
        Ok(())
    }

    /// Check the configuration before any sampling starts
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("num_samples", self.num_samples),
            ("candidates_per_sample", self.candidates_per_sample),
            ("sequence_len", self.sequence_len),
            ("in_channel", self.in_channel),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SampleError::config(format!("{name} must be positive")));
            }
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SampleError::config(format!(
                "top_p must lie in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.model_identifier().is_empty() {
            return Err(SampleError::config("model_name_or_path has no file name"));
        }
        if self.sanity_reference.is_none() {
            return Err(SampleError::config("sanity_reference path is required"));
        }
        Ok(())
    }

    /// Total samples the controller must hand to the decoder
    pub fn target_samples(&self) -> usize {
        self.num_samples * self.candidates_per_sample
    }

    /// `<checkpoint dir name>.<checkpoint file name>`
    pub fn model_identifier(&self) -> String {
        model_identifier_from_path(&self.model_name_or_path)
    }

    /// Directory holding the checkpoint (and its training_args.json)
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_name_or_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Derive the output identifier from a checkpoint path
pub fn model_identifier_from_path(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path
        .parent()
        .and_then(Path::file_name)
        .map(|d| d.to_string_lossy().into_owned());
    match dir {
        Some(dir) if !file.is_empty() => format!("{dir}.{file}"),
        _ => file,
    }
}
