//! High-level sampling pipeline
//!
//! One [`SamplingPipeline`] is shared by every worker of a run. Each worker
//! calls [`SamplingPipeline::run_worker`] with its own communicator:
//!
//! ```text
//! validate config -> diffusion + gather rounds -> truncate -> decode
//!   -> write outputs (rank 0) -> sanity check -> barrier
//! ```
//!
//! Any local failure aborts the group before it is returned, so peers never
//! wait on a worker that has already given up.

use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::cluster::{Cluster, Communicator, DistributedAggregator, LocalGroup};
use crate::config::RunConfig;
use crate::controller::{CollectionStats, RoundShape, SamplingLoopController};
use crate::decoding::{LinearProjection, TokenDecoder, Vocabulary};
use crate::diffusion::{
    build_guidance, Denoiser, DiffusionSchedule, NoiseSource, ReverseDiffusionProcess,
    SamplingParams,
};
use crate::embedding::EmbeddingTable;
use crate::error::{Result, SampleError};
use crate::output::{OutputPaths, OutputWriter, SanityValidator, ValidationReport};
use crate::weights::{load_embedding_table, load_lm_head};

/// File names expected inside a checkpoint directory
pub const TRAINING_ARGS_FILE: &str = "training_args.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.safetensors";
pub const VOCAB_FILE: &str = "vocab.json";

/// What one worker produced
#[derive(Debug)]
pub struct PipelineOutcome {
    pub cluster: Cluster,
    pub lines: Vec<String>,
    /// Set on the primary worker only
    pub outputs: Option<OutputPaths>,
    pub report: ValidationReport,
    pub stats: CollectionStats,
}

/// Shared, read-only state of one sampling run
pub struct SamplingPipeline {
    config: RunConfig,
    schedule: DiffusionSchedule,
    table: Arc<EmbeddingTable>,
    decoder: TokenDecoder,
    head: Option<LinearProjection>,
    conditioning: Option<Tensor>,
    device: Device,
}

impl SamplingPipeline {
    pub fn new(
        config: RunConfig,
        table: EmbeddingTable,
        vocab: Vocabulary,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        if table.dim() != config.in_channel {
            return Err(SampleError::config(format!(
                "embedding table has {} dims, config expects {}",
                table.dim(),
                config.in_channel
            )));
        }
        if vocab.len() < table.vocab_size() {
            tracing::warn!(
                "Vocabulary has {} entries for {} embedding rows",
                vocab.len(),
                table.vocab_size()
            );
        }

        let schedule = DiffusionSchedule::from_config(&config)?;
        let decoder = TokenDecoder::new(vocab, config.sequence_len);
        Ok(Self {
            config,
            schedule,
            table: Arc::new(table),
            decoder,
            head: None,
            conditioning: None,
            device,
        })
    }

    /// Load the embedding table, vocabulary and (when present) the
    /// `lm_head` projection from a checkpoint directory, merging its
    /// training arguments into `config` first.
    pub fn from_pretrained<P: AsRef<Path>>(mut config: RunConfig, checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref();

        let device = Self::select_device()?;
        tracing::info!("Using device: {:?}", device);

        let training_args = checkpoint_dir.join(TRAINING_ARGS_FILE);
        if training_args.exists() {
            config.apply_training_args(&training_args)?;
        }

        tracing::info!("Loading embeddings...");
        let weights_path = checkpoint_dir.join(EMBEDDINGS_FILE);
        let table = load_embedding_table(&weights_path, None, &device)?;
        let head = load_lm_head(&weights_path, &device)?;

        tracing::info!("Loading vocabulary...");
        let vocab = Vocabulary::from_file(checkpoint_dir.join(VOCAB_FILE))?;

        let pipeline = Self::new(config, table, vocab, device)?;
        match head {
            Some(head) => {
                let (vocab_size, dim) = head.dims();
                if dim != pipeline.config.in_channel {
                    return Err(SampleError::config(format!(
                        "lm_head has {} dims, config expects {}",
                        dim, pipeline.config.in_channel
                    )));
                }
                tracing::info!("Decoding through lm_head over {} entries", vocab_size);
                Ok(pipeline.with_head(head))
            }
            None => {
                tracing::info!("No lm_head in checkpoint, decoding by embedding distance");
                Ok(pipeline)
            }
        }
    }

    /// Select the best available device
    pub fn select_device() -> Result<Device> {
        #[cfg(feature = "metal")]
        {
            if candle_core::utils::metal_is_available() {
                return Ok(Device::new_metal(0)?);
            }
        }

        #[cfg(feature = "cuda")]
        {
            if candle_core::utils::cuda_is_available() {
                return Ok(Device::new_cuda(0)?);
            }
        }

        Ok(Device::Cpu)
    }

    /// Decode through a language-model head instead of embedding distances
    pub fn with_head(mut self, head: LinearProjection) -> Self {
        self.head = Some(head);
        self
    }

    /// Conditioning passed unchanged to every denoiser call
    pub fn with_conditioning(mut self, conditioning: Tensor) -> Self {
        self.conditioning = Some(conditioning);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn schedule(&self) -> &DiffusionSchedule {
        &self.schedule
    }

    pub fn table(&self) -> &EmbeddingTable {
        &self.table
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether decoding goes through a vocabulary projection
    pub fn has_head(&self) -> bool {
        self.head.is_some()
    }

    /// Run the whole pipeline as one worker of the group behind `comm`
    pub fn run_worker<D, C>(&self, denoiser: &D, comm: C) -> Result<PipelineOutcome>
    where
        D: Denoiser + ?Sized,
        C: Communicator,
    {
        let aggregator = DistributedAggregator::new(comm);
        let cluster = aggregator.cluster();
        tracing::info!(
            "Worker {}/{} starting",
            cluster.rank(),
            cluster.world_size()
        );

        match self.run_stages(denoiser, &aggregator) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                aggregator.abort(&format!("{} stage: {}", e.stage(), e));
                Err(e)
            }
        }
    }

    /// Run `world_size` workers on local threads and return their outcomes
    /// in rank order. The first root-cause error wins over the distributed
    /// errors it triggered on the other workers.
    pub fn run_local<D>(&self, world_size: usize, denoiser: &D) -> Result<Vec<PipelineOutcome>>
    where
        D: Denoiser + Sync + ?Sized,
    {
        let results = LocalGroup::launch(world_size, |endpoint| self.run_worker(denoiser, endpoint))?;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_error: Option<SampleError> = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let replace = match &first_error {
                        None => true,
                        Some(SampleError::Distributed { .. }) => {
                            !matches!(e, SampleError::Distributed { .. })
                        }
                        Some(_) => false,
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    fn run_stages<D, C>(&self, denoiser: &D, aggregator: &DistributedAggregator<C>) -> Result<PipelineOutcome>
    where
        D: Denoiser + ?Sized,
        C: Communicator,
    {
        let cluster = aggregator.cluster();

        let guidance = build_guidance(self.config.clamp, Arc::clone(&self.table));
        let params = SamplingParams::from_config(&self.config);
        let process = ReverseDiffusionProcess::new(&self.schedule, params, guidance.as_ref())?;
        let mut noise = NoiseSource::for_rank(self.config.seed, cluster.rank());

        tracing::info!(
            "Sampling {} sequences: {} steps, guidance={}, mode={:?}",
            self.config.target_samples(),
            process.num_steps(),
            guidance.name(),
            self.config.sampling
        );

        let shape = RoundShape {
            batch_size: self.config.batch_size,
            seq_len: self.config.sequence_len,
            dim: self.config.in_channel,
        };
        let mut controller = SamplingLoopController::new(shape, self.config.target_samples())?;
        let corpus = controller.run(
            &process,
            denoiser,
            aggregator,
            self.conditioning.as_ref(),
            &mut noise,
            &self.device,
        )?;

        let (lines, outputs, report) = self.finish_corpus(&corpus, cluster.is_primary())?;
        aggregator.barrier()?;

        Ok(PipelineOutcome {
            cluster,
            lines,
            outputs,
            report,
            stats: controller.stats().clone(),
        })
    }

    /// Decode a complete corpus, write it when `primary`, then validate it.
    ///
    /// Also used directly to decode a corpus saved by an earlier run.
    pub fn finish_corpus(
        &self,
        corpus: &Tensor,
        primary: bool,
    ) -> Result<(Vec<String>, Option<OutputPaths>, ValidationReport)> {
        let lines = self.decode(corpus)?;

        let outputs = if primary {
            let writer = OutputWriter::new(
                &self.config.out_dir,
                &self.config.model_identifier(),
                self.config.top_p,
                self.config.diffusion_steps,
            );
            Some(writer.write(&lines)?)
        } else {
            None
        };

        let reference = self
            .config
            .sanity_reference
            .as_ref()
            .ok_or_else(|| SampleError::config("sanity_reference path is required"))?;
        let report = SanityValidator::default().validate_file(&lines, reference)?;
        Ok((lines, outputs, report))
    }

    /// Decode a corpus to space-joined lines
    pub fn decode(&self, corpus: &Tensor) -> Result<Vec<String>> {
        match &self.head {
            Some(head) => self.decoder.decode_to_text(corpus, head),
            None => self.decoder.decode_to_text(corpus, self.table.as_ref()),
        }
    }
}
