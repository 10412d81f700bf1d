//! embdiff-rs CLI
//!
//! Decode saved sample corpora, validate outputs, inspect run configurations.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use embdiff_rs::engine::{EMBEDDINGS_FILE, TRAINING_ARGS_FILE, VOCAB_FILE};
use embdiff_rs::output::{read_lines, SanityValidator};
use embdiff_rs::weights::load_sample_corpus;
use embdiff_rs::{RunConfig, SampleError, SamplingPipeline};

/// Resolve a checkpoint directory - either local or a HuggingFace model ID
///
/// If the path exists locally, use it directly.
/// Otherwise, treat it as a HF model ID (e.g., "org/diffusion-lm-e2e")
/// and resolve it from the HuggingFace cache.
fn resolve_checkpoint_dir(model: &str) -> Result<PathBuf> {
    let local_path = PathBuf::from(model);

    if local_path.exists() {
        return Ok(local_path);
    }

    if !model.contains('/') {
        anyhow::bail!(
            "Checkpoint '{}' not found locally and doesn't look like a HF model ID (expected 'org/model')",
            model
        );
    }

    eprintln!("Resolving HuggingFace checkpoint: {}", model);

    let api = Api::new().context("Failed to initialize HuggingFace API")?;
    let repo = api.repo(Repo::new(model.to_string(), RepoType::Model));

    repo.get(VOCAB_FILE)
        .with_context(|| format!("Failed to fetch {}", VOCAB_FILE))?;
    // Optional; older checkpoints ship without it
    if repo.get(TRAINING_ARGS_FILE).is_err() {
        tracing::warn!("{} has no {}", model, TRAINING_ARGS_FILE);
    }
    let embeddings_path = repo
        .get(EMBEDDINGS_FILE)
        .with_context(|| format!("Failed to fetch {}", EMBEDDINGS_FILE))?;

    let checkpoint_dir = embeddings_path
        .parent()
        .context("Invalid cache path structure")?
        .to_path_buf();

    eprintln!("Resolved to: {}", checkpoint_dir.display());
    Ok(checkpoint_dir)
}

/// Attach the failing stage to a library error
fn staged<T>(result: embdiff_rs::Result<T>) -> Result<T> {
    result.map_err(|e: SampleError| {
        let stage = e.stage();
        anyhow::Error::new(e).context(format!("{} stage failed", stage))
    })
}

#[derive(Parser)]
#[command(name = "embdiff-cli")]
#[command(about = "Embedding diffusion LM sampling tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a saved sample corpus, write outputs and run the sanity check
    Decode {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory or HuggingFace ID; defaults to the
        /// directory of model_name_or_path
        #[arg(short, long)]
        model: Option<String>,

        /// Safetensors file holding a (batch, seq_len, dim) corpus
        #[arg(short, long)]
        samples: PathBuf,

        /// Tensor name inside the samples file
        #[arg(long)]
        key: Option<String>,

        /// Reference file, overriding sanity_reference from the config
        #[arg(short, long)]
        reference: Option<PathBuf>,
    },

    /// Validate an existing output file against a reference
    Validate {
        /// Generated `.txt` output
        #[arg(short, long)]
        generated: PathBuf,

        /// Reference file, one line per sequence
        #[arg(short, long)]
        reference: PathBuf,

        /// Minimum Jaccard similarity (exclusive)
        #[arg(short, long, default_value = "0.9")]
        threshold: f64,
    },

    /// Load, merge and validate a run configuration, then print it
    CheckConfig {
        /// Run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint directory whose training_args.json gets merged
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode {
            config,
            model,
            samples,
            key,
            reference,
        } => {
            let mut run_config = staged(RunConfig::from_file(&config))
                .with_context(|| format!("Failed to load {}", config.display()))?;
            if let Some(reference) = reference {
                run_config.sanity_reference = Some(reference);
            }

            let checkpoint_dir = match model {
                Some(model) => resolve_checkpoint_dir(&model)?,
                None => run_config.checkpoint_dir(),
            };

            eprintln!("Loading checkpoint...");
            let load_start = Instant::now();
            let pipeline = staged(SamplingPipeline::from_pretrained(run_config, &checkpoint_dir))?;
            eprintln!("Checkpoint loaded in {:.2}s", load_start.elapsed().as_secs_f64());

            let corpus = staged(load_sample_corpus(&samples, key.as_deref(), pipeline.device()))
                .with_context(|| format!("Failed to load samples from {}", samples.display()))?;
            tracing::info!("Corpus shape: {:?}", corpus.dims());

            let decode_start = Instant::now();
            let (lines, outputs, report) = staged(pipeline.finish_corpus(&corpus, true))?;

            eprintln!("\n--- Output ---");
            if let Some(outputs) = outputs {
                println!("{}", outputs.text.display());
                println!("{}", outputs.json.display());
            }

            eprintln!("\n--- Stats ---");
            eprintln!("Sequences decoded: {}", lines.len());
            eprintln!("Lines validated: {}", report.lines_checked);
            eprintln!("Min jaccard: {:.4}", report.min_similarity);
            eprintln!("Time: {:.2}s", decode_start.elapsed().as_secs_f64());
        }

        Commands::Validate {
            generated,
            reference,
            threshold,
        } => {
            let lines = staged(read_lines(&generated))
                .with_context(|| format!("Failed to read {}", generated.display()))?;
            let report = staged(
                SanityValidator::with_threshold(threshold).validate_file(&lines, &reference),
            )?;
            println!(
                "Sanity check passed: {} lines, min jaccard {:.4}",
                report.lines_checked, report.min_similarity
            );
        }

        Commands::CheckConfig { config, model } => {
            let mut run_config = staged(RunConfig::from_file(&config))
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let checkpoint_dir = model.unwrap_or_else(|| run_config.checkpoint_dir());
            let training_args = checkpoint_dir.join(TRAINING_ARGS_FILE);
            if training_args.exists() {
                tracing::info!("Merging {}", training_args.display());
                staged(run_config.apply_training_args(&training_args))?;
            }
            staged(run_config.validate())?;

            println!("{}", serde_json::to_string_pretty(&run_config)?);
            eprintln!(
                "Target samples: {} ({} x {})",
                run_config.target_samples(),
                run_config.num_samples,
                run_config.candidates_per_sample
            );
            eprintln!("Output identifier: {}", run_config.model_identifier());
        }
    }

    Ok(())
}
