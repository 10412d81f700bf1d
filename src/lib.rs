//! embdiff-rs: sampling text from an embedding-space diffusion language model
//!
//! Sequences are drawn as continuous word embeddings by a reverse diffusion
//! process, optionally snapped onto the embedding table at every step,
//! gathered across a group of workers, decoded to tokens and checked against
//! a reference corpus.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod decoding;
pub mod diffusion;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod output;
pub mod weights;

pub use cluster::{Cluster, Communicator, DistributedAggregator, LocalGroup, SingleProcess};
pub use config::RunConfig;
pub use embedding::EmbeddingTable;
pub use engine::{PipelineOutcome, SamplingPipeline};
pub use error::{Result, SampleError};

/// Seed used when the run configuration does not set one
pub const DEFAULT_SEED: u64 = 101;
