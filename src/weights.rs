//! Tensor loading from safetensors files
//!
//! Embedding tables and saved sample corpora are stored as single named
//! tensors. Half-precision and f64 payloads are widened/narrowed to F32.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::SafeTensors;

use crate::decoding::LinearProjection;
use crate::embedding::EmbeddingTable;
use crate::error::{Result, SampleError};

/// Common tensor names for the word embedding in diffusion checkpoints
pub const EMBEDDING_KEYS: [&str; 3] = ["word_embedding.weight", "weight", "embeddings"];

/// Default tensor name for a saved sample corpus
pub const SAMPLES_KEY: &str = "samples";

/// Vocabulary projection stored next to the word embedding
pub const LM_HEAD_WEIGHT_KEY: &str = "lm_head.weight";
pub const LM_HEAD_BIAS_KEY: &str = "lm_head.bias";

/// Load every tensor of a safetensors file as F32
pub fn load_safetensors_file<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;

    // Memory-map for efficient loading
    let mmap = unsafe { Mmap::map(&file)? };
    let st = SafeTensors::deserialize(&mmap)
        .map_err(|e| SampleError::Weights(format!("{}: {}", path.display(), e)))?;

    let mut tensors = HashMap::new();
    for name in st.names() {
        let view = st
            .tensor(name)
            .map_err(|e| SampleError::Weights(format!("{}: {}", name, e)))?;
        let tensor = tensor_from_view(&view, device)?;
        tensors.insert(name.to_string(), tensor);
    }

    tracing::debug!("Loaded {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Load a single named tensor, or the first of `keys` that is present
fn load_named<P: AsRef<Path>>(path: P, keys: &[&str], device: &Device) -> Result<Tensor> {
    let path = path.as_ref();
    let mut tensors = load_safetensors_file(path, device)?;
    for key in keys {
        if let Some(tensor) = tensors.remove(*key) {
            return Ok(tensor);
        }
    }
    // A file holding exactly one tensor is unambiguous
    if tensors.len() == 1 {
        if let Some((_, tensor)) = tensors.into_iter().next() {
            return Ok(tensor);
        }
    }
    Err(SampleError::Weights(format!(
        "none of {:?} found in {}",
        keys,
        path.display()
    )))
}

/// Load a frozen embedding table of shape (vocab, dim)
pub fn load_embedding_table<P: AsRef<Path>>(
    path: P,
    key: Option<&str>,
    device: &Device,
) -> Result<EmbeddingTable> {
    let weight = match key {
        Some(key) => load_named(path, &[key], device)?,
        None => load_named(path, &EMBEDDING_KEYS, device)?,
    };
    let table = EmbeddingTable::new(weight)?;
    tracing::info!(
        "Embedding table: {} entries x {} dims",
        table.vocab_size(),
        table.dim()
    );
    Ok(table)
}

/// Load the checkpoint's vocabulary projection, if it carries one.
///
/// The weight is (vocab, dim); the bias, when present, is (vocab,).
pub fn load_lm_head<P: AsRef<Path>>(path: P, device: &Device) -> Result<Option<LinearProjection>> {
    let mut tensors = load_safetensors_file(path, device)?;
    let weight = match tensors.remove(LM_HEAD_WEIGHT_KEY) {
        Some(weight) => weight,
        None => return Ok(None),
    };
    let (vocab, _) = weight.dims2().map_err(|_| {
        SampleError::Weights(format!(
            "{} must be (vocab, dim), got {:?}",
            LM_HEAD_WEIGHT_KEY,
            weight.dims()
        ))
    })?;

    let bias = tensors.remove(LM_HEAD_BIAS_KEY);
    if let Some(bias) = &bias {
        if bias.dims() != [vocab] {
            return Err(SampleError::Weights(format!(
                "{} must be ({},), got {:?}",
                LM_HEAD_BIAS_KEY,
                vocab,
                bias.dims()
            )));
        }
    }

    tracing::info!(
        "LM head: {} entries, bias={}",
        vocab,
        bias.is_some()
    );
    Ok(Some(LinearProjection::new(weight, bias)))
}

/// Load a saved (batch, seq_len, dim) sample corpus
pub fn load_sample_corpus<P: AsRef<Path>>(
    path: P,
    key: Option<&str>,
    device: &Device,
) -> Result<Tensor> {
    let corpus = load_named(path, &[key.unwrap_or(SAMPLES_KEY)], device)?;
    if corpus.rank() != 3 {
        return Err(SampleError::Weights(format!(
            "sample corpus must be (batch, seq_len, dim), got {:?}",
            corpus.dims()
        )));
    }
    Ok(corpus)
}

/// Convert safetensors TensorView to an F32 candle Tensor
fn tensor_from_view(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    use safetensors::Dtype as StDtype;

    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let values: Vec<f32> = match view.dtype() {
        StDtype::BF16 => data
            .chunks_exact(2)
            .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        StDtype::F16 => data
            .chunks_exact(2)
            .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        StDtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        StDtype::F64 => data
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
        other => {
            return Err(SampleError::Weights(format!(
                "unsupported dtype for embeddings/samples: {:?}",
                other
            )))
        }
    };

    let tensor = Tensor::from_vec(values, shape.as_slice(), device)?;
    debug_assert_eq!(tensor.dtype(), DType::F32);
    Ok(tensor)
}

/// Save a sample corpus so it can be decoded later with the CLI
pub fn save_sample_corpus<P: AsRef<Path>>(corpus: &Tensor, path: P) -> Result<()> {
    let corpus = corpus.to_dtype(DType::F32)?;
    let tensors: HashMap<String, Tensor> = [(SAMPLES_KEY.to_string(), corpus)].into();
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}
