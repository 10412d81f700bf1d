//! Fixed id -> string table

use std::collections::HashMap;
use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::{Result, SampleError};

/// Vocabulary used to render decoded ids
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    tokens: HashMap<u32, String>,
}

impl Vocabulary {
    /// Build from (id, token) pairs; duplicate ids are a configuration error
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut tokens = HashMap::new();
        for (id, token) in pairs {
            if tokens.insert(id, token.into()).is_some() {
                return Err(SampleError::config(format!("duplicate vocabulary id {id}")));
            }
        }
        Ok(Self { tokens })
    }

    /// Dense vocabulary where line/position i is the token for id i
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .enumerate()
                .map(|(i, t)| (i as u32, t.into()))
                .collect(),
        }
    }

    /// Load a `{"token": id, ...}` JSON file (the checkpoint's vocab.json)
    pub fn from_vocab_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let word_to_id: HashMap<String, u32> = serde_json::from_str(&content)?;
        Self::from_pairs(word_to_id.into_iter().map(|(w, id)| (id, w)))
    }

    /// Load the vocabulary of a HuggingFace tokenizer.json
    pub fn from_tokenizer_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| SampleError::Weights(format!("failed to load tokenizer: {}", e)))?;
        Self::from_pairs(
            tokenizer
                .get_vocab(true)
                .into_iter()
                .map(|(w, id)| (id, w)),
        )
    }

    /// Pick the loader from the file name
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_tokenizer = path
            .file_name()
            .map(|f| f.to_string_lossy().starts_with("tokenizer"))
            .unwrap_or(false);
        if is_tokenizer {
            Self::from_tokenizer_file(path)
        } else {
            Self::from_vocab_json(path)
        }
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.tokens.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
