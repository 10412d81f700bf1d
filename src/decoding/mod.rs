//! Token decoding
//!
//! Finished samples are scored against the vocabulary, reduced to top-1 ids
//! and rendered through a fixed id -> string table.

pub mod decoder;
pub mod vocab;

pub use decoder::{DecodedSequence, LinearProjection, LogitsProjection, TokenDecoder};
pub use vocab::Vocabulary;
