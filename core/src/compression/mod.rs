//! Byte-level compression primitives.
//!
//! Demo chunks (and network packets in the host game) are compressed in two
//! stages: snapshot words are first packed as variable-length integers, then
//! the bytes are run through a static Huffman coder tuned for that output.

pub mod huffman;
pub mod varint;

pub use huffman::Huffman;

use thiserror::Error;

/// Compression or decompression failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompressionError {
    #[error("input length {0} is not a multiple of 4")]
    Unaligned(usize),

    #[error("input ended in the middle of a value")]
    Truncated,

    #[error("output exceeds {limit} bytes")]
    OutputOverflow { limit: usize },
}
