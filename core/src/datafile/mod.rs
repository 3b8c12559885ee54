//! Typed-item and blob container used by map files.
//!
//! A datafile stores small fixed-layout *items* addressed by `(type, id)` and
//! larger opaque *blobs* (raw data) addressed by index. Blobs are
//! zlib-compressed since version 4 and inflated lazily on first access.
//!
//! Types wider than 16 bits are stored indirectly: the writer assigns them an
//! internal type counting down from `0xfffe` and adds an item of type
//! [`ITEMTYPE_EX`] carrying the UUID. The reader resolves that indirection
//! back into an [`ItemType`] through the caller's [`UuidRegistry`].
//!
//! [`ItemType`]: ticktape_shared::ItemType
//! [`UuidRegistry`]: ticktape_shared::UuidRegistry

mod format;
mod reader;
mod writer;

#[cfg(test)]
mod tests;

pub use format::{
    CompressionLevel, HEADER_SIZE, Header, ITEMTYPE_EX, ItemTypeEntry, MAX_ITEM_ID, MAX_ITEM_TYPE,
    OFFSET_UUID_TYPE,
};
pub use reader::{DataFileReader, DataItem};
pub use writer::DataFileWriter;

use std::io;

use thiserror::Error;
use ticktape_shared::ItemType;

/// Errors produced while opening, reading or writing datafiles.
#[derive(Debug, Error)]
pub enum DatafileError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("wrong header magic {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported datafile version {0}")]
    UnsupportedVersion(i32),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("file truncated: wanted {wanted} bytes, got {got}")]
    Truncated { wanted: u64, got: u64 },

    #[error("file needs {size} bytes in memory, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("invalid file information: {0}")]
    Invalid(String),

    #[error("item size {0} is not a multiple of 4")]
    UnalignedItem(usize),

    #[error("blob is empty")]
    EmptyData,

    #[error("data index {0} out of range")]
    InvalidIndex(i32),

    #[error("item type {0:?} has no UUID")]
    UnresolvedType(ItemType),

    #[error("too many extension types")]
    TooManyExtendedTypes,

    #[error("file size {0} exceeds the format limit")]
    FileTooLarge(u64),
}
