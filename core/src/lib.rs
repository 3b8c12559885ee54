//! Ticktape Core - match recording building blocks
//!
//! This crate provides the binary formats used to store maps and replay
//! matches of a tick-based multiplayer game.
//!
//! # Architecture
//!
//! - [`DataFileReader`] / [`DataFileWriter`] - versioned item/blob container for maps
//! - [`Snapshot`] / [`SnapshotDelta`] - world state per tick and its delta encoding
//! - [`SnapshotStorage`] - recent snapshots kept for delta bases
//! - [`DemoRecorder`] / [`DemoPlayer`] / [`DemoEditor`] - demo files with keyframe seeking
//! - [`compression`] - varint packing and the fixed-table Huffman coder

pub mod compression;
pub mod config;
pub mod datafile;
pub mod demo;
pub mod snapshot;

pub use config::{Config, DatafileConfig, DemoConfig};

// Re-export container types
pub use datafile::{CompressionLevel, DataFileReader, DataFileWriter, DataItem, DatafileError};

// Re-export snapshot types
pub use snapshot::{
    DeltaError, Snapshot, SnapshotBuilder, SnapshotDelta, SnapshotError, SnapshotStorage,
    StoredSnapshot,
};

// Re-export demo types
pub use demo::{
    DemoEditor, DemoError, DemoInfo, DemoListener, DemoPlayer, DemoRecorder, PlaybackError,
    PlaybackInfo, RecordingMap, StopMode,
};

pub use ticktape_shared::{ItemType, Uuid, UuidRegistry};
