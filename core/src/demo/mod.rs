//! Demo recording and playback
//!
//! A demo is a header, the map the match was played on, and a stream of
//! chunks: tick markers followed by the snapshot, snapshot delta and message
//! payloads of that tick. Every few seconds a tick is recorded as a full
//! snapshot (a keyframe), which the player indexes on load to seek.
//!
//! - [`DemoRecorder`] writes demos and patches length and markers on stop
//! - [`DemoPlayer`] replays them into a [`DemoListener`]
//! - [`DemoEditor`] cuts a tick range out of an existing demo

mod editor;
mod format;
mod player;
mod recorder;


pub use editor::DemoEditor;
pub use format::{
    ChunkFlags, ChunkHeader, ChunkKind, DEFAULT_SPEED_INDEX, DemoHeader, DemoType, HEADER_SIZE,
    MAX_TIMELINE_MARKERS, SHA256_EXTENSION, SPEEDS, TIMELINE_SIZE,
};
pub use player::{DemoInfo, DemoListener, DemoPlayer, PlaybackInfo, demo_info, demo_info_from};
pub use recorder::{DemoRecorder, MessageFilter, RecordingMap, StopMode};

use std::io;

use thiserror::Error;

use crate::compression::CompressionError;

/// Errors from opening, recording or inspecting demos.
#[derive(Debug, Error)]
pub enum DemoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not a demo file")]
    NotADemo,

    #[error("demo version {0} is not supported")]
    UnsupportedVersion(u8),

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("no demo loaded")]
    NotLoaded,

    #[error("corrupt chunk stream at offset {offset}")]
    CorruptChunk { offset: u64 },

    #[error("tick {0} is negative")]
    InvalidTick(i32),

    #[error("chunk of {0} bytes does not fit the chunk format")]
    ChunkTooLarge(usize),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("map name {0:?} is not a safe file name")]
    UnsafeMapName(String),

    #[error("demo contains no map data")]
    NoMapData,
}

/// Why playback stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("empty demo")]
    EmptyDemo,

    #[error("error reading chunk")]
    ReadChunk,

    #[error("error during decompression: {0}")]
    Decompress(CompressionError),

    #[error("seek failed: {0}")]
    Seek(io::ErrorKind),
}

/// Map embedded in a demo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapInfo {
    pub name: String,
    pub crc: u32,
    pub size: u32,
    /// Digest from the extension block, if the demo has one
    pub sha256: Option<[u8; 32]>,
}
