//! Demo recorder
//!
//! *Idle -> Recording -> Idle*. Chunks are appended as ticks arrive; the only
//! backward seek is the final patch of length and timeline markers in
//! [`DemoRecorder::stop`].

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use sha2::{Digest, Sha256};
use ticktape_shared::DEMO_FORMAT;

use super::DemoError;
use super::format::{
    ChunkKind, DemoHeader, LENGTH_OFFSET, MAX_TIMELINE_MARKERS, NUM_MARKERS_OFFSET,
    SHA256_EXTENSION, encode_payload, write_chunk, write_tick_marker, write_timeline,
};
use crate::config::DemoConfig;
use crate::snapshot::{Snapshot, SnapshotDelta};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Returns `true` for messages that must not be recorded.
pub type MessageFilter = Box<dyn FnMut(&[u8]) -> bool>;

/// What [`DemoRecorder::stop`] does with the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Patch the header and keep the file
    Keep,
    /// Delete the file
    Discard,
}

/// Map embedded into a new recording.
#[derive(Debug, Clone, Copy)]
pub struct RecordingMap<'a> {
    pub name: &'a str,
    pub crc: u32,
    pub sha256: [u8; 32],
    pub data: &'a [u8],
}

impl<'a> RecordingMap<'a> {
    /// Describe `data`, computing its CRC and digest.
    pub fn new(name: &'a str, data: &'a [u8]) -> Self {
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&Sha256::digest(data));
        Self {
            name,
            crc: crc32fast::hash(data),
            sha256,
            data,
        }
    }
}

/// Writes demo files.
pub struct DemoRecorder<W: Write + Seek = BufWriter<File>> {
    writer: Option<W>,
    path: Option<PathBuf>,
    config: DemoConfig,
    delta: SnapshotDelta,
    last_tick_marker: Option<i32>,
    last_keyframe: Option<i32>,
    first_tick: Option<i32>,
    last_snapshot: Option<Snapshot>,
    markers: Vec<i32>,
    filter: Option<MessageFilter>,
    no_map_data: bool,
}

impl DemoRecorder<BufWriter<File>> {
    /// Start recording into a new file at `path`.
    pub fn start_file(
        &mut self,
        path: impl AsRef<Path>,
        map: &RecordingMap<'_>,
    ) -> Result<(), DemoError> {
        if self.is_recording() {
            return Err(DemoError::AlreadyRecording);
        }
        let path = path.as_ref();
        let file = File::create(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "unable to open demo for recording");
        })?;
        self.start(BufWriter::new(file), map)?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }
}

impl<W: Write + Seek> DemoRecorder<W> {
    pub fn new(delta: SnapshotDelta, config: DemoConfig) -> Self {
        Self {
            writer: None,
            path: None,
            config,
            delta,
            last_tick_marker: None,
            last_keyframe: None,
            first_tick: None,
            last_snapshot: None,
            markers: Vec::new(),
            filter: None,
            no_map_data: false,
        }
    }

    /// Leave the map out of future recordings; only its name and hashes are kept.
    pub fn set_no_map_data(&mut self, no_map_data: bool) {
        self.no_map_data = no_map_data;
    }

    pub fn set_filter(&mut self, filter: Option<MessageFilter>) {
        self.filter = filter;
    }

    /// Write the header, an empty timeline block, the map digest and the map.
    ///
    /// `writer` must be positioned at the start of the output.
    pub fn start(&mut self, mut writer: W, map: &RecordingMap<'_>) -> Result<(), DemoError> {
        if self.is_recording() {
            return Err(DemoError::AlreadyRecording);
        }

        let map_data = if self.no_map_data { &[][..] } else { map.data };
        let header = DemoHeader {
            version: DEMO_FORMAT.version,
            net_version: self.config.net_version.clone(),
            map_name: map.name.to_string(),
            map_size: u32::try_from(map_data.len())
                .map_err(|_| DemoError::ChunkTooLarge(map_data.len()))?,
            map_crc: map.crc,
            demo_type: self.config.demo_type.clone(),
            length: 0,
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        header.write_to(&mut writer)?;
        write_timeline(&mut writer, &[])?;
        writer.write_all(SHA256_EXTENSION.as_bytes())?;
        writer.write_all(&map.sha256)?;
        writer.write_all(map_data)?;

        self.last_tick_marker = None;
        self.last_keyframe = None;
        self.first_tick = None;
        self.last_snapshot = None;
        self.markers.clear();
        self.path = None;
        self.writer = Some(writer);

        tracing::info!(map = map.name, map_size = map_data.len(), "recording demo");
        Ok(())
    }

    /// Record the world state of `tick`, which must not be negative.
    ///
    /// The first tick, and any tick more than `keyframe_interval` ticks after
    /// the last keyframe, is stored whole. Others store the delta to the last
    /// recorded snapshot, or nothing if the world did not change.
    pub fn record_snapshot(&mut self, tick: i32, snapshot: &Snapshot) -> Result<(), DemoError> {
        if !self.is_recording() {
            return Err(DemoError::NotRecording);
        }
        if tick < 0 {
            return Err(DemoError::InvalidTick(tick));
        }

        let (keyframe, payload) = match (self.last_keyframe, &self.last_snapshot) {
            (Some(keyframe), Some(last)) if tick - keyframe <= self.config.keyframe_interval => {
                match self.delta.create_delta(last, snapshot) {
                    Some(delta) => (false, Some(encode_payload(&delta)?)),
                    None => (false, None),
                }
            }
            _ => (true, Some(encode_payload(snapshot.as_bytes())?)),
        };

        let Some(writer) = self.writer.as_mut() else {
            return Err(DemoError::NotRecording);
        };
        write_tick_marker(writer, tick, self.last_tick_marker, keyframe)?;
        self.last_tick_marker = Some(tick);
        self.first_tick.get_or_insert(tick);

        if let Some(payload) = payload {
            let kind = if keyframe {
                ChunkKind::Snapshot
            } else {
                ChunkKind::Delta
            };
            write_chunk(writer, kind, &payload)?;
            self.last_snapshot = Some(snapshot.clone());
        }
        if keyframe {
            self.last_keyframe = Some(tick);
        }
        Ok(())
    }

    /// Record a network message of the current tick, unless filtered out.
    pub fn record_message(&mut self, data: &[u8]) -> Result<(), DemoError> {
        if !self.is_recording() {
            return Err(DemoError::NotRecording);
        }
        if let Some(filter) = self.filter.as_mut()
            && filter(data)
        {
            return Ok(());
        }

        let payload = encode_payload(data)?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(DemoError::NotRecording);
        };
        write_chunk(writer, ChunkKind::Message, &payload)?;
        Ok(())
    }

    /// Mark the last recorded tick on the timeline.
    pub fn add_marker(&mut self) -> bool {
        match self.last_tick_marker {
            Some(tick) => self.add_marker_at(tick),
            None => false,
        }
    }

    /// Mark `tick` on the timeline. Markers closer than `marker_min_gap` to
    /// the previous one, or beyond the marker limit, are dropped.
    pub fn add_marker_at(&mut self, tick: i32) -> bool {
        let limit = self.config.max_timeline_markers.min(MAX_TIMELINE_MARKERS);
        if tick < 0 || self.markers.len() >= limit {
            return false;
        }
        if let Some(&last) = self.markers.last()
            && tick - last < self.config.marker_min_gap
        {
            return false;
        }
        self.markers.push(tick);
        tracing::debug!(tick, "added timeline marker");
        true
    }

    /// Finish the recording.
    ///
    /// `Keep` patches length and markers and returns the writer; `Discard`
    /// drops it and deletes the file if [`start_file`](DemoRecorder::start_file)
    /// created one.
    pub fn stop(&mut self, mode: StopMode) -> Result<Option<W>, DemoError> {
        let mut writer = self.writer.take().ok_or(DemoError::NotRecording)?;
        let path = self.path.take();

        match mode {
            StopMode::Keep => {
                self.finalize(&mut writer)?;
                tracing::info!(
                    length = self.length(),
                    markers = self.markers.len(),
                    "stopped recording"
                );
                Ok(Some(writer))
            }
            StopMode::Discard => {
                drop(writer);
                if let Some(path) = path {
                    std::fs::remove_file(&path)?;
                    tracing::info!(path = %path.display(), "discarded demo");
                }
                Ok(None)
            }
        }
    }

    fn finalize(&self, writer: &mut W) -> io::Result<()> {
        writer.seek(SeekFrom::Start(LENGTH_OFFSET))?;
        writer.write_i32::<BigEndian>(self.length())?;
        writer.seek(SeekFrom::Start(NUM_MARKERS_OFFSET))?;
        write_timeline(writer, &self.markers)?;
        writer.seek(SeekFrom::End(0))?;
        writer.flush()
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    /// Output path while recording to a file.
    pub fn current_filename(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Recorded length in whole seconds.
    pub fn length(&self) -> i32 {
        match (self.first_tick, self.last_tick_marker) {
            (Some(first), Some(last)) => (last - first) / self.config.tick_speed.max(1),
            _ => 0,
        }
    }

    pub fn markers(&self) -> &[i32] {
        &self.markers
    }

    pub fn config(&self) -> &DemoConfig {
        &self.config
    }
}
