//! Demo player
//!
//! *Idle -> Loaded -> Playing <-> Paused -> Idle*. Loading validates the
//! preamble and indexes every keyframe. Playback decodes one tick at a time
//! into a [`DemoListener`]; corrupt chunks stop playback with a
//! [`PlaybackError`] instead of failing the caller.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use ticktape_shared::{DEMO_FORMAT, is_safe_map_name};

use super::format::{
    ChunkHeader, ChunkKind, DEFAULT_SPEED_INDEX, DemoHeader, SHA256_EXTENSION, SPEEDS,
    decode_payload, read_chunk_header, read_timeline, read_up_to,
};
use super::{DemoError, MapInfo, PlaybackError};
use crate::config::DemoConfig;
use crate::snapshot::{Snapshot, SnapshotDelta};

/// Receives what playback decodes.
pub trait DemoListener {
    /// World state of `tick`. Ticks without a recorded change repeat the
    /// previous snapshot.
    fn on_snapshot(&mut self, tick: i32, snapshot: &Snapshot);

    /// A recorded message of `tick`, padded to whole words.
    fn on_message(&mut self, tick: i32, data: &[u8]);
}

/// Header, markers and map of a demo, read without loading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoInfo {
    pub header: DemoHeader,
    pub markers: Vec<i32>,
    pub map: MapInfo,
}

/// Playback position and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackInfo {
    pub first_tick: i32,
    pub last_tick: i32,
    pub current_tick: i32,
    pub previous_tick: i32,
    pub next_tick: i32,
    pub paused: bool,
    pub speed: f64,
    pub markers: Vec<i32>,
    /// Number of keyframes
    pub seekable_points: usize,
    /// Playback clock in seconds of game time
    pub current_time: f64,
    /// Position between the previous and the current tick
    pub intra_tick: f64,
    /// Seconds since the previous tick started
    pub tick_time: f64,
}

impl Default for PlaybackInfo {
    fn default() -> Self {
        Self {
            first_tick: -1,
            last_tick: -1,
            current_tick: -1,
            previous_tick: -1,
            next_tick: -1,
            paused: false,
            speed: 1.0,
            markers: Vec::new(),
            seekable_points: 0,
            current_time: 0.0,
            intra_tick: 0.0,
            tick_time: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyFrame {
    filepos: u64,
    tick: i32,
}

/// Demo header, markers, map digest and the map's file offset.
struct Preamble {
    header: DemoHeader,
    markers: Vec<i32>,
    sha256: Option<[u8; 32]>,
    map_offset: u64,
}

fn read_preamble<R: Read + Seek>(reader: &mut R) -> Result<Preamble, DemoError> {
    let header = DemoHeader::read_from(reader)?;
    let markers = if header.has_timeline() {
        read_timeline(reader)?
    } else {
        Vec::new()
    };

    let mut sha256 = None;
    if header.version >= DEMO_FORMAT.sha256_version {
        let mut tag = [0u8; 16];
        let got = read_up_to(reader, &mut tag)?;
        if got == tag.len() && tag == *SHA256_EXTENSION.as_bytes() {
            let mut digest = [0u8; 32];
            reader.read_exact(&mut digest)?;
            sha256 = Some(digest);
        } else {
            tracing::warn!(version = header.version, "demo version without sha256 extension");
            reader.seek(SeekFrom::Current(-(got as i64)))?;
        }
    }

    let map_offset = reader.stream_position()?;
    Ok(Preamble {
        header,
        markers,
        sha256,
        map_offset,
    })
}

/// Read header, markers and map information of the demo at `path`.
pub fn demo_info(path: impl AsRef<Path>) -> Result<DemoInfo, DemoError> {
    let mut reader = BufReader::new(File::open(path)?);
    demo_info_from(&mut reader)
}

/// Read header, markers and map information from a stream.
pub fn demo_info_from<R: Read + Seek>(reader: &mut R) -> Result<DemoInfo, DemoError> {
    let preamble = read_preamble(reader)?;
    Ok(DemoInfo {
        map: MapInfo {
            name: preamble.header.map_name.clone(),
            crc: preamble.header.map_crc,
            size: preamble.header.map_size,
            sha256: preamble.sha256,
        },
        header: preamble.header,
        markers: preamble.markers,
    })
}

/// Plays demo files.
pub struct DemoPlayer<L: DemoListener, R: Read + Seek = BufReader<File>> {
    listener: L,
    reader: Option<R>,
    path: Option<PathBuf>,
    config: DemoConfig,
    delta: SnapshotDelta,
    header: DemoHeader,
    map_info: MapInfo,
    map_offset: u64,
    keyframes: Vec<KeyFrame>,
    info: PlaybackInfo,
    speed_index: usize,
    last_snapshot: Option<Snapshot>,
    stop_reason: Option<PlaybackError>,
}

impl<L: DemoListener> DemoPlayer<L, BufReader<File>> {
    /// Load the demo at `path`.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), DemoError> {
        let path = path.as_ref();
        let file = File::open(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "could not open demo");
        })?;
        self.load(BufReader::new(file))?;
        self.path = Some(path.to_path_buf());
        Ok(())
    }
}

impl<L: DemoListener, R: Read + Seek> DemoPlayer<L, R> {
    pub fn new(listener: L, delta: SnapshotDelta, config: DemoConfig) -> Self {
        Self {
            listener,
            reader: None,
            path: None,
            config,
            delta,
            header: DemoHeader::default(),
            map_info: MapInfo::default(),
            map_offset: 0,
            keyframes: Vec::new(),
            info: PlaybackInfo::default(),
            speed_index: DEFAULT_SPEED_INDEX,
            last_snapshot: None,
            stop_reason: None,
        }
    }

    /// Validate the demo in `reader` and index its keyframes.
    pub fn load(&mut self, mut reader: R) -> Result<(), DemoError> {
        if self.is_playing() {
            self.stop();
        }
        self.info = PlaybackInfo::default();
        self.speed_index = DEFAULT_SPEED_INDEX;
        self.last_snapshot = None;
        self.stop_reason = None;
        self.path = None;

        let preamble = read_preamble(&mut reader).inspect_err(|e| {
            tracing::error!(error = %e, "failed to load demo");
        })?;
        self.map_info = MapInfo {
            name: preamble.header.map_name.clone(),
            crc: preamble.header.map_crc,
            size: preamble.header.map_size,
            sha256: preamble.sha256,
        };
        self.map_offset = preamble.map_offset;
        self.info.markers = preamble.markers;
        self.header = preamble.header;

        reader.seek(SeekFrom::Current(self.map_info.size as i64))?;
        self.scan(&mut reader)?;
        self.reader = Some(reader);

        tracing::info!(
            map = %self.map_info.name,
            version = self.header.version,
            first_tick = self.info.first_tick,
            last_tick = self.info.last_tick,
            keyframes = self.keyframes.len(),
            "loaded demo"
        );
        Ok(())
    }

    /// Walk all chunks once, recording the tick range and keyframe offsets.
    fn scan(&mut self, reader: &mut R) -> Result<(), DemoError> {
        let start = reader.stream_position()?;
        self.keyframes.clear();
        let mut tick = -1;

        loop {
            let position = reader.stream_position()?;
            let chunk = read_chunk_header(reader, self.header.version, &mut tick).map_err(|e| {
                if e.kind() == io::ErrorKind::InvalidData {
                    tracing::error!(offset = position, error = %e, "corrupt tick marker");
                    DemoError::CorruptChunk { offset: position }
                } else {
                    e.into()
                }
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            match chunk {
                ChunkHeader::Tick { keyframe } => {
                    if keyframe {
                        self.keyframes.push(KeyFrame {
                            filepos: position,
                            tick,
                        });
                    }
                    if self.info.first_tick == -1 {
                        self.info.first_tick = tick;
                    }
                    self.info.last_tick = tick;
                }
                ChunkHeader::Data { size, .. } => {
                    reader.seek(SeekFrom::Current(size as i64))?;
                }
            }
        }

        self.info.seekable_points = self.keyframes.len();
        reader.seek(SeekFrom::Start(start))?;
        Ok(())
    }

    /// Read the next chunk and its decoded payload.
    ///
    /// `Ok(None)` is the end of the file.
    fn next_chunk(
        &mut self,
        tick: &mut i32,
    ) -> Result<Option<(ChunkHeader, Vec<u8>)>, PlaybackError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let chunk = match read_chunk_header(reader, self.header.version, tick) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(None),
            Err(_) => return Err(PlaybackError::ReadChunk),
        };

        let data = match chunk {
            ChunkHeader::Data { size, .. } if size > 0 => {
                let mut compressed = vec![0u8; size];
                reader
                    .read_exact(&mut compressed)
                    .map_err(|_| PlaybackError::ReadChunk)?;
                decode_payload(&compressed).map_err(PlaybackError::Decompress)?
            }
            _ => Vec::new(),
        };
        Ok(Some((chunk, data)))
    }

    fn replay_last_snapshot(&mut self, got_snapshot: &mut bool) {
        if *got_snapshot {
            return;
        }
        if let Some(last) = &self.last_snapshot {
            self.listener.on_snapshot(self.info.current_tick, last);
            *got_snapshot = true;
        }
    }

    fn update_intra_times(&mut self) {
        let tick_speed = self.config.tick_speed.max(1) as f64;
        let current_start = self.info.current_tick as f64 / tick_speed;
        let previous_start = self.info.previous_tick as f64 / tick_speed;
        let since_previous = self.info.current_time - previous_start;
        self.info.intra_tick = if current_start > previous_start {
            since_previous / (current_start - previous_start)
        } else {
            0.0
        };
        self.info.tick_time = since_previous;
    }

    /// Advance one tick, delivering its snapshot and messages.
    pub fn do_tick(&mut self) {
        if !self.is_playing() {
            return;
        }
        self.info.previous_tick = self.info.current_tick;
        self.info.current_tick = self.info.next_tick;
        let mut chunk_tick = self.info.current_tick;
        self.update_intra_times();

        let mut got_snapshot = false;
        loop {
            let (chunk, data) = match self.next_chunk(&mut chunk_tick) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    tracing::debug!("end of file");
                    if self.info.previous_tick == -1 {
                        self.stop_with(PlaybackError::EmptyDemo);
                    } else {
                        self.pause();
                    }
                    break;
                }
                Err(reason) => {
                    self.stop_with(reason);
                    break;
                }
            };

            match chunk {
                ChunkHeader::Data {
                    kind: Some(ChunkKind::Delta),
                    ..
                } => {
                    let empty = Snapshot::empty();
                    let base = self.last_snapshot.as_ref().unwrap_or(&empty);
                    match self.delta.unpack_delta(base, &data) {
                        Ok(snapshot) => {
                            self.listener.on_snapshot(self.info.current_tick, &snapshot);
                            self.last_snapshot = Some(snapshot);
                            got_snapshot = true;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, code = e.code(), "error during unpacking of delta");
                        }
                    }
                }
                ChunkHeader::Data {
                    kind: Some(ChunkKind::Snapshot),
                    ..
                } => match Snapshot::from_bytes(data) {
                    Ok(snapshot) => {
                        self.listener.on_snapshot(self.info.current_tick, &snapshot);
                        self.last_snapshot = Some(snapshot);
                        got_snapshot = true;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "snapshot invalid");
                    }
                },
                ChunkHeader::Data { kind, .. } => {
                    self.replay_last_snapshot(&mut got_snapshot);
                    if kind == Some(ChunkKind::Message) {
                        self.listener.on_message(self.info.current_tick, &data);
                    }
                }
                ChunkHeader::Tick { .. } => {
                    self.replay_last_snapshot(&mut got_snapshot);
                    self.info.next_tick = chunk_tick;
                    break;
                }
            }
        }
    }

    /// Decode until both a previous and a current tick exist, then start the clock.
    pub fn play(&mut self) {
        while self.info.previous_tick == -1 && self.is_playing() {
            self.do_tick();
        }
        self.info.current_time =
            self.info.previous_tick as f64 / self.config.tick_speed.max(1) as f64;
    }

    /// Advance playback by `elapsed` wall-clock time scaled by the speed.
    ///
    /// With `real_time` unset, decodes until playback pauses or stops.
    pub fn update(&mut self, elapsed: Duration, real_time: bool) {
        if !self.is_playing() {
            return;
        }
        let tick_speed = self.config.tick_speed.max(1) as f64;

        if !self.info.paused {
            self.info.current_time += elapsed.as_secs_f64() * self.info.speed;
            while !self.info.paused && self.is_playing() {
                let current_start = self.info.current_tick as f64 / tick_speed;
                if real_time && current_start > self.info.current_time {
                    break;
                }
                self.do_tick();
            }
        }

        self.update_intra_times();
        if self.info.current_tick == self.info.previous_tick
            || self.info.current_tick == self.info.next_tick
        {
            tracing::debug!(
                prev = self.info.previous_tick,
                cur = self.info.current_tick,
                next = self.info.next_tick,
                "tick error"
            );
        }
    }

    pub fn pause(&mut self) {
        self.info.paused = true;
    }

    pub fn unpause(&mut self) {
        self.info.paused = false;
    }

    /// Close the demo.
    pub fn stop(&mut self) {
        if self.reader.take().is_some() {
            tracing::info!("stopped playback");
        }
        self.keyframes.clear();
        self.path = None;
    }

    fn stop_with(&mut self, reason: PlaybackError) {
        tracing::warn!(reason = %reason, tick = self.info.current_tick, "playback stopped");
        self.stop_reason = Some(reason);
        self.stop();
    }

    /// Jump to `wanted_tick`, clamped to the recorded range.
    ///
    /// Decoding restarts at the last keyframe at least five ticks earlier, so
    /// that a previous tick exists when the wanted one is reached.
    pub fn set_pos(&mut self, wanted_tick: i32) -> bool {
        if !self.is_playing() || self.keyframes.is_empty() {
            return false;
        }

        let (first, last) = (self.info.first_tick, self.info.last_tick);
        let wanted_tick = wanted_tick.max(first).min(last);
        let keyframe_tick = wanted_tick.saturating_sub(5);
        let range = i64::from(last) - i64::from(first);
        let percent = if range > 0 {
            (i64::from(keyframe_tick) - i64::from(first)) as f32 / range as f32
        } else {
            0.0
        };

        let last_index = self.keyframes.len() - 1;
        let guess = (self.keyframes.len() as f32 * percent) as i64;
        let mut index = guess.clamp(0, last_index as i64) as usize;
        while index < last_index && self.keyframes[index].tick < keyframe_tick {
            index += 1;
        }
        while index > 0 && self.keyframes[index].tick > keyframe_tick {
            index -= 1;
        }

        let filepos = self.keyframes[index].filepos;
        if let Some(reader) = self.reader.as_mut()
            && let Err(e) = reader.seek(SeekFrom::Start(filepos))
        {
            self.stop_with(PlaybackError::Seek(e.kind()));
            return false;
        }

        self.info.next_tick = -1;
        self.info.current_tick = -1;
        self.info.previous_tick = -1;

        while self.info.next_tick < wanted_tick && self.is_playing() {
            let before = self.info.next_tick;
            self.do_tick();
            // end of file reached without getting there
            if self.info.next_tick == before {
                break;
            }
        }

        self.play();
        true
    }

    /// Seek to a fraction of the recorded range.
    pub fn seek_percent(&mut self, percent: f32) -> bool {
        let first = i64::from(self.info.first_tick);
        let range = (i64::from(self.info.last_tick) - first) as f32;
        let target = first + (range * percent) as i64;
        self.set_pos(target.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
    }

    /// Seek relative to the current tick by game seconds.
    pub fn seek_time(&mut self, seconds: f32) -> bool {
        let ticks = (seconds * self.config.tick_speed as f32) as i32;
        self.set_pos(self.info.current_tick.saturating_add(ticks))
    }

    /// Seek relative to the current tick.
    pub fn seek_tick(&mut self, offset: i32) -> bool {
        self.set_pos(self.info.current_tick.saturating_add(offset))
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.info.speed = speed.clamp(0.0, 256.0);
    }

    /// Select a speed from [`SPEEDS`].
    pub fn set_speed_index(&mut self, index: usize) {
        self.speed_index = index.min(SPEEDS.len() - 1);
        self.set_speed(SPEEDS[self.speed_index]);
    }

    pub fn adjust_speed_index(&mut self, offset: i32) {
        let index = (self.speed_index as i64 + offset as i64).clamp(0, SPEEDS.len() as i64 - 1);
        self.set_speed_index(index as usize);
    }

    pub fn speed_index(&self) -> usize {
        self.speed_index
    }

    /// Raw map bytes embedded in the demo, or `None` if it has none.
    pub fn map_data(&mut self) -> Result<Option<Vec<u8>>, DemoError> {
        let reader = self.reader.as_mut().ok_or(DemoError::NotLoaded)?;
        if self.map_info.size == 0 {
            return Ok(None);
        }

        let position = reader.stream_position()?;
        reader.seek(SeekFrom::Start(self.map_offset))?;
        let mut data = vec![0u8; self.map_info.size as usize];
        let result = reader.read_exact(&mut data);
        reader.seek(SeekFrom::Start(position))?;
        result?;
        Ok(Some(data))
    }

    /// Write the embedded map to `<dir>/<name>_<sha256>.map`.
    pub fn extract_map(&mut self, dir: impl AsRef<Path>) -> Result<PathBuf, DemoError> {
        let data = self.map_data()?.ok_or(DemoError::NoMapData)?;
        if !is_safe_map_name(&self.map_info.name) {
            return Err(DemoError::UnsafeMapName(self.map_info.name.clone()));
        }

        let sha256 = match self.map_info.sha256 {
            Some(sha256) => sha256,
            None => {
                let mut sha256 = [0u8; 32];
                sha256.copy_from_slice(&Sha256::digest(&data));
                self.map_info.sha256 = Some(sha256);
                sha256
            }
        };

        let path = dir
            .as_ref()
            .join(format!("{}_{}.map", self.map_info.name, hex::encode(sha256)));
        std::fs::write(&path, &data)?;
        tracing::info!(path = %path.display(), "extracted map");
        Ok(path)
    }

    /// File name of the loaded demo without directory and extension.
    pub fn demo_name(&self) -> Option<&str> {
        self.path.as_deref()?.file_stem()?.to_str()
    }

    pub fn is_playing(&self) -> bool {
        self.reader.is_some()
    }

    pub fn info(&self) -> &PlaybackInfo {
        &self.info
    }

    pub fn header(&self) -> &DemoHeader {
        &self.header
    }

    pub fn map_info(&self) -> &MapInfo {
        &self.map_info
    }

    /// Why playback stopped, if it stopped on an error or an empty demo.
    pub fn stop_reason(&self) -> Option<&PlaybackError> {
        self.stop_reason.as_ref()
    }

    pub fn delta(&self) -> &SnapshotDelta {
        &self.delta
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }
}
