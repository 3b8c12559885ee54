//! Demo file layout
//!
//! ```text
//! header            176 bytes, big-endian integers, NUL-padded strings
//! timeline markers  260 bytes (version > 3)
//! sha256 extension  16-byte UUID tag + 32-byte digest (version >= 6, optional)
//! map data          header.map_size bytes
//! chunks            tick markers and payload chunks until EOF
//! ```
//!
//! Chunk tag byte:
//!
//! ```text
//! tick marker   1 K C t t t t t   K = keyframe, C = compressed delta, t = tick delta
//! payload       0 k k s s s s s   k = kind, s = size (30: +1 byte, 31: +2 bytes LE)
//! ```

use std::io::{self, Read, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ticktape_shared::{DEMO_FORMAT, Uuid};

use super::DemoError;
use crate::compression::{Huffman, varint};
use crate::snapshot::MAX_SIZE;

pub const HEADER_SIZE: usize = 176;
pub const TIMELINE_SIZE: usize = 4 + MAX_TIMELINE_MARKERS * 4;
pub const MAX_TIMELINE_MARKERS: usize = 64;

/// Offset of the length field, patched when recording stops.
pub const LENGTH_OFFSET: u64 = 152;
/// Offset of the timeline marker block.
pub const NUM_MARKERS_OFFSET: u64 = HEADER_SIZE as u64;

/// Tag of the content-hash extension block.
pub const SHA256_EXTENSION: Uuid = Uuid::from_bytes([
    0x6b, 0xe6, 0xda, 0x4a, 0xce, 0xbd, 0x38, 0x0c, 0x9b, 0x5b, 0x12, 0x89, 0xc8, 0x42, 0xd7, 0x80,
]);

/// Playback speeds selectable by index.
pub const SPEEDS: [f64; 22] = [
    0.1, 0.25, 0.5, 0.75, 1.0, 1.25, 1.5, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 20.0, 24.0, 28.0,
    32.0, 40.0, 48.0, 56.0, 64.0,
];
/// Index of 1.0 in [`SPEEDS`].
pub const DEFAULT_SPEED_INDEX: usize = 4;

const NET_VERSION_LEN: usize = 64;
const MAP_NAME_LEN: usize = 64;
const TYPE_LEN: usize = 8;
const TIMESTAMP_LEN: usize = 20;

bitflags! {
    /// Tick marker bits of a chunk tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u8 {
        const TICKMARKER = 0x80;
        const KEYFRAME = 0x40;
        const TICK_COMPRESSED = 0x20;
    }
}

pub const MASK_TICK: u8 = 0x1f;
pub const MASK_TICK_LEGACY: u8 = 0x3f;
const MASK_TYPE: u8 = 0x60;
const MASK_SIZE: u8 = 0x1f;
const SIZE_ONE_BYTE: u8 = 30;
const SIZE_TWO_BYTES: u8 = 31;

/// Payload chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Snapshot = 1,
    Message = 2,
    Delta = 3,
}

impl ChunkKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(ChunkKind::Snapshot),
            2 => Some(ChunkKind::Message),
            3 => Some(ChunkKind::Delta),
            _ => None,
        }
    }
}

/// A decoded chunk tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// Start of a new tick. The tick itself is tracked by the reader.
    Tick { keyframe: bool },
    /// Payload of `size` compressed bytes. Unknown kinds are skipped.
    Data {
        kind: Option<ChunkKind>,
        size: usize,
    },
}

/// Fixed-size demo header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DemoHeader {
    pub version: u8,
    pub net_version: String,
    pub map_name: String,
    pub map_size: u32,
    pub map_crc: u32,
    pub demo_type: String,
    /// Recorded length in seconds
    pub length: i32,
    pub timestamp: String,
}

/// Who recorded a demo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoType {
    Client,
    Server,
    Invalid,
}

fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_str(field: &mut [u8], text: &str) {
    let mut len = text.len().min(field.len() - 1);
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
}

impl DemoHeader {
    /// Read and check marker and version.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, DemoError> {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DemoError::NotADemo,
            _ => DemoError::Io(e),
        })?;
        if &raw[..7] != DEMO_FORMAT.marker {
            return Err(DemoError::NotADemo);
        }
        let version = raw[7];
        if version < DEMO_FORMAT.old_version {
            return Err(DemoError::UnsupportedVersion(version));
        }

        let mut fields = &raw[136..];
        let map_size = fields.read_u32::<BigEndian>()?;
        let map_crc = fields.read_u32::<BigEndian>()?;
        let mut fields = &raw[152..156];
        let length = fields.read_i32::<BigEndian>()?;

        Ok(Self {
            version,
            net_version: read_str(&raw[8..8 + NET_VERSION_LEN]),
            map_name: read_str(&raw[72..72 + MAP_NAME_LEN]),
            map_size,
            map_crc,
            demo_type: read_str(&raw[144..144 + TYPE_LEN]),
            length,
            timestamp: read_str(&raw[156..156 + TIMESTAMP_LEN]),
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..7].copy_from_slice(DEMO_FORMAT.marker);
        raw[7] = self.version;
        write_str(&mut raw[8..8 + NET_VERSION_LEN], &self.net_version);
        write_str(&mut raw[72..72 + MAP_NAME_LEN], &self.map_name);
        raw[136..140].copy_from_slice(&self.map_size.to_be_bytes());
        raw[140..144].copy_from_slice(&self.map_crc.to_be_bytes());
        write_str(&mut raw[144..144 + TYPE_LEN], &self.demo_type);
        raw[152..156].copy_from_slice(&self.length.to_be_bytes());
        write_str(&mut raw[156..156 + TIMESTAMP_LEN], &self.timestamp);
        writer.write_all(&raw)
    }

    pub fn demo_type(&self) -> DemoType {
        match self.demo_type.as_str() {
            "client" => DemoType::Client,
            "server" => DemoType::Server,
            _ => DemoType::Invalid,
        }
    }

    /// Whether a timeline marker block follows the header.
    pub fn has_timeline(&self) -> bool {
        self.version > DEMO_FORMAT.old_version
    }
}

/// Read the timeline block, clamping the count to the format limit.
pub fn read_timeline<R: Read>(reader: &mut R) -> io::Result<Vec<i32>> {
    let mut raw = [0u8; TIMELINE_SIZE];
    reader.read_exact(&mut raw)?;
    let mut fields = &raw[..];
    let count = fields
        .read_i32::<BigEndian>()?
        .clamp(0, MAX_TIMELINE_MARKERS as i32);
    (0..count).map(|_| fields.read_i32::<BigEndian>()).collect()
}

/// Write a full timeline block.
pub fn write_timeline<W: Write>(writer: &mut W, markers: &[i32]) -> io::Result<()> {
    let markers = &markers[..markers.len().min(MAX_TIMELINE_MARKERS)];
    writer.write_i32::<BigEndian>(markers.len() as i32)?;
    for index in 0..MAX_TIMELINE_MARKERS {
        writer.write_i32::<BigEndian>(markers.get(index).copied().unwrap_or(0))?;
    }
    Ok(())
}

/// Read into `buf` until it is full or the stream ends.
pub(crate) fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(read) => got += read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(got)
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    Ok(read_up_to(reader, buf)? == buf.len())
}

fn corrupt_tick(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Apply a compressed tick delta. A negative `tick` means no full tick
/// marker has been read yet.
fn advance_tick(tick: i32, delta: u8) -> io::Result<i32> {
    if tick < 0 {
        return Err(corrupt_tick("tick delta before the first full tick"));
    }
    tick.checked_add(delta as i32)
        .ok_or_else(|| corrupt_tick("tick overflow"))
}

/// Read one chunk tag, updating `tick` for tick markers.
///
/// Start with `tick` at -1 so a stream opening with a tick delta is
/// rejected. Returns `None` at end of file, including a tag cut short by
/// it, and an `InvalidData` error for corrupt tick values.
pub fn read_chunk_header<R: Read>(
    reader: &mut R,
    version: u8,
    tick: &mut i32,
) -> io::Result<Option<ChunkHeader>> {
    let mut tag = [0u8; 1];
    if !read_exact_or_eof(reader, &mut tag)? {
        return Ok(None);
    }
    let tag = tag[0];
    let flags = ChunkFlags::from_bits_truncate(tag);

    if flags.contains(ChunkFlags::TICKMARKER) {
        let legacy_delta = tag & MASK_TICK_LEGACY;
        if version < DEMO_FORMAT.tick_compression_version && legacy_delta != 0 {
            *tick = advance_tick(*tick, legacy_delta)?;
        } else if flags.contains(ChunkFlags::TICK_COMPRESSED) {
            *tick = advance_tick(*tick, tag & MASK_TICK)?;
        } else {
            let mut raw = [0u8; 4];
            if !read_exact_or_eof(reader, &mut raw)? {
                return Ok(None);
            }
            let value = i32::from_be_bytes(raw);
            if value < 0 {
                return Err(corrupt_tick("negative tick"));
            }
            *tick = value;
        }
        return Ok(Some(ChunkHeader::Tick {
            keyframe: flags.contains(ChunkFlags::KEYFRAME),
        }));
    }

    let kind = ChunkKind::from_bits((tag & MASK_TYPE) >> 5);
    let size = match tag & MASK_SIZE {
        SIZE_ONE_BYTE => {
            let mut raw = [0u8; 1];
            if !read_exact_or_eof(reader, &mut raw)? {
                return Ok(None);
            }
            raw[0] as usize
        }
        SIZE_TWO_BYTES => {
            let mut raw = [0u8; 2];
            if !read_exact_or_eof(reader, &mut raw)? {
                return Ok(None);
            }
            u16::from_le_bytes(raw) as usize
        }
        size => size as usize,
    };
    Ok(Some(ChunkHeader::Data { kind, size }))
}

/// Write a tick marker. Small forward steps use the one-byte form.
pub fn write_tick_marker<W: Write>(
    writer: &mut W,
    tick: i32,
    last_tick: Option<i32>,
    keyframe: bool,
) -> io::Result<()> {
    let delta = last_tick.and_then(|last| tick.checked_sub(last));
    match delta {
        Some(delta) if !keyframe && (0..=MASK_TICK as i32).contains(&delta) => {
            let tag = ChunkFlags::TICKMARKER | ChunkFlags::TICK_COMPRESSED;
            writer.write_u8(tag.bits() | delta as u8)
        }
        _ => {
            let mut tag = ChunkFlags::TICKMARKER;
            tag.set(ChunkFlags::KEYFRAME, keyframe);
            writer.write_u8(tag.bits())?;
            writer.write_i32::<BigEndian>(tick)
        }
    }
}

/// Write a payload chunk: tag, size bytes, then the encoded payload.
pub fn write_chunk<W: Write>(writer: &mut W, kind: ChunkKind, payload: &[u8]) -> io::Result<()> {
    let size = payload.len();
    let tag = (kind as u8) << 5;
    if size < SIZE_ONE_BYTE as usize {
        writer.write_u8(tag | size as u8)?;
    } else if size < 256 {
        writer.write_u8(tag | SIZE_ONE_BYTE)?;
        writer.write_u8(size as u8)?;
    } else {
        writer.write_u8(tag | SIZE_TWO_BYTES)?;
        writer.write_u16::<byteorder::LittleEndian>(size as u16)?;
    }
    writer.write_all(payload)
}

/// Pad to whole words, pack them as varints and Huffman-code the result.
pub fn encode_payload(data: &[u8]) -> Result<Vec<u8>, DemoError> {
    if data.len() > MAX_SIZE {
        return Err(DemoError::ChunkTooLarge(data.len()));
    }
    let mut padded = data.to_vec();
    padded.resize(data.len().next_multiple_of(4), 0);
    let packed = varint::compress(&padded)?;
    let encoded = Huffman::shared().compress(&packed);
    if encoded.len() > u16::MAX as usize {
        return Err(DemoError::ChunkTooLarge(encoded.len()));
    }
    Ok(encoded)
}

/// Reverse [`encode_payload`]. The result keeps its word padding.
pub fn decode_payload(data: &[u8]) -> Result<Vec<u8>, crate::compression::CompressionError> {
    let packed = Huffman::shared().decompress(data, MAX_SIZE)?;
    varint::decompress(&packed, MAX_SIZE)
}
