//! Datafile on-disk structures.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │ Header (36 bytes)           │
//! ├─────────────────────────────┤
//! │ Item types [12 bytes each]  │  type, start, num
//! │ Item offsets [i32]          │
//! │ Data offsets [i32]          │
//! │ Data sizes [i32]            │  v4 only: uncompressed size per blob
//! ├─────────────────────────────┤
//! │ Items                       │  type << 16 | id, size, payload
//! ├─────────────────────────────┤
//! │ Data                        │  blobs, zlib-compressed in v4
//! └─────────────────────────────┘
//! ```
//!
//! Every integer is a little-endian i32.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 36;

/// Bytes of the header not counted by `size` and `swaplen`.
pub const SIZE_OFFSET: i64 = 16;

pub const ITEM_TYPE_SIZE: usize = 12;
pub const ITEM_HEADER_SIZE: usize = 8;

pub const MAX_ITEM_TYPE: i32 = 0xffff;
pub const MAX_ITEM_ID: i32 = 0xffff;

/// Internal types above this may be extension types.
pub const OFFSET_UUID_TYPE: i32 = 0x8000;

/// Type of the items holding extension UUIDs. Their id is the internal type
/// they describe.
pub const ITEMTYPE_EX: u16 = 0xffff;

/// Size of an extension record payload.
pub const ITEM_EX_SIZE: usize = 16;

/// Fixed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: i32,
    pub size: i32,
    pub swaplen: i32,
    pub num_item_types: i32,
    pub num_items: i32,
    pub num_raw_data: i32,
    pub item_size: i32,
    pub data_size: i32,
}

impl Header {
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        Ok(Self {
            magic,
            version: reader.read_i32::<LittleEndian>()?,
            size: reader.read_i32::<LittleEndian>()?,
            swaplen: reader.read_i32::<LittleEndian>()?,
            num_item_types: reader.read_i32::<LittleEndian>()?,
            num_items: reader.read_i32::<LittleEndian>()?,
            num_raw_data: reader.read_i32::<LittleEndian>()?,
            item_size: reader.read_i32::<LittleEndian>()?,
            data_size: reader.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        for field in [
            self.version,
            self.size,
            self.swaplen,
            self.num_item_types,
            self.num_items,
            self.num_raw_data,
            self.item_size,
            self.data_size,
        ] {
            writer.write_i32::<LittleEndian>(field)?;
        }
        Ok(())
    }

    /// Whether blobs are compressed and carry an uncompressed size table.
    pub fn has_data_sizes(&self) -> bool {
        self.version >= 4
    }

    /// Size of everything between the header and the data region.
    pub fn directory_size(&self) -> i64 {
        let mut size = self.num_item_types as i64 * ITEM_TYPE_SIZE as i64
            + self.num_items as i64 * 4
            + self.num_raw_data as i64 * 4;
        if self.has_data_sizes() {
            size += self.num_raw_data as i64 * 4;
        }
        size + self.item_size as i64
    }
}

/// One entry of the item type directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemTypeEntry {
    pub type_id: i32,
    pub start: i32,
    pub num: i32,
}

impl ItemTypeEntry {
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            type_id: reader.read_i32::<LittleEndian>()?,
            start: reader.read_i32::<LittleEndian>()?,
            num: reader.read_i32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self.type_id)?;
        writer.write_i32::<LittleEndian>(self.start)?;
        writer.write_i32::<LittleEndian>(self.num)
    }
}

/// zlib effort for a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    #[default]
    Default,
    Best,
}

impl From<CompressionLevel> for flate2::Compression {
    fn from(level: CompressionLevel) -> Self {
        match level {
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }
}

/// Split a packed item key.
pub fn split_key(key: u32) -> (u16, u16) {
    ((key >> 16) as u16, (key & 0xffff) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_is_36_bytes() {
        let header = Header {
            magic: *b"DATA",
            version: 4,
            size: 1,
            swaplen: 2,
            num_item_types: 3,
            num_items: 4,
            num_raw_data: 5,
            item_size: 6,
            data_size: 7,
        };
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..8], b"DATA\x04\0\0\0");

        let read = Header::read_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn test_directory_size_depends_on_version() {
        let mut header = Header {
            magic: *b"DATA",
            version: 3,
            size: 0,
            swaplen: 0,
            num_item_types: 1,
            num_items: 2,
            num_raw_data: 3,
            item_size: 40,
            data_size: 0,
        };
        assert_eq!(header.directory_size(), 12 + 8 + 12 + 40);
        header.version = 4;
        assert_eq!(header.directory_size(), 12 + 8 + 12 + 12 + 40);
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key(0xffff_0007), (0xffff, 7));
    }
}
