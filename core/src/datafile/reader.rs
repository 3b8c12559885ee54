//! Datafile reader
//!
//! Opening a file hashes it, validates the header and every directory entry,
//! and keeps the item region in memory. Blobs stay on disk until requested.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use sha2::{Digest, Sha256};
use ticktape_shared::{ItemType, MAP_FORMAT, Uuid, UuidRegistry, words_to_uuid};

use super::DatafileError;
use super::format::{
    HEADER_SIZE, Header, ITEM_EX_SIZE, ITEM_HEADER_SIZE, ITEMTYPE_EX, ItemTypeEntry,
    MAX_ITEM_TYPE, OFFSET_UUID_TYPE, SIZE_OFFSET, split_key,
};
use crate::config::DatafileConfig;

const HASH_CHUNK: usize = 64 * 1024;

/// Load state of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlobState {
    Unloaded,
    Loaded(Vec<u8>),
    /// Loading failed; never retried.
    Failed,
}

/// An item with its type resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataItem<'a> {
    pub item_type: ItemType,
    pub id: u16,
    /// UUID of the extension record, if the type went through one.
    pub uuid: Option<Uuid>,
    pub data: &'a [u8],
}

/// Reader for an open datafile.
pub struct DataFileReader<'r, R = BufReader<File>> {
    reader: R,
    registry: &'r UuidRegistry,
    header: Header,
    item_types: Vec<ItemTypeEntry>,
    item_offsets: Vec<i32>,
    data_offsets: Vec<i32>,
    data_sizes: Option<Vec<i32>>,
    items: Vec<u8>,
    data_start: u64,
    blobs: Vec<BlobState>,
    file_size: u64,
    sha256: [u8; 32],
    crc: u32,
}

impl<'r> DataFileReader<'r, BufReader<File>> {
    /// Open and validate a datafile on disk.
    pub fn open(
        path: impl AsRef<Path>,
        registry: &'r UuidRegistry,
        config: &DatafileConfig,
    ) -> Result<Self, DatafileError> {
        let path = path.as_ref();
        tracing::trace!(path = %path.display(), "loading datafile");
        let file = File::open(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to open datafile");
        })?;
        Self::from_reader(BufReader::new(file), registry, config)
    }
}

fn read_i32_vec(cursor: &mut Cursor<&[u8]>, count: i32) -> std::io::Result<Vec<i32>> {
    let mut values = vec![0i32; count as usize];
    cursor.read_i32_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(DatafileError::Invalid(format!($($arg)+)));
        }
    };
}

impl<'r, R: Read + Seek> DataFileReader<'r, R> {
    /// Open a datafile from a stream positioned at its first byte.
    pub fn from_reader(
        reader: R,
        registry: &'r UuidRegistry,
        config: &DatafileConfig,
    ) -> Result<Self, DatafileError> {
        Self::load(reader, registry, config).inspect_err(|e| {
            tracing::error!(error = %e, "failed to load datafile");
        })
    }

    fn load(
        mut reader: R,
        registry: &'r UuidRegistry,
        config: &DatafileConfig,
    ) -> Result<Self, DatafileError> {
        let base = reader.stream_position()?;

        // size and hashes of the whole file
        let mut sha = Sha256::new();
        let mut crc = crc32fast::Hasher::new();
        let mut file_size = 0u64;
        let mut buffer = vec![0u8; HASH_CHUNK];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            file_size += read as u64;
            sha.update(&buffer[..read]);
            crc.update(&buffer[..read]);
        }
        reader.seek(SeekFrom::Start(base))?;

        if file_size < HEADER_SIZE as u64 {
            return Err(DatafileError::Truncated {
                wanted: HEADER_SIZE as u64,
                got: file_size,
            });
        }
        let mut header = Header::read_from(&mut reader)?;
        if !MAP_FORMAT.accepts_magic(&header.magic) {
            return Err(DatafileError::BadMagic(header.magic));
        }
        if !MAP_FORMAT.accepts_version(header.version) {
            return Err(DatafileError::UnsupportedVersion(header.version));
        }
        if header.num_item_types < 0
            || header.num_item_types > MAX_ITEM_TYPE + 1
            || header.num_items < 0
            || header.num_raw_data < 0
            || header.item_size < 0
            || header.item_size % 4 != 0
            || header.data_size < 0
        {
            return Err(DatafileError::InvalidHeader(format!(
                "num_types={} num_items={} num_data={} item_size={} data_size={}",
                header.num_item_types,
                header.num_items,
                header.num_raw_data,
                header.item_size,
                header.data_size
            )));
        }

        let directory_size = header.directory_size();
        let file_size_signed = file_size as i64;
        if HEADER_SIZE as i64 + directory_size + header.data_size as i64 != file_size_signed {
            return Err(DatafileError::InvalidHeader(format!(
                "data size {} does not match file size {file_size}",
                header.data_size
            )));
        }

        // older v4 writers left the blob size table out of size and swaplen
        let size_fix = if header.has_data_sizes() {
            header.num_raw_data as i64 * 4
        } else {
            0
        };
        let header_file_size = header.size as i64 + SIZE_OFFSET;
        if header_file_size != file_size_signed {
            if size_fix != 0 && header_file_size + size_fix == file_size_signed {
                tracing::warn!(size = header.size, fix = size_fix, "fixing invalid header size");
                header.size += size_fix as i32;
            } else {
                return Err(DatafileError::InvalidHeader(format!(
                    "size {header_file_size} does not match file size {file_size}"
                )));
            }
        }
        let header_swaplen = header.swaplen as i64 + SIZE_OFFSET;
        let file_swaplen = file_size_signed - header.data_size as i64;
        if header_swaplen != file_swaplen {
            if header.swaplen % 4 == 0 && size_fix != 0 && header_swaplen + size_fix == file_swaplen
            {
                tracing::warn!(
                    swaplen = header.swaplen,
                    fix = size_fix,
                    "fixing invalid header swaplen"
                );
                header.swaplen += size_fix as i32;
            } else {
                return Err(DatafileError::InvalidHeader(format!(
                    "swaplen {header_swaplen} does not match {file_swaplen}"
                )));
            }
        }

        // directory, per-blob state and cache bookkeeping
        let alloc_size = directory_size as u64 + header.num_raw_data as u64 * 36;
        if alloc_size > config.max_alloc_size {
            return Err(DatafileError::TooLarge {
                size: alloc_size,
                max: config.max_alloc_size,
            });
        }

        let mut directory = vec![0u8; directory_size as usize];
        let mut got = 0;
        while got < directory.len() {
            let read = reader.read(&mut directory[got..])?;
            if read == 0 {
                return Err(DatafileError::Truncated {
                    wanted: directory_size as u64,
                    got: got as u64,
                });
            }
            got += read;
        }

        let mut cursor = Cursor::new(&directory[..]);
        let item_types = (0..header.num_item_types)
            .map(|_| ItemTypeEntry::read_from(&mut cursor))
            .collect::<Result<Vec<_>, _>>()?;
        let item_offsets = read_i32_vec(&mut cursor, header.num_items)?;
        let data_offsets = read_i32_vec(&mut cursor, header.num_raw_data)?;
        let data_sizes = if header.has_data_sizes() {
            Some(read_i32_vec(&mut cursor, header.num_raw_data)?)
        } else {
            None
        };
        let items_start = cursor.position() as usize;
        let items = directory[items_start..].to_vec();
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&sha.finalize());

        let datafile = Self {
            reader,
            registry,
            header,
            item_types,
            item_offsets,
            data_offsets,
            data_sizes,
            items,
            data_start: base + HEADER_SIZE as u64 + directory_size as u64,
            blobs: vec![BlobState::Unloaded; header.num_raw_data as usize],
            file_size,
            sha256,
            crc: crc.finalize(),
        };
        datafile.validate()?;
        tracing::trace!(
            items = datafile.header.num_items,
            data = datafile.header.num_raw_data,
            "datafile loaded"
        );
        Ok(datafile)
    }

    fn validate(&self) -> Result<(), DatafileError> {
        let header = &self.header;

        // item types
        let mut counted: i64 = 0;
        let mut used_types = HashSet::new();
        for (index, entry) in self.item_types.iter().enumerate() {
            check!(
                (0..=MAX_ITEM_TYPE).contains(&entry.type_id),
                "item type has invalid type. index={index} type={}",
                entry.type_id
            );
            check!(
                used_types.insert(entry.type_id),
                "item type has duplicate type. index={index} type={}",
                entry.type_id
            );
            check!(
                entry.num > 0,
                "item type has invalid number of items. index={index} num={}",
                entry.num
            );
            check!(
                entry.start as i64 == counted,
                "item type has invalid start. index={index} start={}",
                entry.start
            );
            counted += entry.num as i64;
            if counted > header.num_items as i64 {
                break;
            }
        }
        check!(
            counted == header.num_items as i64,
            "mismatched number of items in item types. counted={counted} header={}",
            header.num_items
        );

        // item offsets
        for (index, &offset) in self.item_offsets.iter().enumerate() {
            if index == 0 {
                check!(offset == 0, "first item offset is not zero. offset={offset}");
            } else {
                let previous = self.item_offsets[index - 1];
                check!(
                    offset > previous,
                    "item offset not greater than previous. index={index} offset={offset}"
                );
            }
            check!(
                offset < header.item_size,
                "item offset larger than total item size. index={index} offset={offset}"
            );
        }

        // item sizes, types and ids
        let mut total_item_size: i64 = 0;
        'types: for (type_index, entry) in self.item_types.iter().enumerate() {
            let mut used_ids = HashSet::new();
            for index in entry.start as usize..(entry.start + entry.num) as usize {
                let file_size = self.file_item_size(index);
                check!(
                    file_size >= ITEM_HEADER_SIZE,
                    "item too small for header. type_index={type_index} index={index}"
                );
                let (key, size) = self.raw_item_header(index);
                let (item_type, id) = split_key(key);
                check!(
                    item_type as i32 == entry.type_id,
                    "mismatched item type. index={index} type={item_type} expected={}",
                    entry.type_id
                );
                // old tools wrote duplicate extension records
                if item_type != ITEMTYPE_EX {
                    check!(
                        used_ids.insert(id),
                        "item has duplicate id. index={index} type={item_type} id={id}"
                    );
                }
                check!(size >= 0, "item size invalid. index={index} size={size}");
                check!(
                    size % 4 == 0,
                    "item size not integer aligned. index={index} size={size}"
                );
                check!(
                    size as usize == file_size - ITEM_HEADER_SIZE,
                    "item size does not match file. index={index} size={size}"
                );
                total_item_size += file_size as i64;
                if total_item_size > header.item_size as i64 {
                    break 'types;
                }
            }
        }
        check!(
            total_item_size == header.item_size as i64,
            "mismatched total item size. counted={total_item_size} header={}",
            header.item_size
        );

        // data offsets
        for (index, &offset) in self.data_offsets.iter().enumerate() {
            if index == 0 {
                check!(offset == 0, "first data offset is not zero. offset={offset}");
            } else {
                let previous = self.data_offsets[index - 1];
                check!(
                    offset > previous,
                    "data offset not greater than previous. index={index} offset={offset}"
                );
            }
            check!(
                offset < header.data_size,
                "data offset larger than total data size. index={index} offset={offset}"
            );
        }

        // data sizes
        for (index, &size) in self.data_sizes.iter().flatten().enumerate() {
            check!(size >= 0, "data size invalid. index={index} size={size}");
            if size == 0 {
                tracing::warn!(index, size, "zero data size, blob will fail to load");
            }
        }

        Ok(())
    }

    // ========================================================================
    // Items
    // ========================================================================

    fn file_item_size(&self, index: usize) -> usize {
        let end = match self.item_offsets.get(index + 1) {
            Some(&next) => next,
            None => self.header.item_size,
        };
        (end - self.item_offsets[index]) as usize
    }

    fn raw_item_header(&self, index: usize) -> (u32, i32) {
        let offset = self.item_offsets[index] as usize;
        let bytes = &self.items[offset..offset + ITEM_HEADER_SIZE];
        (
            LittleEndian::read_u32(&bytes[..4]),
            LittleEndian::read_i32(&bytes[4..]),
        )
    }

    fn raw_item(&self, index: usize) -> (u16, u16, &[u8]) {
        let (key, _) = self.raw_item_header(index);
        let (item_type, id) = split_key(key);
        let start = self.item_offsets[index] as usize + ITEM_HEADER_SIZE;
        let size = self.file_item_size(index) - ITEM_HEADER_SIZE;
        (item_type, id, &self.items[start..start + size])
    }

    pub fn num_items(&self) -> usize {
        self.item_offsets.len()
    }

    /// Payload size of item `index`.
    pub fn item_size(&self, index: usize) -> Option<usize> {
        (index < self.num_items()).then(|| self.file_item_size(index) - ITEM_HEADER_SIZE)
    }

    /// Item at `index`, with its type resolved.
    pub fn item(&self, index: usize) -> Option<DataItem<'_>> {
        if index >= self.num_items() {
            return None;
        }
        let (internal, id, data) = self.raw_item(index);
        let (item_type, uuid) = self.external_item_type(internal);
        Some(DataItem {
            item_type,
            id,
            uuid,
            data,
        })
    }

    pub fn items(&self) -> impl Iterator<Item = DataItem<'_>> {
        (0..self.num_items()).filter_map(|index| self.item(index))
    }

    fn internal_range(&self, internal: u16) -> Range<usize> {
        self.item_types
            .iter()
            .find(|entry| entry.type_id == internal as i32)
            .map(|entry| entry.start as usize..(entry.start + entry.num) as usize)
            .unwrap_or(0..0)
    }

    fn find_internal(&self, internal: u16, id: u16) -> Option<usize> {
        self.internal_range(internal)
            .find(|&index| split_key(self.raw_item_header(index).0).1 == id)
    }

    fn ex_record_uuid(&self, index: usize) -> Option<Uuid> {
        let (_, _, data) = self.raw_item(index);
        if data.len() < ITEM_EX_SIZE {
            return None;
        }
        let mut words = [0i32; 4];
        LittleEndian::read_i32_into(&data[..ITEM_EX_SIZE], &mut words);
        Some(words_to_uuid(&words))
    }

    /// Resolve a stored 16-bit type through the extension records.
    pub fn external_item_type(&self, internal: u16) -> (ItemType, Option<Uuid>) {
        if (internal as i32) <= OFFSET_UUID_TYPE || internal == ITEMTYPE_EX {
            return (ItemType::Builtin(internal), None);
        }
        match self
            .find_internal(ITEMTYPE_EX, internal)
            .and_then(|index| self.ex_record_uuid(index))
        {
            Some(uuid) => (ItemType::from_uuid(uuid, self.registry), Some(uuid)),
            None => (ItemType::Builtin(internal), None),
        }
    }

    /// Stored 16-bit type of a logical type, if this file contains it.
    pub fn internal_item_type(&self, item_type: ItemType) -> Option<u16> {
        let uuid = match item_type {
            ItemType::Builtin(t) => return Some(t),
            ItemType::Extension(_) | ItemType::Unknown(_) => item_type.uuid(self.registry)?,
        };
        self.internal_range(ITEMTYPE_EX)
            .find(|&index| self.ex_record_uuid(index) == Some(uuid))
            .map(|index| self.raw_item(index).1)
    }

    /// Index range of the items of `item_type`; empty if there are none.
    pub fn get_type(&self, item_type: ItemType) -> Range<usize> {
        match self.internal_item_type(item_type) {
            Some(internal) => self.internal_range(internal),
            None => 0..0,
        }
    }

    pub fn find_item_index(&self, item_type: ItemType, id: u16) -> Option<usize> {
        let internal = self.internal_item_type(item_type)?;
        self.find_internal(internal, id)
    }

    pub fn find_item(&self, item_type: ItemType, id: u16) -> Option<&[u8]> {
        let index = self.find_item_index(item_type, id)?;
        Some(self.raw_item(index).2)
    }

    // ========================================================================
    // Data
    // ========================================================================

    pub fn num_data(&self) -> usize {
        self.data_offsets.len()
    }

    fn blob_index(&self, index: i32) -> Option<usize> {
        usize::try_from(index).ok().filter(|&i| i < self.num_data())
    }

    fn file_data_size(&self, index: usize) -> usize {
        let end = match self.data_offsets.get(index + 1) {
            Some(&next) => next,
            None => self.header.data_size,
        };
        (end - self.data_offsets[index]) as usize
    }

    fn load_blob(&mut self, index: usize) -> Result<Vec<u8>, DatafileError> {
        let file_size = self.file_data_size(index);
        let offset = self.data_start + self.data_offsets[index] as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut raw = vec![0u8; file_size];
        self.reader.read_exact(&mut raw)?;

        let Some(sizes) = &self.data_sizes else {
            tracing::trace!(index, size = file_size, "loading data");
            return Ok(raw);
        };

        let expected = sizes[index] as usize;
        tracing::trace!(index, size = file_size, uncompressed = expected, "loading data");
        if expected == 0 {
            return Err(DatafileError::Invalid(format!(
                "data size invalid. index={index} size=0"
            )));
        }
        let mut out = Vec::with_capacity(expected);
        ZlibDecoder::new(&raw[..])
            .take(expected as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() != expected {
            return Err(DatafileError::Invalid(format!(
                "failed to uncompress data. index={index} wanted={expected} got={}",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Contents of blob `index`, loading it on first access.
    ///
    /// Returns `None` for out-of-range indices and for blobs that failed to
    /// load; a failed blob is never retried.
    pub fn data(&mut self, index: i32) -> Option<&[u8]> {
        let index = self.blob_index(index)?;
        if self.blobs[index] == BlobState::Unloaded {
            self.blobs[index] = match self.load_blob(index) {
                Ok(data) => BlobState::Loaded(data),
                Err(e) => {
                    tracing::error!(index, error = %e, "failed to load data");
                    BlobState::Failed
                }
            };
        }
        match &self.blobs[index] {
            BlobState::Loaded(data) => Some(data),
            _ => None,
        }
    }

    /// Uncompressed size of blob `index`, 0 if it is invalid or failed.
    pub fn data_size(&self, index: i32) -> usize {
        let Some(index) = self.blob_index(index) else {
            return 0;
        };
        match &self.blobs[index] {
            BlobState::Loaded(data) => data.len(),
            BlobState::Failed => 0,
            BlobState::Unloaded => match &self.data_sizes {
                Some(sizes) => sizes[index].max(0) as usize,
                None => self.file_data_size(index),
            },
        }
    }

    /// Blob `index` as a NUL-terminated UTF-8 string, without the terminator.
    ///
    /// Index `-1` is the conventional "no string" and yields `""`.
    pub fn data_string(&mut self, index: i32) -> Option<&str> {
        if index == -1 {
            return Some("");
        }
        if self.data_size(index) == 0 {
            return None;
        }
        let data = self.data(index)?;
        let (terminator, text) = data.split_last()?;
        if *terminator != 0 || text.contains(&0) {
            return None;
        }
        std::str::from_utf8(text).ok()
    }

    /// Blob `index` as little-endian words.
    pub fn data_words(&mut self, index: i32) -> Option<Vec<i32>> {
        let data = self.data(index)?;
        Some(data.chunks_exact(4).map(LittleEndian::read_i32).collect())
    }

    /// Substitute the contents of blob `index`.
    pub fn replace_data(&mut self, index: i32, data: Vec<u8>) -> Result<(), DatafileError> {
        let slot = self
            .blob_index(index)
            .ok_or(DatafileError::InvalidIndex(index))?;
        self.blobs[slot] = BlobState::Loaded(data);
        Ok(())
    }

    /// Drop the cached contents of blob `index`; the next access reloads it.
    pub fn unload_data(&mut self, index: i32) {
        if let Some(index) = self.blob_index(index) {
            self.blobs[index] = BlobState::Unloaded;
        }
    }

    // ========================================================================
    // File info
    // ========================================================================

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn version(&self) -> i32 {
        self.header.version
    }

    pub fn sha256(&self) -> [u8; 32] {
        self.sha256
    }

    /// CRC-32 of the whole file.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Release the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
