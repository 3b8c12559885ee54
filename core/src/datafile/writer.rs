//! Datafile writer
//!
//! Items and blobs are collected in memory; compression and layout happen in
//! [`DataFileWriter::finish`], which can be moved to another thread as a whole.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use hashbrown::HashMap;
use ticktape_shared::{ItemType, MAP_FORMAT, Uuid, UuidRegistry, uuid_to_words};

use super::DatafileError;
use super::format::{
    CompressionLevel, HEADER_SIZE, Header, ITEM_HEADER_SIZE, ITEM_TYPE_SIZE, ITEMTYPE_EX,
    ItemTypeEntry, OFFSET_UUID_TYPE, SIZE_OFFSET,
};
use crate::config::DatafileConfig;

#[derive(Debug)]
struct PendingItem {
    id: u16,
    data: Vec<u8>,
    next: Option<usize>,
}

/// Items of one type, linked in insertion order.
#[derive(Debug, Clone, Copy)]
struct TypeChain {
    num: usize,
    first: usize,
    last: usize,
}

#[derive(Debug)]
struct PendingData {
    data: Vec<u8>,
    level: CompressionLevel,
}

/// Writer producing version 4 datafiles.
pub struct DataFileWriter<'r, W: Write = BufWriter<File>> {
    writer: W,
    registry: &'r UuidRegistry,
    compression: CompressionLevel,
    items: Vec<PendingItem>,
    item_types: BTreeMap<u16, TypeChain>,
    datas: Vec<PendingData>,
    extended_types: HashMap<Uuid, usize>,
}

impl<'r> DataFileWriter<'r, BufWriter<File>> {
    /// Create (or truncate) the file at `path`.
    pub fn create(
        path: impl AsRef<Path>,
        registry: &'r UuidRegistry,
    ) -> Result<Self, DatafileError> {
        let file = File::create(path.as_ref())?;
        Ok(Self::new(BufWriter::new(file), registry))
    }
}

impl<'r, W: Write> DataFileWriter<'r, W> {
    pub fn new(writer: W, registry: &'r UuidRegistry) -> Self {
        Self {
            writer,
            registry,
            compression: CompressionLevel::Default,
            items: Vec::new(),
            item_types: BTreeMap::new(),
            datas: Vec::new(),
            extended_types: HashMap::new(),
        }
    }

    /// Writer whose string and word blobs use the configured compression.
    pub fn with_config(writer: W, registry: &'r UuidRegistry, config: &DatafileConfig) -> Self {
        let mut datafile = Self::new(writer, registry);
        datafile.compression = config.compression;
        datafile
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn num_data(&self) -> usize {
        self.datas.len()
    }

    fn extended_type(&mut self, uuid: Uuid) -> Result<u16, DatafileError> {
        let index = match self.extended_types.get(&uuid) {
            Some(&index) => index,
            None => {
                let index = self.extended_types.len();
                // internal types must stay above OFFSET_UUID_TYPE to resolve on read
                if index as i32 >= ITEMTYPE_EX as i32 - OFFSET_UUID_TYPE - 1 {
                    return Err(DatafileError::TooManyExtendedTypes);
                }
                self.extended_types.insert(uuid, index);

                let mut record = Vec::with_capacity(16);
                for word in uuid_to_words(&uuid) {
                    record.write_i32::<LittleEndian>(word)?;
                }
                self.push_item(ITEMTYPE_EX, ITEMTYPE_EX - index as u16 - 1, record);
                index
            }
        };
        Ok(ITEMTYPE_EX - index as u16 - 1)
    }

    fn push_item(&mut self, internal: u16, id: u16, data: Vec<u8>) -> usize {
        let index = self.items.len();
        self.items.push(PendingItem {
            id,
            data,
            next: None,
        });

        match self.item_types.get_mut(&internal) {
            Some(chain) => {
                let last = chain.last;
                chain.last = index;
                chain.num += 1;
                self.items[last].next = Some(index);
            }
            None => {
                self.item_types.insert(
                    internal,
                    TypeChain {
                        num: 1,
                        first: index,
                        last: index,
                    },
                );
            }
        }
        index
    }

    /// Add an item. Payloads must be a whole number of words.
    pub fn add_item(
        &mut self,
        item_type: ItemType,
        id: u16,
        data: &[u8],
    ) -> Result<usize, DatafileError> {
        if data.len() % 4 != 0 {
            return Err(DatafileError::UnalignedItem(data.len()));
        }
        if data.len() > i32::MAX as usize {
            return Err(DatafileError::FileTooLarge(data.len() as u64));
        }

        let internal = match item_type {
            ItemType::Builtin(t) => t,
            ItemType::Unknown(uuid) => self.extended_type(uuid)?,
            ItemType::Extension(_) => {
                let uuid = item_type
                    .uuid(self.registry)
                    .ok_or(DatafileError::UnresolvedType(item_type))?;
                self.extended_type(uuid)?
            }
        };
        Ok(self.push_item(internal, id, data.to_vec()))
    }

    /// Add an item of the extension type identified by `uuid`, registered or not.
    pub fn add_item_uuid(
        &mut self,
        uuid: Uuid,
        id: u16,
        data: &[u8],
    ) -> Result<usize, DatafileError> {
        self.add_item(ItemType::Unknown(uuid), id, data)
    }

    /// Add a blob, returning its index.
    pub fn add_data(&mut self, data: &[u8], level: CompressionLevel) -> Result<i32, DatafileError> {
        if data.is_empty() {
            return Err(DatafileError::EmptyData);
        }
        if data.len() > i32::MAX as usize {
            return Err(DatafileError::FileTooLarge(data.len() as u64));
        }
        self.datas.push(PendingData {
            data: data.to_vec(),
            level,
        });
        Ok(self.datas.len() as i32 - 1)
    }

    /// Add a NUL-terminated string blob. Empty strings are not stored.
    pub fn add_data_string(&mut self, text: &str) -> Result<Option<i32>, DatafileError> {
        if text.is_empty() {
            return Ok(None);
        }
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(0);
        self.add_data(&data, self.compression).map(Some)
    }

    /// Add a blob of little-endian words.
    pub fn add_data_words(&mut self, words: &[i32]) -> Result<i32, DatafileError> {
        let mut data = Vec::with_capacity(words.len() * 4);
        for &word in words {
            data.write_i32::<LittleEndian>(word)?;
        }
        self.add_data(&data, self.compression)
    }

    /// Items grouped by internal type, in type order.
    fn chains(&self) -> impl Iterator<Item = (u16, impl Iterator<Item = &PendingItem>)> {
        let items = &self.items;
        self.item_types.iter().map(move |(&internal, chain)| {
            let chain = std::iter::successors(Some(chain.first), move |&index| items[index].next)
                .map(move |index| &items[index]);
            (internal, chain)
        })
    }

    /// Compress the blobs and write the file.
    pub fn finish(mut self) -> Result<W, DatafileError> {
        let mut compressed = Vec::with_capacity(self.datas.len());
        for pending in &self.datas {
            let mut encoder = ZlibEncoder::new(Vec::new(), pending.level.into());
            encoder.write_all(&pending.data)?;
            compressed.push(encoder.finish()?);
        }

        let item_size: u64 = self
            .items
            .iter()
            .map(|item| (ITEM_HEADER_SIZE + item.data.len()) as u64)
            .sum();
        let data_size: u64 = compressed.iter().map(|data| data.len() as u64).sum();
        let types_size = (self.item_types.len() * ITEM_TYPE_SIZE) as u64;
        let offsets_size = ((self.items.len() + self.datas.len() * 2) * 4) as u64;
        let swap_size = HEADER_SIZE as u64 + types_size + offsets_size + item_size;
        let file_size = swap_size + data_size;
        if file_size > i32::MAX as u64 {
            return Err(DatafileError::FileTooLarge(file_size));
        }

        let header = Header {
            magic: *MAP_FORMAT.magic,
            version: MAP_FORMAT.version,
            size: (file_size as i64 - SIZE_OFFSET) as i32,
            swaplen: (swap_size as i64 - SIZE_OFFSET) as i32,
            num_item_types: self.item_types.len() as i32,
            num_items: self.items.len() as i32,
            num_raw_data: self.datas.len() as i32,
            item_size: item_size as i32,
            data_size: data_size as i32,
        };

        let mut out = Vec::with_capacity(swap_size as usize);
        header.write_to(&mut out)?;

        let mut start = 0;
        for (&internal, chain) in &self.item_types {
            ItemTypeEntry {
                type_id: internal as i32,
                start,
                num: chain.num as i32,
            }
            .write_to(&mut out)?;
            start += chain.num as i32;
        }

        let mut offset = 0i32;
        for (_, items) in self.chains() {
            for item in items {
                out.write_i32::<LittleEndian>(offset)?;
                offset += (ITEM_HEADER_SIZE + item.data.len()) as i32;
            }
        }

        let mut offset = 0i32;
        for data in &compressed {
            out.write_i32::<LittleEndian>(offset)?;
            offset += data.len() as i32;
        }
        for pending in &self.datas {
            out.write_i32::<LittleEndian>(pending.data.len() as i32)?;
        }

        for (internal, items) in self.chains() {
            for item in items {
                out.write_u32::<LittleEndian>((internal as u32) << 16 | item.id as u32)?;
                out.write_i32::<LittleEndian>(item.data.len() as i32)?;
                out.extend_from_slice(&item.data);
            }
        }

        self.writer.write_all(&out)?;
        for data in &compressed {
            self.writer.write_all(data)?;
        }
        self.writer.flush()?;

        tracing::debug!(
            items = header.num_items,
            data = header.num_raw_data,
            size = file_size,
            "datafile written"
        );
        Ok(self.writer)
    }
}
