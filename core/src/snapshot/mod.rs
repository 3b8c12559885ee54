//! World snapshots
//!
//! A snapshot is the flat binary image of every object visible at one tick:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ data_size: i32                           │
//! │ num_items: i32                           │
//! ├──────────────────────────────────────────┤
//! │ offsets: [i32; num_items]                │  relative to the item area
//! ├──────────────────────────────────────────┤
//! │ items: { key: i32, payload: [i32; n] }*  │  key = type << 16 | id
//! └──────────────────────────────────────────┘
//! ```
//!
//! All words are little-endian. Item types at or above [`OFFSET_UUID_TYPE`]
//! refer to a type-0 item whose payload holds the UUID of an extension type.

mod builder;
mod delta;
mod storage;

#[cfg(test)]
mod tests;

pub use builder::{MAX_EXTENDED_ITEM_TYPES, SnapshotBuilder};
pub use delta::{DeltaError, EMPTY_DELTA, MAX_NETOBJSIZES, SnapshotDelta, debug_dump_delta};
pub use storage::{SnapshotStorage, StoredSnapshot};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use ticktape_shared::{ItemType, UuidRegistry, uuid_to_words, words_to_uuid};

/// First internal type that refers to an extension type record.
pub const OFFSET_UUID_TYPE: i32 = 0x4000;
pub const MAX_TYPE: i32 = 0x7fff;
pub const MAX_ID: i32 = 0xffff;
pub const MAX_ITEMS: usize = 1024;
pub const MAX_PARTS: usize = 64;
/// Upper bound of the item area, and of any serialized snapshot payload.
pub const MAX_SIZE: usize = MAX_PARTS * 1024;

pub(crate) const HEADER_SIZE: usize = 8;
pub(crate) const ITEM_HEADER_SIZE: usize = 4;
const UUID_SIZE: usize = 16;

/// Compose an item key.
pub fn item_key(type_id: i32, id: i32) -> i32 {
    (type_id << 16) | (id & 0xffff)
}

/// Errors produced while building or validating snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("malformed snapshot ({len} bytes)")]
    Invalid { len: usize },

    #[error("snapshot full: {items} items, {size} bytes")]
    Full { items: usize, size: usize },

    #[error("item size {0} is not a multiple of 4")]
    UnalignedSize(usize),

    #[error("built-in item type {0} is outside 0..{OFFSET_UUID_TYPE}")]
    InvalidType(u16),

    #[error("more than {MAX_EXTENDED_ITEM_TYPES} extension types in one snapshot")]
    TooManyExtendedTypes,

    #[error("extension type {0:?} cannot be resolved to a UUID")]
    UnresolvedType(ItemType),
}

/// One item of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotItem<'a> {
    pub key: i32,
    pub data: &'a [u8],
}

impl<'a> SnapshotItem<'a> {
    /// Internal type (the high half of the key).
    pub fn type_id(&self) -> i32 {
        self.key >> 16
    }

    pub fn id(&self) -> i32 {
        self.key & 0xffff
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn words(&self) -> impl Iterator<Item = i32> + 'a + use<'a> {
        self.data.chunks_exact(4).map(LittleEndian::read_i32)
    }
}

/// A validated snapshot.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot {
    data: Vec<u8>,
}

impl Snapshot {
    /// Snapshot without items.
    pub fn empty() -> Self {
        Self {
            data: vec![0; HEADER_SIZE],
        }
    }

    /// Validate and wrap externally sourced bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, SnapshotError> {
        if !Self::is_valid(&data) {
            return Err(SnapshotError::Invalid { len: data.len() });
        }
        Ok(Self { data })
    }

    /// Wrap bytes produced by [`SnapshotBuilder`].
    pub(crate) fn from_trusted(data: Vec<u8>) -> Self {
        debug_assert!(Self::is_valid(&data));
        Self { data }
    }

    /// Check the structure of a serialized snapshot.
    ///
    /// Offsets are range- and alignment-checked before any item size is
    /// derived from them.
    pub fn is_valid(data: &[u8]) -> bool {
        if data.len() < HEADER_SIZE {
            return false;
        }
        let data_size = LittleEndian::read_i32(&data[0..4]);
        let num_items = LittleEndian::read_i32(&data[4..8]);
        if data_size < 0 || num_items < 0 {
            return false;
        }
        let (data_size, num_items) = (data_size as usize, num_items as usize);
        if num_items > MAX_ITEMS || data_size > MAX_SIZE || data_size % 4 != 0 {
            return false;
        }
        if data.len() != HEADER_SIZE + num_items * 4 + data_size {
            return false;
        }

        let offsets: Vec<i32> = data[HEADER_SIZE..HEADER_SIZE + num_items * 4]
            .chunks_exact(4)
            .map(LittleEndian::read_i32)
            .collect();
        if offsets
            .iter()
            .any(|&offset| offset < 0 || offset % 4 != 0 || offset as usize > data_size)
        {
            return false;
        }

        offsets.iter().enumerate().all(|(index, &offset)| {
            let end = offsets.get(index + 1).copied().unwrap_or(data_size as i32);
            end - offset - ITEM_HEADER_SIZE as i32 >= 0
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_items() == 0
    }

    /// Size of the item area.
    pub fn data_size(&self) -> usize {
        LittleEndian::read_i32(&self.data[0..4]) as usize
    }

    pub fn num_items(&self) -> usize {
        LittleEndian::read_i32(&self.data[4..8]) as usize
    }

    fn items_start(&self) -> usize {
        HEADER_SIZE + self.num_items() * 4
    }

    fn offset(&self, index: usize) -> usize {
        let pos = HEADER_SIZE + index * 4;
        LittleEndian::read_i32(&self.data[pos..pos + 4]) as usize
    }

    /// Payload size of item `index`.
    pub fn item_size(&self, index: usize) -> usize {
        let end = if index + 1 == self.num_items() {
            self.data_size()
        } else {
            self.offset(index + 1)
        };
        end - self.offset(index) - ITEM_HEADER_SIZE
    }

    /// Item at `index`. Panics if `index >= num_items()`.
    pub fn item(&self, index: usize) -> SnapshotItem<'_> {
        let start = self.items_start() + self.offset(index);
        let key = LittleEndian::read_i32(&self.data[start..start + ITEM_HEADER_SIZE]);
        let payload = start + ITEM_HEADER_SIZE;
        SnapshotItem {
            key,
            data: &self.data[payload..payload + self.item_size(index)],
        }
    }

    pub fn items(&self) -> impl Iterator<Item = SnapshotItem<'_>> {
        (0..self.num_items()).map(|index| self.item(index))
    }

    /// Index of the item with `key`, by linear scan.
    pub fn item_index(&self, key: i32) -> Option<usize> {
        (0..self.num_items()).find(|&index| self.item(index).key == key)
    }

    /// Mark an item as removed without changing the layout.
    pub fn invalidate_item(&mut self, index: usize) {
        let start = self.items_start() + self.offset(index);
        LittleEndian::write_i32(&mut self.data[start..start + ITEM_HEADER_SIZE], -1);
    }

    /// Resolve an internal type through the snapshot's extension records.
    ///
    /// Returns `None` for negative (invalidated) types.
    pub fn external_item_type(&self, internal: i32, registry: &UuidRegistry) -> Option<ItemType> {
        if internal < 0 {
            return None;
        }
        if internal < OFFSET_UUID_TYPE {
            return Some(ItemType::Builtin(internal as u16));
        }

        let record = self
            .item_index(item_key(0, internal))
            .map(|index| self.item(index))
            .filter(|item| item.size() >= UUID_SIZE);
        match record {
            Some(item) => {
                let mut words = [0i32; 4];
                for (slot, word) in words.iter_mut().zip(item.words()) {
                    *slot = word;
                }
                Some(ItemType::from_uuid(words_to_uuid(&words), registry))
            }
            None => Some(ItemType::Builtin(internal as u16)),
        }
    }

    /// Resolved type of item `index`.
    pub fn item_type(&self, index: usize, registry: &UuidRegistry) -> Option<ItemType> {
        self.external_item_type(self.item(index).type_id(), registry)
    }

    /// Payload of the item with logical type `item_type` and `id`.
    pub fn find_item(
        &self,
        item_type: ItemType,
        id: u16,
        registry: &UuidRegistry,
    ) -> Option<&[u8]> {
        let internal = match item_type {
            ItemType::Builtin(t) => t as i32,
            ItemType::Extension(_) | ItemType::Unknown(_) => {
                let uuid = item_type.uuid(registry)?;
                let mut expected = [0u8; UUID_SIZE];
                for (chunk, word) in expected.chunks_exact_mut(4).zip(uuid_to_words(&uuid)) {
                    LittleEndian::write_i32(chunk, word);
                }
                self.items()
                    .find(|item| {
                        item.type_id() == 0
                            && item.id() >= OFFSET_UUID_TYPE
                            && item.data.get(..UUID_SIZE) == Some(&expected[..])
                    })?
                    .id()
            }
        };

        let index = self.item_index(item_key(internal, id as i32))?;
        let start = self.items_start() + self.offset(index) + ITEM_HEADER_SIZE;
        Some(&self.data[start..start + self.item_size(index)])
    }

    /// Wrapping sum of every payload word.
    pub fn crc(&self) -> u32 {
        self.items()
            .flat_map(|item| item.words())
            .fold(0u32, |crc, word| crc.wrapping_add(word as u32))
    }

    /// Log every item and payload word at debug level.
    pub fn debug_dump(&self) {
        log::debug!(
            "snapshot data_size={} num_items={}",
            self.data_size(),
            self.num_items()
        );
        for item in self.items() {
            log::debug!("\ttype={} id={}", item.type_id(), item.id());
            for (index, word) in item.words().enumerate() {
                log::debug!("\t\t{index:3} {word:12}\t{word:08x}");
            }
        }
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("num_items", &self.num_items())
            .field("data_size", &self.data_size())
            .field("crc", &self.crc())
            .finish()
    }
}
