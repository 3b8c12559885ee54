//! Incremental snapshot construction.

use byteorder::{ByteOrder, LittleEndian};
use smallvec::SmallVec;
use ticktape_shared::{ItemType, Uuid, UuidRegistry, uuid_to_words};

use super::{
    HEADER_SIZE, ITEM_HEADER_SIZE, MAX_ITEMS, MAX_SIZE, MAX_TYPE, OFFSET_UUID_TYPE, Snapshot,
    SnapshotError, UUID_SIZE, item_key,
};

/// Extension types one snapshot can carry.
pub const MAX_EXTENDED_ITEM_TYPES: usize = 64;

/// Appends items and produces a [`Snapshot`].
///
/// Extension types are mapped onto internal types counting down from
/// [`MAX_TYPE`]. The first item of each extension type also adds a type-0
/// record carrying its UUID, and [`SnapshotBuilder::reset`] keeps those
/// records so the mapping stays stable across ticks.
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder<'r> {
    registry: Option<&'r UuidRegistry>,
    data: Vec<u8>,
    offsets: Vec<i32>,
    extended_types: SmallVec<[Uuid; 8]>,
}

impl<'r> SnapshotBuilder<'r> {
    /// Builder that resolves [`ItemType::Extension`] through `registry`.
    pub fn new(registry: &'r UuidRegistry) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Drop all items, keeping the extension type records.
    pub fn reset(&mut self) {
        self.data.clear();
        self.offsets.clear();
        let types = std::mem::take(&mut self.extended_types);
        for (index, uuid) in types.iter().enumerate() {
            // cannot fail: at most 64 records of 20 bytes each
            if let Err(e) = self.add_type_record(index, uuid) {
                log::warn!("failed to restore extension type record: {e}");
            }
        }
        self.extended_types = types;
    }

    pub fn num_items(&self) -> usize {
        self.offsets.len()
    }

    /// Current size of the item area.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    fn item_size(&self, index: usize) -> usize {
        let end = match self.offsets.get(index + 1) {
            Some(&next) => next as usize,
            None => self.data.len(),
        };
        end - self.offsets[index] as usize - ITEM_HEADER_SIZE
    }

    fn key_at(&self, index: usize) -> i32 {
        let offset = self.offsets[index] as usize;
        LittleEndian::read_i32(&self.data[offset..offset + ITEM_HEADER_SIZE])
    }

    /// Index of the item with `key`.
    pub fn item_index(&self, key: i32) -> Option<usize> {
        (0..self.offsets.len()).find(|&index| self.key_at(index) == key)
    }

    /// Mutable payload of the item with `key`.
    pub fn item_data_mut(&mut self, key: i32) -> Option<&mut [u8]> {
        let index = self.item_index(key)?;
        let start = self.offsets[index] as usize + ITEM_HEADER_SIZE;
        let size = self.item_size(index);
        Some(&mut self.data[start..start + size])
    }

    /// Append a zero-filled item of `size` bytes with a raw internal key.
    pub fn new_item_with_key(&mut self, key: i32, size: usize) -> Result<&mut [u8], SnapshotError> {
        if size % 4 != 0 {
            return Err(SnapshotError::UnalignedSize(size));
        }
        if self.data.len() + ITEM_HEADER_SIZE + size >= MAX_SIZE
            || self.offsets.len() + 1 >= MAX_ITEMS
        {
            return Err(SnapshotError::Full {
                items: self.offsets.len(),
                size: self.data.len(),
            });
        }

        let offset = self.data.len();
        self.offsets.push(offset as i32);
        self.data.extend_from_slice(&key.to_le_bytes());
        self.data.resize(offset + ITEM_HEADER_SIZE + size, 0);
        Ok(&mut self.data[offset + ITEM_HEADER_SIZE..])
    }

    /// Append a zero-filled item of `size` bytes.
    pub fn new_item(
        &mut self,
        item_type: ItemType,
        id: u16,
        size: usize,
    ) -> Result<&mut [u8], SnapshotError> {
        let internal = match item_type {
            ItemType::Builtin(t) if (t as i32) < OFFSET_UUID_TYPE => t as i32,
            ItemType::Builtin(t) => return Err(SnapshotError::InvalidType(t)),
            ItemType::Extension(_) | ItemType::Unknown(_) => {
                let uuid = match item_type {
                    ItemType::Unknown(uuid) => Some(uuid),
                    _ => self.registry.and_then(|registry| item_type.uuid(registry)),
                }
                .ok_or(SnapshotError::UnresolvedType(item_type))?;
                MAX_TYPE - self.extended_type_index(uuid)? as i32
            }
        };
        self.new_item_with_key(item_key(internal, id as i32), size)
    }

    fn extended_type_index(&mut self, uuid: Uuid) -> Result<usize, SnapshotError> {
        if let Some(index) = self.extended_types.iter().position(|u| *u == uuid) {
            return Ok(index);
        }
        let index = self.extended_types.len();
        if index >= MAX_EXTENDED_ITEM_TYPES {
            return Err(SnapshotError::TooManyExtendedTypes);
        }
        self.add_type_record(index, &uuid)?;
        self.extended_types.push(uuid);
        Ok(index)
    }

    fn add_type_record(&mut self, index: usize, uuid: &Uuid) -> Result<(), SnapshotError> {
        let record = self.new_item_with_key(item_key(0, MAX_TYPE - index as i32), UUID_SIZE)?;
        for (chunk, word) in record.chunks_exact_mut(4).zip(uuid_to_words(uuid)) {
            LittleEndian::write_i32(chunk, word);
        }
        Ok(())
    }

    /// Serialize the items added so far.
    pub fn finish(&self) -> Snapshot {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.offsets.len() * 4 + self.data.len());
        out.extend_from_slice(&(self.data.len() as i32).to_le_bytes());
        out.extend_from_slice(&(self.offsets.len() as i32).to_le_bytes());
        for offset in &self.offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
        Snapshot::from_trusted(out)
    }
}
