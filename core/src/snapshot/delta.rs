//! Snapshot deltas.
//!
//! A delta is a word stream:
//!
//! ```text
//! num_deleted: i32, num_updated: i32, num_temp: i32 (always 0)
//! deleted keys: [i32; num_deleted]
//! updates: { type, id, [size in words], payload... } * num_updated
//! ```
//!
//! The size word is omitted for types with a registered static size.
//! Payloads of items that existed before carry the word-wise wrapping
//! difference against the old payload; new items carry the payload itself.

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashSet;
use smallvec::SmallVec;
use thiserror::Error;

use super::{MAX_ID, MAX_TYPE, Snapshot, SnapshotBuilder, SnapshotError, item_key};
use crate::compression::varint;

/// Types whose payload size can be registered.
pub const MAX_NETOBJSIZES: usize = 64;

/// A delta that changes nothing.
pub const EMPTY_DELTA: [u8; 12] = [0; 12];

const HEADER_WORDS: usize = 3;
const HASHLIST_SIZE: usize = 256;
const HASHLIST_BUCKET_SIZE: usize = 64;

/// Failure to apply a delta.
///
/// Each variant maps onto the negative status code used on the wire
/// protocol side, see [`DeltaError::code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,

    #[error("delta update is missing its size word")]
    MissingSize,

    #[error("delta field out of range")]
    OutOfRange,

    #[error("rebuilt snapshot does not fit: {0}")]
    BuilderFull(SnapshotError),
}

impl DeltaError {
    pub fn code(&self) -> i32 {
        match self {
            DeltaError::Truncated => -1,
            DeltaError::MissingSize => -2,
            DeltaError::OutOfRange => -3,
            DeltaError::BuilderFull(_) => -4,
        }
    }
}

impl From<SnapshotError> for DeltaError {
    fn from(e: SnapshotError) -> Self {
        DeltaError::BuilderFull(e)
    }
}

/// One parsed update record of a delta.
#[derive(Clone, Copy)]
struct Update<'a> {
    key: i32,
    item_type: i32,
    size: usize,
    payload: &'a [i32],
}

/// Key → index lookup over one snapshot.
struct HashIndex {
    buckets: Vec<SmallVec<[(i32, u16); 4]>>,
}

fn hash_key(key: i32) -> usize {
    let mut hash: u32 = 5381;
    for byte in key.to_le_bytes() {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(byte as u32);
    }
    hash as usize % HASHLIST_SIZE
}

impl HashIndex {
    fn new(snapshot: &Snapshot) -> Self {
        let mut buckets = vec![SmallVec::new(); HASHLIST_SIZE];
        for (index, item) in snapshot.items().enumerate() {
            let bucket: &mut SmallVec<[(i32, u16); 4]> = &mut buckets[hash_key(item.key)];
            // overflowing buckets drop keys, which only costs a full copy
            if bucket.len() < HASHLIST_BUCKET_SIZE {
                bucket.push((item.key, index as u16));
            }
        }
        Self { buckets }
    }

    fn get(&self, key: i32) -> Option<usize> {
        self.buckets[hash_key(key)]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|&(_, index)| index as usize)
    }
}

/// Delta encoder and decoder with per-type statistics.
#[derive(Debug, Clone)]
pub struct SnapshotDelta {
    item_sizes: [u32; MAX_NETOBJSIZES],
    data_rate: Vec<u64>,
    data_updates: Vec<u64>,
}

impl Default for SnapshotDelta {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self {
            item_sizes: [0; MAX_NETOBJSIZES],
            data_rate: vec![0; MAX_TYPE as usize + 1],
            data_updates: vec![0; MAX_TYPE as usize + 1],
        }
    }

    /// Register the payload size in bytes of a type, so deltas omit it.
    ///
    /// Types outside `0..MAX_NETOBJSIZES` are ignored.
    pub fn set_static_size(&mut self, item_type: i32, size: u32) {
        if let Some(slot) = usize::try_from(item_type)
            .ok()
            .and_then(|t| self.item_sizes.get_mut(t))
        {
            *slot = size;
        }
    }

    fn static_size(&self, item_type: i32) -> Option<usize> {
        let size = *self.item_sizes.get(usize::try_from(item_type).ok()?)?;
        (size != 0).then_some(size as usize)
    }

    pub fn empty_delta(&self) -> &'static [u8] {
        &EMPTY_DELTA
    }

    /// Bits received for `item_type` by [`SnapshotDelta::unpack_delta`].
    pub fn data_rate(&self, item_type: i32) -> u64 {
        usize::try_from(item_type)
            .ok()
            .and_then(|t| self.data_rate.get(t).copied())
            .unwrap_or(0)
    }

    /// Updates received for `item_type`.
    pub fn data_updates(&self, item_type: i32) -> u64 {
        usize::try_from(item_type)
            .ok()
            .and_then(|t| self.data_updates.get(t).copied())
            .unwrap_or(0)
    }

    /// Encode the changes from `from` to `to`, or `None` if there are none.
    pub fn create_delta(&self, from: &Snapshot, to: &Snapshot) -> Option<Vec<u8>> {
        let mut words: Vec<i32> = vec![0; HEADER_WORDS];
        let mut num_deleted = 0;
        let mut num_updated = 0;

        // a resized item is deleted and sent again whole
        let mut deleted = HashSet::new();
        let to_index = HashIndex::new(to);
        for item in from.items() {
            let kept = to_index
                .get(item.key)
                .is_some_and(|index| to.item_size(index) == item.size());
            if !kept {
                words.push(item.key);
                deleted.insert(item.key);
                num_deleted += 1;
            }
        }

        let from_index = HashIndex::new(from);
        let past: Vec<Option<usize>> = to
            .items()
            .map(|item| {
                from_index
                    .get(item.key)
                    .filter(|_| !deleted.contains(&item.key))
            })
            .collect();

        for (item, past) in to.items().zip(past) {
            let include_size = self.static_size(item.type_id()).is_none();
            let header = [item.type_id(), item.id(), (item.size() / 4) as i32];
            let header = if include_size { &header[..] } else { &header[..2] };

            match past.map(|index| from.item(index)) {
                Some(old) if old.size() == item.size() => {
                    let diff: SmallVec<[i32; 32]> = item
                        .words()
                        .zip(old.words())
                        .map(|(new, old)| new.wrapping_sub(old))
                        .collect();
                    if diff.iter().any(|&word| word != 0) {
                        words.extend_from_slice(header);
                        words.extend_from_slice(&diff);
                        num_updated += 1;
                    }
                }
                _ => {
                    words.extend_from_slice(header);
                    words.extend(item.words());
                    num_updated += 1;
                }
            }
        }

        if num_deleted == 0 && num_updated == 0 {
            return None;
        }
        words[0] = num_deleted;
        words[1] = num_updated;

        let mut out = vec![0u8; words.len() * 4];
        LittleEndian::write_i32_into(&words, &mut out);
        Some(out)
    }

    /// Rebuild the snapshot that `delta` describes relative to `from`.
    pub fn unpack_delta(&mut self, from: &Snapshot, delta: &[u8]) -> Result<Snapshot, DeltaError> {
        let mut words = vec![0i32; delta.len() / 4];
        LittleEndian::read_i32_into(&delta[..words.len() * 4], &mut words);
        if words.len() < HEADER_WORDS {
            return Err(DeltaError::Truncated);
        }
        let (num_deleted, num_updated) = (words[0], words[1]);
        if num_deleted < 0 {
            return Err(DeltaError::Truncated);
        }
        let mut pos = HEADER_WORDS + num_deleted as usize;
        let deleted = words
            .get(HEADER_WORDS..pos)
            .ok_or(DeltaError::Truncated)?;

        let mut updates = Vec::new();
        for _ in 0..num_updated.max(0) {
            if pos + 2 > words.len() {
                return Err(DeltaError::Truncated);
            }
            let (item_type, id) = (words[pos], words[pos + 1]);
            pos += 2;
            if !(0..=MAX_TYPE).contains(&item_type) || !(0..=MAX_ID).contains(&id) {
                return Err(DeltaError::OutOfRange);
            }

            let size = match self.static_size(item_type) {
                Some(size) => size,
                None => {
                    let &size_words = words.get(pos).ok_or(DeltaError::MissingSize)?;
                    if size_words < 0 || size_words > i32::MAX / 4 {
                        return Err(DeltaError::OutOfRange);
                    }
                    pos += 1;
                    size_words as usize * 4
                }
            };
            let end = pos + size / 4;
            let payload = words.get(pos..end).ok_or(DeltaError::OutOfRange)?;
            updates.push(Update {
                key: item_key(item_type, id),
                item_type,
                size,
                payload,
            });
            pos = end;
        }

        // deleted items that come back keep their old position
        let mut builder = SnapshotBuilder::default();
        for item in from.items() {
            if !deleted.contains(&item.key) {
                builder
                    .new_item_with_key(item.key, item.size())?
                    .copy_from_slice(item.data);
            } else if let Some(update) = updates.iter().find(|update| update.key == item.key) {
                builder.new_item_with_key(item.key, update.size)?;
            }
        }

        for update in &updates {
            let Update {
                key,
                item_type,
                size,
                payload,
            } = *update;
            let past = from
                .item_index(key)
                .filter(|_| !deleted.contains(&key))
                .map(|index| from.item(index));
            if past.is_some_and(|old| old.size() != size) {
                return Err(DeltaError::OutOfRange);
            }
            let target = match builder.item_data_mut(key).map(|data| data.len()) {
                Some(len) if len != size => return Err(DeltaError::OutOfRange),
                Some(_) => builder
                    .item_data_mut(key)
                    .ok_or(DeltaError::OutOfRange)?,
                None => builder.new_item_with_key(key, size)?,
            };

            let rate = &mut self.data_rate[item_type as usize];
            match past {
                Some(old) => {
                    for ((out, diff), old) in target
                        .chunks_exact_mut(4)
                        .zip(payload)
                        .zip(old.words())
                    {
                        LittleEndian::write_i32(out, old.wrapping_add(*diff));
                        *rate += if *diff == 0 {
                            1
                        } else {
                            varint::packed_len(*diff) as u64 * 8
                        };
                    }
                }
                None => {
                    LittleEndian::write_i32_into(payload, target);
                    *rate += size as u64 * 8;
                }
            }
            self.data_updates[item_type as usize] += 1;
        }

        Ok(builder.finish())
    }
}

/// Log the records of a delta at debug level.
pub fn debug_dump_delta(delta: &[u8]) {
    let words: Vec<i32> = delta.chunks_exact(4).map(LittleEndian::read_i32).collect();
    if words.len() < HEADER_WORDS {
        log::debug!("delta truncated ({} bytes)", delta.len());
        return;
    }
    log::debug!(
        "delta num_deleted={} num_updated={} num_temp={}",
        words[0],
        words[1],
        words[2]
    );
    for (index, word) in words[HEADER_WORDS..].iter().enumerate() {
        log::debug!("\t{index:3} {word:12}\t{word:08x}");
    }
}
