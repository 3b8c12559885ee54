//! UUID-backed type registry.
//!
//! Item types in snapshots and datafiles are at most 16 bits wide on the wire.
//! Types outside the built-in range are identified by a UUID derived from a
//! symbolic name, so independently built programs agree on the identity of a
//! type without coordinating numbers. Each process maps the UUIDs it knows
//! onto sequential [`Slot`]s.
//!
//! # Example
//!
//! ```
//! use ticktape_shared::{UuidRegistry, calculate_uuid};
//!
//! let mut registry = UuidRegistry::new();
//! let slot = registry.register("what-is@ddnet.tw").unwrap();
//!
//! assert_eq!(registry.slot_of(&calculate_uuid("what-is@ddnet.tw")), Some(slot));
//! assert_eq!(registry.slot_of(&calculate_uuid("never-registered")), None);
//! ```

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Namespace every type name is hashed into.
pub const TYPE_NAMESPACE: Uuid = Uuid::from_bytes([
    0xe0, 0x5d, 0xda, 0xaa, 0xc4, 0xe6, 0x4c, 0xfb, 0xb6, 0x42, 0x5d, 0x48, 0xe8, 0x0c, 0x00, 0x29,
]);

/// Type id of the first registered slot.
pub const OFFSET_UUID: i32 = 1 << 16;

/// Maximum number of names a registry can hold.
pub const MAX_SLOTS: usize = u16::MAX as usize + 1;

/// Derive the UUID of a symbolic type name.
///
/// MD5 over namespace and name, with the version nibble forced to 3 and the
/// RFC 4122 variant bits set.
pub fn calculate_uuid(name: &str) -> Uuid {
    Uuid::new_v3(&TYPE_NAMESPACE, name.as_bytes())
}

/// Sequential position of a registered UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(u16);

impl Slot {
    /// Zero-based registration index.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Logical type id of this slot (`OFFSET_UUID + index`).
    pub fn type_id(self) -> i32 {
        OFFSET_UUID + self.0 as i32
    }

    /// Slot addressed by a logical type id, if the id is in the slot range.
    pub fn from_type_id(type_id: i32) -> Option<Self> {
        let index = type_id.checked_sub(OFFSET_UUID)?;
        u16::try_from(index).ok().map(Slot)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_id())
    }
}

/// Registration misuse. These indicate a startup misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("type name '{name}' maps to already registered UUID {uuid}")]
    DuplicateUuid { name: String, uuid: Uuid },

    #[error("type id {got} registered out of order, expected {expected}")]
    OutOfOrder { expected: i32, got: i32 },

    #[error("registry is full ({MAX_SLOTS} slots)")]
    Full,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    uuid: Uuid,
}

/// Bidirectional slot ↔ UUID table.
///
/// Built once at startup and passed by reference to the codecs that resolve
/// extension types.
#[derive(Debug, Clone, Default)]
pub struct UuidRegistry {
    entries: Vec<Entry>,
}

impl UuidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry by registering `names` in order.
    pub fn with_names<'a, I>(names: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(name)?;
        }
        Ok(registry)
    }

    /// Register `name` in the next free slot.
    pub fn register(&mut self, name: &str) -> Result<Slot, RegistryError> {
        let type_id = self.next_type_id()?;
        self.register_at(type_id, name)
    }

    /// Register `name` under an explicit type id.
    ///
    /// Type ids must be handed out in strictly increasing order starting at
    /// [`OFFSET_UUID`], so `type_id` has to equal the next free slot's id.
    pub fn register_at(&mut self, type_id: i32, name: &str) -> Result<Slot, RegistryError> {
        let expected = self.next_type_id()?;
        if type_id != expected {
            return Err(RegistryError::OutOfOrder {
                expected,
                got: type_id,
            });
        }

        let uuid = calculate_uuid(name);
        if self.slot_of(&uuid).is_some() {
            return Err(RegistryError::DuplicateUuid {
                name: name.to_string(),
                uuid,
            });
        }

        let slot = Slot(self.entries.len() as u16);
        self.entries.push(Entry {
            name: name.to_string(),
            uuid,
        });
        Ok(slot)
    }

    fn next_type_id(&self) -> Result<i32, RegistryError> {
        if self.entries.len() >= MAX_SLOTS {
            return Err(RegistryError::Full);
        }
        Ok(OFFSET_UUID + self.entries.len() as i32)
    }

    pub fn uuid_of(&self, slot: Slot) -> Option<Uuid> {
        self.entries.get(slot.index()).map(|e| e.uuid)
    }

    pub fn name_of(&self, slot: Slot) -> Option<&str> {
        self.entries.get(slot.index()).map(|e| e.name.as_str())
    }

    /// Slot of a UUID, or `None` when the UUID belongs to an extension this
    /// process does not know about.
    pub fn slot_of(&self, uuid: &Uuid) -> Option<Slot> {
        self.entries
            .iter()
            .position(|e| e.uuid == *uuid)
            .map(|index| Slot(index as u16))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(slot, name, uuid)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &str, Uuid)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| (Slot(index as u16), e.name.as_str(), e.uuid))
    }
}

/// Pack a UUID into four words, each read big-endian from the UUID bytes.
///
/// This is how extension type records store their UUID in item payloads.
pub fn uuid_to_words(uuid: &Uuid) -> [i32; 4] {
    let bytes = uuid.as_bytes();
    std::array::from_fn(|i| {
        i32::from_be_bytes([
            bytes[i * 4],
            bytes[i * 4 + 1],
            bytes[i * 4 + 2],
            bytes[i * 4 + 3],
        ])
    })
}

/// Inverse of [`uuid_to_words`].
pub fn words_to_uuid(words: &[i32; 4]) -> Uuid {
    let mut bytes = [0u8; 16];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_uuid_known_names() {
        assert_eq!(
            calculate_uuid("what-is@ddnet.tw").to_string(),
            "245e5097-9fe0-39d6-bf7d-9a29e1691e4c"
        );
        assert_eq!(
            calculate_uuid("test@example").to_string(),
            "f7fb5bed-d785-307b-9922-f7855bbc3fb0"
        );
    }

    #[test]
    fn test_calculate_uuid_version_and_variant() {
        let uuid = calculate_uuid("anything@example");
        assert_eq!(uuid.get_version_num(), 3);
        assert_eq!(uuid.as_bytes()[8] & 0xc0, 0x80);
    }

    #[test]
    fn test_register_is_monotonic() {
        let names: Vec<String> = (0..40).map(|i| format!("type-{i}@example")).collect();
        let registry = UuidRegistry::with_names(names.iter().map(String::as_str)).unwrap();

        assert_eq!(registry.len(), 40);
        for (index, (slot, name, uuid)) in registry.iter().enumerate() {
            assert_eq!(slot.index(), index);
            assert_eq!(slot.type_id(), OFFSET_UUID + index as i32);
            assert_eq!(name, names[index]);
            assert_eq!(registry.slot_of(&uuid), Some(slot));
            assert_eq!(registry.uuid_of(slot), Some(uuid));
        }

        let mut uuids: Vec<Uuid> = registry.iter().map(|(_, _, u)| u).collect();
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), 40);
    }

    #[test]
    fn test_register_duplicate_name_fails() {
        let mut registry = UuidRegistry::new();
        registry.register("a@example").unwrap();
        let err = registry.register("a@example").unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateUuid { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_out_of_order_fails() {
        let mut registry = UuidRegistry::new();
        registry.register_at(OFFSET_UUID, "a@example").unwrap();
        let err = registry.register_at(OFFSET_UUID + 2, "b@example").unwrap_err();
        assert_eq!(
            err,
            RegistryError::OutOfOrder {
                expected: OFFSET_UUID + 1,
                got: OFFSET_UUID + 2
            }
        );
    }

    #[test]
    fn test_unknown_uuid_is_not_an_error() {
        let registry = UuidRegistry::with_names(["a@example"]).unwrap();
        assert_eq!(registry.slot_of(&calculate_uuid("b@example")), None);
        assert_eq!(registry.name_of(Slot::from_type_id(OFFSET_UUID + 5).unwrap()), None);
    }

    #[test]
    fn test_slot_type_id_range() {
        assert_eq!(Slot::from_type_id(OFFSET_UUID - 1), None);
        assert_eq!(Slot::from_type_id(OFFSET_UUID).map(Slot::index), Some(0));
        assert_eq!(Slot::from_type_id(OFFSET_UUID + 0x1_0000), None);
    }

    #[test]
    fn test_uuid_words_are_big_endian() {
        let uuid = calculate_uuid("what-is@ddnet.tw");
        let words = uuid_to_words(&uuid);
        assert_eq!(words[0], 0x245e5097u32 as i32);
        assert_eq!(words_to_uuid(&words), uuid);
    }
}
