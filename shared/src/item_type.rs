//! Logical item types.

use uuid::Uuid;

use crate::registry::{OFFSET_UUID, Slot, UuidRegistry};

/// Type of an item after resolving the container's extension records.
///
/// Containers store 16-bit internal types. Small values are built-in types;
/// reserved ranges point at records carrying the UUID of an extension type.
/// Codecs resolve that indirection once, at the boundary, into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// A type stored directly in the 16-bit type field.
    Builtin(u16),
    /// An extension type this process registered.
    Extension(Slot),
    /// An extension type whose UUID is not registered here.
    Unknown(Uuid),
}

impl ItemType {
    /// Build from a legacy integer type id.
    ///
    /// Ids below [`OFFSET_UUID`] are built-in types, ids at or above it name
    /// registry slots. Negative ids are rejected.
    pub fn from_type_id(type_id: i32) -> Option<Self> {
        if type_id < 0 {
            return None;
        }
        if type_id < OFFSET_UUID {
            return u16::try_from(type_id).ok().map(ItemType::Builtin);
        }
        Slot::from_type_id(type_id).map(ItemType::Extension)
    }

    /// Legacy integer type id, or `None` for unknown extensions.
    pub fn type_id(self) -> Option<i32> {
        match self {
            ItemType::Builtin(t) => Some(t as i32),
            ItemType::Extension(slot) => Some(slot.type_id()),
            ItemType::Unknown(_) => None,
        }
    }

    /// UUID backing an extension type, if any.
    pub fn uuid(self, registry: &UuidRegistry) -> Option<Uuid> {
        match self {
            ItemType::Builtin(_) => None,
            ItemType::Extension(slot) => registry.uuid_of(slot),
            ItemType::Unknown(uuid) => Some(uuid),
        }
    }

    /// Classify a UUID against the registry.
    pub fn from_uuid(uuid: Uuid, registry: &UuidRegistry) -> Self {
        match registry.slot_of(&uuid) {
            Some(slot) => ItemType::Extension(slot),
            None => ItemType::Unknown(uuid),
        }
    }

    pub fn is_extension(self) -> bool {
        !matches!(self, ItemType::Builtin(_))
    }
}

impl From<u16> for ItemType {
    fn from(value: u16) -> Self {
        ItemType::Builtin(value)
    }
}

impl From<Slot> for ItemType {
    fn from(slot: Slot) -> Self {
        ItemType::Extension(slot)
    }
}
