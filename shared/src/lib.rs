//! Shared types for the ticktape codecs.
//!
//! - [`UuidRegistry`] - name-derived UUIDs mapped onto sequential slots
//! - [`ItemType`] - built-in vs extension item types
//! - [`MAP_FORMAT`] / [`DEMO_FORMAT`] - on-disk format constants

pub mod formats;
pub mod ids;
pub mod item_type;
pub mod registry;

pub use formats::{DEMO_FORMAT, DatafileFormat, DemoFormat, MAP_FORMAT};
pub use ids::is_safe_map_name;
pub use item_type::ItemType;
pub use registry::{
    MAX_SLOTS, OFFSET_UUID, RegistryError, Slot, TYPE_NAMESPACE, UuidRegistry, calculate_uuid,
    uuid_to_words, words_to_uuid,
};

pub use uuid::Uuid;
