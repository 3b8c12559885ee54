//! On-disk format constants.
//!
//! Single source of truth for the magic bytes, versions and extensions of the
//! container and recording formats.
//!
//! # Example
//!
//! ```
//! use ticktape_shared::{DEMO_FORMAT, MAP_FORMAT};
//!
//! assert_eq!(MAP_FORMAT.magic, b"DATA");
//! assert_eq!(DEMO_FORMAT.extension, "demo");
//! ```

/// Datafile container format.
#[derive(Debug, Clone, Copy)]
pub struct DatafileFormat {
    /// File extension without dot (e.g., "map")
    pub extension: &'static str,

    /// Magic written by current writers
    pub magic: &'static [u8; 4],

    /// Byte-reversed magic produced by big-endian writers
    pub legacy_magic: &'static [u8; 4],

    /// Version emitted by the writer (compressed blobs)
    pub version: i32,

    /// Oldest readable version (uncompressed blobs)
    pub min_version: i32,
}

impl DatafileFormat {
    /// Whether `magic` is one of the two accepted signatures.
    pub fn accepts_magic(&self, magic: &[u8; 4]) -> bool {
        magic == self.magic || magic == self.legacy_magic
    }

    pub fn accepts_version(&self, version: i32) -> bool {
        (self.min_version..=self.version).contains(&version)
    }
}

/// Map files use the datafile container.
pub const MAP_FORMAT: DatafileFormat = DatafileFormat {
    extension: "map",
    magic: b"DATA",
    legacy_magic: b"ATAD",
    version: 4,
    min_version: 3,
};

/// Demo recording format.
#[derive(Debug, Clone, Copy)]
pub struct DemoFormat {
    /// File extension without dot
    pub extension: &'static str,

    /// NUL-terminated header marker
    pub marker: &'static [u8; 7],

    /// Version written by the recorder
    pub version: u8,

    /// Oldest playable version; versions above it carry timeline markers
    pub old_version: u8,

    /// First version with the content-hash extension block
    pub sha256_version: u8,

    /// First version with 5-bit compressed tick deltas
    pub tick_compression_version: u8,
}

pub const DEMO_FORMAT: DemoFormat = DemoFormat {
    extension: "demo",
    marker: b"TWDEMO\0",
    version: 6,
    old_version: 3,
    sha256_version: 6,
    tick_compression_version: 5,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_format_magic() {
        assert!(MAP_FORMAT.accepts_magic(b"DATA"));
        assert!(MAP_FORMAT.accepts_magic(b"ATAD"));
        assert!(!MAP_FORMAT.accepts_magic(b"DATB"));
    }

    #[test]
    fn test_map_format_versions() {
        assert!(!MAP_FORMAT.accepts_version(2));
        assert!(MAP_FORMAT.accepts_version(3));
        assert!(MAP_FORMAT.accepts_version(4));
        assert!(!MAP_FORMAT.accepts_version(5));
    }

    #[test]
    fn test_demo_format_marker() {
        assert_eq!(DEMO_FORMAT.marker.len(), 7);
        assert_eq!(DEMO_FORMAT.marker[6], 0);
        assert!(DEMO_FORMAT.old_version < DEMO_FORMAT.tick_compression_version);
        assert!(DEMO_FORMAT.tick_compression_version < DEMO_FORMAT.sha256_version);
    }
}
