//! Configuration (`ticktape.toml`)
//!
//! Tunables for the demo recorder/player and the datafile codec. Every field
//! has a default, so an empty file is a valid configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::datafile::CompressionLevel;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Demo recording and playback
    #[serde(default)]
    pub demo: DemoConfig,
    /// Datafile reading and writing
    #[serde(default)]
    pub datafile: DatafileConfig,
}

/// Demo recorder/player settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Game ticks per second (default: 50)
    #[serde(default = "default_tick_speed")]
    pub tick_speed: i32,
    /// Ticks between forced keyframes (default: 250, five seconds)
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: i32,
    /// Timeline markers kept per demo (default: 64, also the format limit)
    #[serde(default = "default_max_timeline_markers")]
    pub max_timeline_markers: usize,
    /// Minimum ticks between two markers (default: 50)
    #[serde(default = "default_marker_min_gap")]
    pub marker_min_gap: i32,
    /// Network version string written into demo headers
    #[serde(default = "default_net_version")]
    pub net_version: String,
    /// Demo type written into demo headers (default: "client")
    #[serde(default = "default_demo_type")]
    pub demo_type: String,
}

/// Datafile settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatafileConfig {
    /// Largest directory a reader will load, in bytes (default: 2 GiB)
    #[serde(default = "default_max_alloc_size")]
    pub max_alloc_size: u64,
    /// Compression for string and word blobs (default: "default")
    #[serde(default)]
    pub compression: CompressionLevel,
}

fn default_tick_speed() -> i32 {
    50
}
fn default_keyframe_interval() -> i32 {
    250
}
fn default_max_timeline_markers() -> usize {
    64
}
fn default_marker_min_gap() -> i32 {
    50
}
fn default_net_version() -> String {
    "0.6 626fce9a778df4d4".to_string()
}
fn default_demo_type() -> String {
    "client".to_string()
}

fn default_max_alloc_size() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tick_speed: default_tick_speed(),
            keyframe_interval: default_keyframe_interval(),
            max_timeline_markers: default_max_timeline_markers(),
            marker_min_gap: default_marker_min_gap(),
            net_version: default_net_version(),
            demo_type: default_demo_type(),
        }
    }
}

impl Default for DatafileConfig {
    fn default() -> Self {
        Self {
            max_alloc_size: default_max_alloc_size(),
            compression: CompressionLevel::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.demo.tick_speed, 50);
        assert_eq!(config.demo.keyframe_interval, 250);
        assert_eq!(config.demo.max_timeline_markers, 64);
        assert_eq!(config.demo.demo_type, "client");
        assert_eq!(config.datafile.max_alloc_size, 1 << 31);
        assert_eq!(config.datafile.compression, CompressionLevel::Default);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
[demo]
keyframe_interval = 10

[datafile]
compression = "best"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.demo.keyframe_interval, 10);
        assert_eq!(config.demo.tick_speed, 50); // default
        assert_eq!(config.datafile.compression, CompressionLevel::Best);
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let mut config = Config::default();
        config.demo.net_version = "test 1".to_string();
        config.datafile.max_alloc_size = 4096;

        let toml_str = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&toml_str).unwrap(), config);
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn test_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticktape.toml");
        std::fs::write(&path, "[demo]\ntick_speed = 25\n").unwrap();
        assert_eq!(Config::load(&path).unwrap().demo.tick_speed, 25);
    }
}
