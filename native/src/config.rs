use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ipc::protocol::CompressionType;

const DEFAULT_COMPRESSION_QUALITY: i32 = 80;
const DEFAULT_RAW_DATA_DIR: &str = "raw_data";
const DEFAULT_AUTHORITY: &str = "probe-link.files";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The service process to bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub package: String,
    pub service: String,
}

impl Default for ServiceTarget {
    fn default() -> Self {
        Self {
            package: "me.clarius.app".to_string(),
            service: "me.clarius.mobileapi.MobileApiService".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory under which transfer locations are created.
    pub root: PathBuf,
    /// Authority used to build external references handed to the peer.
    pub authority: String,
    pub raw_data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("probe-link"),
            authority: DEFAULT_AUTHORITY.to_string(),
            raw_data_dir: DEFAULT_RAW_DATA_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub service: ServiceTarget,
    /// Identity access grants are issued to. Falls back to `service.package`.
    pub peer_identity: Option<String>,
    pub storage: StorageConfig,
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn peer_identity(&self) -> &str {
        self.peer_identity
            .as_deref()
            .unwrap_or(&self.service.package)
    }
}

/// Rendering parameters forwarded verbatim inside configure-image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub compression_type: CompressionType,
    #[serde(default = "default_quality")]
    pub compression_quality: i32,
    #[serde(default)]
    pub separate_overlays: bool,
}

fn default_quality() -> i32 {
    DEFAULT_COMPRESSION_QUALITY
}

impl ImageConfig {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            compression_type: CompressionType::default(),
            compression_quality: DEFAULT_COMPRESSION_QUALITY,
            separate_overlays: false,
        }
    }

    pub fn compression_type(mut self, compression_type: CompressionType) -> Self {
        self.compression_type = compression_type;
        self
    }

    pub fn compression_quality(mut self, quality: i32) -> Self {
        self.compression_quality = quality;
        self
    }

    pub fn separate_overlays(mut self, separate: bool) -> Self {
        self.separate_overlays = separate;
        self
    }
}
