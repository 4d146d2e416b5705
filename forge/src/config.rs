//! Device profile for the `forged` daemon
//!
//! The daemon stands in for a real device, so the facts the bootloader
//! would learn from firmware and the partition table come from a YAML
//! profile instead.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::device::{PartitionInfo, ESP_GUID, LINUX_DATA_GUID};
use crate::session::{SessionConfig, DEFAULT_MAX_DOWNLOAD_SIZE};

/// Main device profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Reported `product` variable
    #[serde(default = "default_product")]
    pub product: String,

    /// Reported `variant` variable
    #[serde(default)]
    pub variant: Option<String>,

    /// Reported `version-bootloader` variable
    #[serde(default = "default_bootloader_version")]
    pub bootloader_version: String,

    /// Cap on `download` requests, in bytes
    #[serde(default = "default_max_download_size")]
    pub max_download_size: usize,

    /// Enable the engineering-only flash labels
    #[serde(default)]
    pub allow_debug_labels: bool,

    /// Disk geometry
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    #[serde(default = "default_disk_blocks")]
    pub disk_blocks: u64,

    /// Partition table of the simulated disk
    #[serde(default = "default_partitions")]
    pub partitions: Vec<PartitionProfile>,
}

/// One partition of the simulated disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionProfile {
    pub name: String,
    pub first_lba: u64,
    pub last_lba: u64,

    #[serde(default = "default_type_guid")]
    pub type_guid: Uuid,

    #[serde(default)]
    pub unique_guid: Option<Uuid>,

    #[serde(default)]
    pub attributes: u64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            product: default_product(),
            variant: None,
            bootloader_version: default_bootloader_version(),
            max_download_size: default_max_download_size(),
            allow_debug_labels: false,
            block_size: default_block_size(),
            disk_blocks: default_disk_blocks(),
            partitions: default_partitions(),
        }
    }
}

// Default value functions

fn default_product() -> String {
    "forge".to_string()
}

fn default_bootloader_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_download_size() -> usize {
    DEFAULT_MAX_DOWNLOAD_SIZE
}

fn default_block_size() -> u64 {
    512
}

fn default_disk_blocks() -> u64 {
    // 128 MiB
    262_144
}

fn default_type_guid() -> Uuid {
    LINUX_DATA_GUID
}

fn default_partitions() -> Vec<PartitionProfile> {
    let part = |name: &str, first, last, guid| PartitionProfile {
        name: name.to_string(),
        first_lba: first,
        last_lba: last,
        type_guid: guid,
        unique_guid: None,
        attributes: 0,
    };
    vec![
        part("esp", 34, 2_047, ESP_GUID),
        part("boot", 2_048, 34_815, LINUX_DATA_GUID),
        part("system", 34_816, 100_351, LINUX_DATA_GUID),
        part("userdata", 100_352, 262_143, LINUX_DATA_GUID),
    ]
}

impl DeviceProfile {
    /// Load a profile from file, falling back to the defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let profile: Self = serde_yaml::from_str(&content)?;
            Ok(profile)
        } else {
            Ok(Self::default())
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            product: self.product.clone(),
            variant: self.variant.clone(),
            bootloader_version: self.bootloader_version.clone(),
            max_download_size: self.max_download_size,
            allow_debug_labels: self.allow_debug_labels,
        }
    }

    pub fn partition_table(&self) -> Vec<PartitionInfo> {
        self.partitions
            .iter()
            .map(|p| PartitionInfo {
                name: p.name.clone(),
                type_guid: p.type_guid,
                unique_guid: p.unique_guid.unwrap_or_else(Uuid::nil),
                first_lba: p.first_lba,
                last_lba: p.last_lba,
                attributes: p.attributes,
            })
            .collect()
    }
}
