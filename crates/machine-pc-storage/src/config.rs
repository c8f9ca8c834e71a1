//! Configuration for the storage subsystem.

use std::path::PathBuf;

/// Host machine flavour: the XT exposes a reduced floppy register set
/// and no PCI configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "native", derive(serde::Serialize, serde::Deserialize))]
pub enum Architecture {
    Xt,
    #[default]
    At,
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "native", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageConfig {
    /// Base directory for relative image paths.
    pub disk_path: PathBuf,
    pub architecture: Architecture,
    /// Model string overrides per ATA position (primary master/slave,
    /// secondary master/slave). `None` keeps the built-in names.
    pub ata_models: [Option<String>; 4],
}

impl StorageConfig {
    #[must_use]
    pub fn new(disk_path: PathBuf) -> Self {
        Self {
            disk_path,
            architecture: Architecture::At,
            ata_models: [None, None, None, None],
        }
    }
}

#[cfg(feature = "native")]
impl StorageConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
