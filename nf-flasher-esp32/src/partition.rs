//! Flash size variants and the fixed flash layout used by nanoFramework images.
//!
//! Firmware packages ship one partition table per supported flash size, named
//! `partitions_<N>mb.bin`. The size is taken from the detected flash unless overridden, and the
//! table written must be the one for that size.

use std::{fmt, path::Path};

use nf_helper::PartitionMap;
use tracing::debug;

use crate::{ChipFamily, Error, Result};

const MB: u32 = 1024 * 1024;

pub const PARTITION_TABLE_ADDRESS: u32 = 0x8000;
pub const RUNTIME_ADDRESS: u32 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlashSize {
    Mb2,
    Mb4,
    Mb8,
    Mb16,
}

impl FlashSize {
    pub fn from_mb(mb: u32) -> Result<Self> {
        match mb {
            2 => Ok(Self::Mb2),
            4 => Ok(Self::Mb4),
            8 => Ok(Self::Mb8),
            16 => Ok(Self::Mb16),
            _ => Err(Error::UnsupportedFlashSize(mb)),
        }
    }

    pub fn from_bytes(bytes: u32) -> Result<Self> {
        Self::from_mb(bytes / MB)
    }

    /// Pick the size to flash for. An explicit override wins over the detected size.
    pub fn select(detected_bytes: u32, override_mb: Option<u32>) -> Result<Self> {
        match override_mb {
            Some(mb) => {
                let size = Self::from_mb(mb)?;
                if size.bytes() != detected_bytes {
                    debug!(
                        "Using {size} instead of the detected {} MB",
                        detected_bytes / MB
                    );
                }
                Ok(size)
            }
            None => Self::from_bytes(detected_bytes),
        }
    }

    pub const fn megabytes(self) -> u32 {
        match self {
            Self::Mb2 => 2,
            Self::Mb4 => 4,
            Self::Mb8 => 8,
            Self::Mb16 => 16,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.megabytes() * MB
    }

    /// File name of the partition table for this size in a firmware package.
    pub fn partition_table_name(self) -> String {
        format!("partitions_{}mb.bin", self.megabytes())
    }
}

impl fmt::Display for FlashSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.megabytes())
    }
}

/// Size a partition table file was built for, from its `partitions_<N>mb.bin` name.
pub fn partition_table_size(name: &str) -> Option<u32> {
    let file = Path::new(name).file_name()?.to_str()?.to_ascii_lowercase();
    file.strip_prefix("partitions_")?
        .strip_suffix("mb.bin")?
        .parse()
        .ok()
}

/// Absolute flash addresses of each region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLayout {
    pub bootloader: u32,
    pub partition_table: u32,
    pub runtime: u32,
    /// Managed application (deployment) region.
    pub deployment: u32,
}

impl PartitionLayout {
    pub const fn new(family: ChipFamily, size: FlashSize) -> Self {
        let deployment = match size {
            FlashSize::Mb2 => 0x11_0000,
            FlashSize::Mb4 => 0x1b_0000,
            FlashSize::Mb8 => 0x3b_0000,
            FlashSize::Mb16 => 0x7b_0000,
        };

        Self {
            bootloader: family.bootloader_address(),
            partition_table: PARTITION_TABLE_ADDRESS,
            runtime: RUNTIME_ADDRESS,
            deployment,
        }
    }

    /// Check that the partition table in `map`, if any, was built for `size`.
    ///
    /// Tables not following the package naming are taken as is.
    pub fn check(&self, map: &PartitionMap, size: FlashSize) -> Result<()> {
        let Some(table) = map.get(self.partition_table) else {
            return Ok(());
        };

        match partition_table_size(table.name()) {
            Some(mb) if mb != size.megabytes() => Err(Error::PartitionTableMismatch {
                found: table.name().to_string(),
                expected: size,
            }),
            Some(_) => Ok(()),
            None => {
                debug!("Custom partition table {}", table.name());
                Ok(())
            }
        }
    }
}
