//! Loading firmware into programmable segments.

use nf_helper::{PartitionImage, PartitionMap};

use crate::{DfuFile, Error, Result};

/// Something the DFU driver can program.
#[derive(Debug, Clone)]
pub enum Firmware {
    /// A DfuSe container. Each target goes to its own alternate setting.
    Dfu(DfuFile),
    /// Plain images, all written through alternate setting 0.
    Raw(PartitionMap),
}

/// Segments of one alternate setting.
pub type AltSegments<'a> = (u8, Vec<(u32, &'a [u8])>);

impl Firmware {
    /// Segments grouped by alternate setting, each group in programming order.
    pub fn targets(&self) -> Vec<AltSegments<'_>> {
        match self {
            Self::Dfu(file) => file
                .targets
                .iter()
                .map(|t| {
                    let segments = t
                        .elements
                        .iter()
                        .map(|e| (e.address, e.data.as_slice()))
                        .collect();
                    (t.alt_setting, segments)
                })
                .collect(),
            Self::Raw(map) => {
                let segments = map
                    .ascending()
                    .into_iter()
                    .map(|(address, img)| (address, img.data()))
                    .collect();
                vec![(0, segments)]
            }
        }
    }

    pub fn total_size(&self) -> usize {
        match self {
            Self::Dfu(file) => file.total_size(),
            Self::Raw(map) => map.total_size() as usize,
        }
    }
}

/// Intel HEX to one partition per contiguous segment.
pub fn from_hex(name: &str, data: &[u8]) -> Result<PartitionMap> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Error::InvalidImage(format!("{name} is not a text file")))?;
    let bin: bin_file::BinFile = text
        .parse()
        .map_err(|_| Error::InvalidImage(format!("{name} is not a valid HEX file")))?;

    bin.segments_list()
        .into_iter()
        .map(|(address, data)| {
            let address = u32::try_from(address)
                .map_err(|_| Error::InvalidImage(format!("{name}: address out of range")))?;
            Ok((address, PartitionImage::new(name, data)))
        })
        .collect()
}
