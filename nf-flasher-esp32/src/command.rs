//! Loader command packets.
//!
//! Request: `0x00 op len:u16 checksum:u32 data[len]`
//! Response: `0x01 op len:u16 value:u32 data[len]`, where `data` ends with the status bytes.

use std::time::Duration;

use crate::{Error, Result};

const DIRECTION_REQUEST: u8 = 0x00;
const DIRECTION_RESPONSE: u8 = 0x01;
const CHECKSUM_SEED: u8 = 0xef;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
    SpiSetParams = 0x0b,
    SpiAttach = 0x0d,
    ChangeBaudrate = 0x0f,
    EraseFlash = 0xd0,
    EraseRegion = 0xd1,
    ReadFlash = 0xd2,
}

impl CommandType {
    /// Time to wait for the response.
    pub const fn timeout(self) -> Duration {
        match self {
            Self::Sync => Duration::from_millis(100),
            Self::EraseFlash => Duration::from_secs(120),
            Self::EraseRegion | Self::FlashBegin => Duration::from_secs(30),
            Self::FlashData | Self::ReadFlash => Duration::from_secs(10),
            _ => Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Sync,
    ReadReg {
        address: u32,
    },
    WriteReg {
        address: u32,
        value: u32,
    },
    SpiSetParams {
        size: u32,
    },
    SpiAttach {
        stub: bool,
    },
    ChangeBaudrate {
        new: u32,
        old: u32,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        /// ROM loaders of newer chips take an extra "encrypted" word.
        encrypted_field: bool,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
    ReadFlash {
        offset: u32,
        size: u32,
        sector_size: u32,
        in_flight: u32,
    },
}

/// Checksum over the payload of data carrying commands.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |acc, x| acc ^ x)
}

fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|x| x.to_le_bytes()).collect()
}

impl Command<'_> {
    pub const fn command_type(&self) -> CommandType {
        match self {
            Self::Sync => CommandType::Sync,
            Self::ReadReg { .. } => CommandType::ReadReg,
            Self::WriteReg { .. } => CommandType::WriteReg,
            Self::SpiSetParams { .. } => CommandType::SpiSetParams,
            Self::SpiAttach { .. } => CommandType::SpiAttach,
            Self::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Self::MemBegin { .. } => CommandType::MemBegin,
            Self::MemData { .. } => CommandType::MemData,
            Self::MemEnd { .. } => CommandType::MemEnd,
            Self::FlashBegin { .. } => CommandType::FlashBegin,
            Self::FlashData { .. } => CommandType::FlashData,
            Self::FlashEnd { .. } => CommandType::FlashEnd,
            Self::EraseFlash => CommandType::EraseFlash,
            Self::EraseRegion { .. } => CommandType::EraseRegion,
            Self::ReadFlash { .. } => CommandType::ReadFlash,
        }
    }

    /// Unframed request packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut check = 0u32;

        let data = match self {
            Self::Sync => {
                let mut temp = vec![0x07, 0x07, 0x12, 0x20];
                temp.extend([0x55; 32]);
                temp
            }
            Self::ReadReg { address } => words(&[*address]),
            Self::WriteReg { address, value } => words(&[*address, *value, u32::MAX, 0]),
            Self::SpiSetParams { size } => words(&[0, *size, 64 * 1024, 4 * 1024, 256, 0xffff]),
            Self::SpiAttach { stub } => {
                if *stub {
                    words(&[0])
                } else {
                    words(&[0, 0])
                }
            }
            Self::ChangeBaudrate { new, old } => words(&[*new, *old]),
            Self::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => words(&[*size, *blocks, *block_size, *offset]),
            Self::MemData { data, sequence } | Self::FlashData { data, sequence } => {
                check = u32::from(checksum(data));
                let mut temp = words(&[data.len() as u32, *sequence, 0, 0]);
                temp.extend_from_slice(data);
                temp
            }
            Self::MemEnd { entry } => words(&[u32::from(*entry == 0), *entry]),
            Self::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                encrypted_field,
            } => {
                let mut temp = words(&[*size, *blocks, *block_size, *offset]);
                if *encrypted_field {
                    temp.extend(words(&[0]));
                }
                temp
            }
            Self::FlashEnd { reboot } => words(&[u32::from(!*reboot)]),
            Self::EraseFlash => Vec::new(),
            Self::EraseRegion { offset, size } => words(&[*offset, *size]),
            Self::ReadFlash {
                offset,
                size,
                sector_size,
                in_flight,
            } => words(&[*offset, *size, *sector_size, *in_flight]),
        };

        let mut temp = Vec::with_capacity(8 + data.len());
        temp.push(DIRECTION_REQUEST);
        temp.push(self.command_type() as u8);
        temp.extend_from_slice(&(data.len() as u16).to_le_bytes());
        temp.extend_from_slice(&check.to_le_bytes());
        temp.extend(data);

        temp
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub op: u8,
    pub value: u32,
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl Response {
    /// Parse a decoded frame. `status_len` is 4 for the ROM loader and 2 for the stub.
    pub fn parse(frame: &[u8], status_len: usize) -> Result<Self> {
        if frame.len() < 8 + status_len || frame[0] != DIRECTION_RESPONSE {
            return Err(Error::InvalidResponse("not a response packet"));
        }

        let len = usize::from(u16::from_le_bytes([frame[2], frame[3]]));
        let body = &frame[8..];
        // Some loaders report a length that excludes the status bytes
        let body = if body.len() >= len && len >= status_len {
            &body[..len]
        } else {
            body
        };
        let (data, status) = body.split_at(body.len() - status_len);

        Ok(Self {
            op: frame[1],
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: data.to_vec(),
            status: status[0],
            error: status[1],
        })
    }

    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}
