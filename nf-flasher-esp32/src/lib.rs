//! Library to flash ESP32 family chips over their serial ROM bootloader.
//!
//! The ROM loader speaks a small SLIP framed request/response protocol. A RAM resident flasher
//! stub can optionally be uploaded first, which enables faster transfers, chip and region erase
//! and flash read back.
//!
//! - [`Connection`]: reset into the bootloader, sync and raw commands.
//! - [`Esp32`]: one flashing session on a connected chip.
//! - [`partition`]: flash size variants and the fixed partition layout.
//! - [`errata`]: board specific quirks.
//!
//! Supported chips: ESP32, ESP32-S2, ESP32-S3, ESP32-C3 and ESP32-C6.

pub mod chip;
pub mod command;
mod connection;
pub mod errata;
mod flashing;
pub(crate) mod helpers;
pub mod partition;
pub mod serial;
pub(crate) mod slip;
pub mod stub;

#[cfg(test)]
pub(crate) mod fake;

use std::{fmt, io, time::Duration};

pub use chip::{ChipFamily, DeviceInfo, Features};
pub use command::CommandType;
pub use connection::{ConnectOptions, Connection};
pub use flashing::{DEFAULT_BAUD, Esp32, SessionOptions};
pub use partition::{FlashSize, PartitionLayout};
pub use serial::SerialTransport;
pub use stub::StubImage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flashing status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Preparing,
    Connecting,
    /// The chip did not answer for a while. The user should hold BOOT and press RESET.
    BootloaderPrompt,
    Erasing,
    Flashing(f32),
    Reading(f32),
}

/// Error code in the status bytes of a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomError(pub u8);

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.0 {
            0x05 => "received message is invalid",
            0x06 => "failed to act on received message",
            0x07 => "invalid CRC in message",
            0x08 => "flash write error",
            0x09 => "flash read error",
            0x0a => "flash read length error",
            0x0b => "deflate error",
            0xc0 => "bad data length",
            0xc1 => "bad data checksum",
            0xc2 => "bad block size",
            0xc3 => "invalid command",
            0xc4 => "SPI operation failed",
            0xc5 => "SPI unlock failed",
            0xc6 => "not in flash mode",
            0xc7 => "inflate error",
            0xc8 => "not enough data",
            0xc9 => "too much data",
            _ => "unknown error",
        };

        write!(f, "{msg} ({:#04x})", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors for ESP32 flashing
#[non_exhaustive]
pub enum Error {
    /// Bootloader never answered a sync
    #[error("Timed out after {0:?} waiting for the bootloader")]
    ConnectTimeout(Duration),
    #[error("No response to {0:?}")]
    NoResponse(CommandType),
    /// Bootloader sent unexpected response
    #[error("Bootloader sent unexpected response: {0}")]
    InvalidResponse(&'static str),
    #[error("{command:?} failed: {error}")]
    Rom {
        command: CommandType,
        error: RomError,
    },
    #[error("Unknown chip magic value {0:#010x}")]
    UnknownChip(u32),
    #[error("Flash size of {0} MB is not supported")]
    UnsupportedFlashSize(u32),
    #[error(
        "Partition table {found} does not match the {expected} flash, the package needs {}",
        .expected.partition_table_name()
    )]
    PartitionTableMismatch { found: String, expected: FlashSize },
    #[error("{size:#x} bytes at {offset:#010x} run past the end of the address space")]
    RegionOutOfRange { offset: u32, size: u32 },
    #[error("{0} requires the flasher stub")]
    StubRequired(&'static str),
    #[error("Invalid stub image: {0}")]
    InvalidStub(String),
    #[error("Flash read returned {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },
    /// Failed to open serial port
    #[cfg(feature = "serial")]
    #[error("Failed to open serial port: {0}")]
    FailedToOpenPort(#[from] serialport::Error),
    /// Aborted before completing
    #[error("Aborted before completing")]
    Aborted,
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
}
