//! Library to flash STM32 devices running the ST DfuSe bootloader over USB.
//!
//! The pieces are usable on their own:
//!
//! - [`DfuFile`]: parse, validate and write `.dfu` containers.
//! - [`SectorMap`]: memory layout decoded from the device string descriptors.
//! - [`DfuSession`]: the erase/program/verify/leave state machine, written against the
//!   [`DfuTransport`] trait so it can run on anything that does DFU control requests.
//! - [`usb`]: a [`DfuTransport`] on top of libusb, plus device enumeration.

pub mod file;
pub(crate) mod helpers;
pub mod image;
mod protocol;
pub(crate) mod reader;
pub mod sector_map;
pub mod transport;
#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
pub(crate) mod fake;

use std::{fmt, io, time::Duration};

pub use file::{DfuElement, DfuFile, DfuTarget, ParseError};
pub use image::Firmware;
pub use protocol::{DfuOptions, DfuSession, IdentityMismatch};
pub use sector_map::{RegionKind, SectorMap, SectorMapEntry};
pub use transport::{DfuState, DfuStatus, DfuTransport, UsbIdentity};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flashing status
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Status {
    Erasing(f32),
    Flashing(f32),
    Verifying(f32),
}

/// Raw `bStatus` reported by a DFU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u8);

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            0x00 => "OK",
            0x01 => "errTARGET",
            0x02 => "errFILE",
            0x03 => "errWRITE",
            0x04 => "errERASE",
            0x05 => "errCHECK_ERASED",
            0x06 => "errPROG",
            0x07 => "errVERIFY",
            0x08 => "errADDRESS",
            0x09 => "errNOTDONE",
            0x0a => "errFIRMWARE",
            0x0b => "errVENDOR",
            0x0c => "errUSBR",
            0x0d => "errPOR",
            0x0f => "errSTALLEDPKT",
            _ => "errUNKNOWN",
        };

        write!(f, "{name} ({:#04x})", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors for DFU flashing
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    File(#[from] ParseError),
    #[error(transparent)]
    SectorMap(#[from] sector_map::SectorMapError),
    /// Device answered a command with an error status
    #[error("Device reported {status} in state {state:?}")]
    Protocol { status: StatusCode, state: DfuState },
    #[error("Malformed response from device: {0}")]
    MalformedResponse(&'static str),
    #[error("Address {0:#010x} is not covered by the device memory layout")]
    AddressNotMapped(u32),
    #[error("Verification failed at {0:#010x}")]
    VerifyFailed(u32),
    #[error("Timed out after {0:?} waiting for the device")]
    Timeout(Duration),
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),
    #[error("USB DFU device not found")]
    DeviceNotFound,
    #[cfg(feature = "usb")]
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    /// Aborted before completing
    #[error("Aborted before completing")]
    Aborted,
    #[error("IO Error: {0}")]
    IoError(#[from] io::Error),
}
