//! Control request level interface to a DFU device.

use std::time::Duration;

use crate::{Error, Result};

/// DFU class requests.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Detach = 0,
    Download = 1,
    Upload = 2,
    GetStatus = 3,
    ClearStatus = 4,
    Abort = 6,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnbusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
}

impl TryFrom<u8> for DfuState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let state = match value {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DfuDnloadSync,
            4 => Self::DfuDnbusy,
            5 => Self::DfuDnloadIdle,
            6 => Self::DfuManifestSync,
            7 => Self::DfuManifest,
            8 => Self::DfuManifestWaitReset,
            9 => Self::DfuUploadIdle,
            10 => Self::DfuError,
            _ => return Err(Error::MalformedResponse("unknown DFU state")),
        };

        Ok(state)
    }
}

impl DfuState {
    /// States in which the device accepts a new command.
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::DfuIdle | Self::DfuDnloadIdle)
    }
}

/// `bStatus` value meaning no error.
pub const STATUS_OK: u8 = 0;

/// Reply to DFU_GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: Duration,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub const LEN: usize = 6;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let [status, p0, p1, p2, state, string_index] = data else {
            return Err(Error::MalformedResponse("short DFU status"));
        };

        Ok(Self {
            status: *status,
            poll_timeout: Duration::from_millis(u64::from(u32::from_le_bytes([*p0, *p1, *p2, 0]))),
            state: DfuState::try_from(*state)?,
            string_index: *string_index,
        })
    }

    pub const fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// USB identity of an opened DFU device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `bcdDevice` of the bootloader. Decides the transfer size.
    pub protocol_version: u16,
}

/// Capability needed to drive a DFU device. The state machine in [`crate::DfuSession`] is
/// written only against this trait.
pub trait DfuTransport {
    fn identity(&self) -> UsbIdentity;

    /// String descriptors of every alternate setting of the DFU interface, as `(alt, string)`.
    fn alt_settings(&mut self) -> Result<Vec<(u8, String)>>;

    fn select_configuration(&mut self, alt_setting: u8) -> Result<()>;

    fn download(&mut self, block: u16, data: &[u8]) -> Result<()>;

    fn upload(&mut self, block: u16, len: usize) -> Result<Vec<u8>>;

    fn get_status(&mut self) -> Result<DfuStatus>;

    fn clear_status(&mut self) -> Result<()>;

    fn abort(&mut self) -> Result<()>;
}

impl<T: DfuTransport + ?Sized> DfuTransport for Box<T> {
    fn identity(&self) -> UsbIdentity {
        (**self).identity()
    }

    fn alt_settings(&mut self) -> Result<Vec<(u8, String)>> {
        (**self).alt_settings()
    }

    fn select_configuration(&mut self, alt_setting: u8) -> Result<()> {
        (**self).select_configuration(alt_setting)
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<()> {
        (**self).download(block, data)
    }

    fn upload(&mut self, block: u16, len: usize) -> Result<Vec<u8>> {
        (**self).upload(block, len)
    }

    fn get_status(&mut self) -> Result<DfuStatus> {
        (**self).get_status()
    }

    fn clear_status(&mut self) -> Result<()> {
        (**self).clear_status()
    }

    fn abort(&mut self) -> Result<()> {
        (**self).abort()
    }
}

impl<T: DfuTransport + ?Sized> DfuTransport for &mut T {
    fn identity(&self) -> UsbIdentity {
        (**self).identity()
    }

    fn alt_settings(&mut self) -> Result<Vec<(u8, String)>> {
        (**self).alt_settings()
    }

    fn select_configuration(&mut self, alt_setting: u8) -> Result<()> {
        (**self).select_configuration(alt_setting)
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<()> {
        (**self).download(block, data)
    }

    fn upload(&mut self, block: u16, len: usize) -> Result<Vec<u8>> {
        (**self).upload(block, len)
    }

    fn get_status(&mut self) -> Result<DfuStatus> {
        (**self).get_status()
    }

    fn clear_status(&mut self) -> Result<()> {
        (**self).clear_status()
    }

    fn abort(&mut self) -> Result<()> {
        (**self).abort()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DfuState, DfuStatus};

    #[test]
    fn status_from_bytes() {
        let status = DfuStatus::from_bytes(&[0, 0x10, 0x27, 0, 4, 0]).unwrap();

        assert!(status.is_ok());
        assert_eq!(status.poll_timeout, Duration::from_millis(10000));
        assert_eq!(status.state, DfuState::DfuDnbusy);
        assert!(!status.state.is_idle());

        assert!(DfuStatus::from_bytes(&[0, 0, 0, 0, 2]).is_err());
        assert!(DfuStatus::from_bytes(&[0, 0, 0, 0, 11, 0]).is_err());
    }
}
