//! In-memory DfuSe device for tests.

use std::{io, time::Duration};

use crate::{
    Error, Result,
    transport::{DfuState, DfuStatus, DfuTransport, UsbIdentity},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Op {
    Select(u8),
    SetAddress(u32),
    Erase(u32),
    MassErase,
    Write { block: u16, address: u32, len: usize },
    Leave,
    Abort,
    ClearStatus,
}

pub(crate) struct FakeDevice {
    pub(crate) identity: UsbIdentity,
    pub(crate) descriptors: Vec<(u8, String)>,
    pub(crate) state: DfuState,
    pub(crate) status: u8,
    pub(crate) log: Vec<Op>,
    /// GETSTATUS replies of `dfuDNBUSY` after each command.
    pub(crate) busy_polls: usize,
    pub(crate) fail_erase_at: Option<u32>,
    pub(crate) vanish_on_leave: bool,
    base: u32,
    memory: Vec<u8>,
    pointer: u32,
    pending_busy: usize,
    pending_error: Option<u8>,
    vanished: bool,
}

impl FakeDevice {
    pub(crate) fn stm32f4() -> Self {
        Self {
            identity: UsbIdentity {
                vendor_id: 0x0483,
                product_id: 0xdf11,
                protocol_version: 0x2200,
            },
            descriptors: vec![
                (
                    0,
                    "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg".to_string(),
                ),
                (1, "@Option Bytes  /0x1FFFC000/01*016 e".to_string()),
            ],
            state: DfuState::DfuIdle,
            status: 0,
            log: Vec::new(),
            busy_polls: 1,
            fail_erase_at: None,
            vanish_on_leave: false,
            base: 0x0800_0000,
            memory: vec![0; 1024 * 1024],
            pointer: 0,
            pending_busy: 0,
            pending_error: None,
            vanished: false,
        }
    }

    pub(crate) fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                (address as usize + i)
                    .checked_sub(self.base as usize)
                    .and_then(|x| self.memory.get(x))
                    .copied()
                    .unwrap_or(0xff)
            })
            .collect()
    }

    fn gone(&self) -> Result<()> {
        if self.vanished {
            Err(Error::IoError(io::Error::new(
                io::ErrorKind::NotConnected,
                "device re-enumerated",
            )))
        } else {
            Ok(())
        }
    }

    fn stall() -> Error {
        Error::IoError(io::Error::other("pipe stalled"))
    }

    fn command(&mut self, payload: &[u8]) -> Result<()> {
        match payload {
            [0x21, a, b, c, d] => {
                self.pointer = u32::from_le_bytes([*a, *b, *c, *d]);
                self.log.push(Op::SetAddress(self.pointer));
            }
            [0x41] => {
                self.memory.fill(0xff);
                self.log.push(Op::MassErase);
            }
            [0x41, a, b, c, d] => {
                let address = u32::from_le_bytes([*a, *b, *c, *d]);
                self.log.push(Op::Erase(address));
                if self.fail_erase_at == Some(address) {
                    self.pending_error = Some(0x04);
                }
            }
            _ => return Err(Self::stall()),
        }

        Ok(())
    }
}

impl DfuTransport for FakeDevice {
    fn identity(&self) -> UsbIdentity {
        self.identity
    }

    fn alt_settings(&mut self) -> Result<Vec<(u8, String)>> {
        Ok(self.descriptors.clone())
    }

    fn select_configuration(&mut self, alt_setting: u8) -> Result<()> {
        self.log.push(Op::Select(alt_setting));
        Ok(())
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<()> {
        self.gone()?;
        if !self.state.is_idle() {
            return Err(Self::stall());
        }

        match block {
            0 => self.command(data)?,
            1 => return Err(Self::stall()),
            _ if data.is_empty() => {
                self.log.push(Op::Leave);
                self.vanished = self.vanish_on_leave;
                self.state = DfuState::DfuManifestSync;
                return Ok(());
            }
            _ => {
                let address = self.pointer + u32::from(block - 2) * data.len() as u32;
                self.log.push(Op::Write {
                    block,
                    address,
                    len: data.len(),
                });

                let start = (address - self.base) as usize;
                self.memory[start..start + data.len()].copy_from_slice(data);
            }
        }

        self.state = DfuState::DfuDnbusy;
        self.pending_busy = self.busy_polls;
        Ok(())
    }

    fn upload(&mut self, block: u16, len: usize) -> Result<Vec<u8>> {
        self.gone()?;
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DfuUploadIdle) {
            return Err(Self::stall());
        }

        self.state = DfuState::DfuUploadIdle;
        let address = self.pointer + u32::from(block - 2) * len as u32;
        Ok(self.read(address, len))
    }

    fn get_status(&mut self) -> Result<DfuStatus> {
        self.gone()?;

        if self.state == DfuState::DfuDnbusy {
            if let Some(status) = self.pending_error.take() {
                self.state = DfuState::DfuError;
                self.status = status;
            } else if self.pending_busy > 0 {
                self.pending_busy -= 1;
            } else {
                self.state = DfuState::DfuDnloadIdle;
            }
        }

        Ok(DfuStatus {
            status: self.status,
            poll_timeout: Duration::ZERO,
            state: self.state,
            string_index: 0,
        })
    }

    fn clear_status(&mut self) -> Result<()> {
        self.gone()?;
        self.log.push(Op::ClearStatus);
        self.status = 0;
        self.state = DfuState::DfuIdle;
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.gone()?;
        self.log.push(Op::Abort);
        self.state = DfuState::DfuIdle;
        Ok(())
    }
}
