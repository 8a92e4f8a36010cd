//! DfuSe erase/program/verify/leave state machine.

use std::{borrow::Cow, collections::BTreeSet, fmt, time::Duration};

use futures::channel::mpsc;
use nf_helper::retry::{Attempt, PollError, poll_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    DfuFile, Error, Result, SectorMap, Status, StatusCode,
    helpers::{chan_send, check_token, progress},
    transport::{DfuState, DfuStatus, DfuTransport, UsbIdentity},
};

const COMMAND_SET_ADDRESS: u8 = 0x21;
const COMMAND_ERASE: u8 = 0x41;

/// Blocks 0 and 1 are reserved for DfuSe commands.
const FIRST_DATA_BLOCK: u16 = 2;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const FILLER: u8 = 0xff;

pub const DEFAULT_ENTRY_ADDRESS: u32 = 0x0800_0000;

#[derive(Debug, Clone)]
pub struct DfuOptions {
    /// Upper bound for a single wait-until-idle. `None` waits as long as the device says busy.
    pub poll_timeout: Option<Duration>,
    /// Address the bootloader jumps to when leaving DFU mode.
    pub entry_address: u32,
}

impl Default for DfuOptions {
    fn default() -> Self {
        Self {
            // Mass erase on large parts takes tens of seconds
            poll_timeout: Some(Duration::from_secs(60)),
            entry_address: DEFAULT_ENTRY_ADDRESS,
        }
    }
}

/// The DFU file was built for a different USB device than the one connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMismatch {
    pub file: (u16, u16),
    pub device: (u16, u16),
}

impl fmt::Display for IdentityMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DFU file targets {:04x}:{:04x} but the connected device is {:04x}:{:04x}",
            self.file.0, self.file.1, self.device.0, self.device.1
        )
    }
}

/// Transfer size for a bootloader version (`bcdDevice`).
pub(crate) const fn block_size_for(protocol_version: u16) -> usize {
    if protocol_version >= 0x2100 {
        2048
    } else {
        1024
    }
}

/// Pad a short final block with `0xFF` up to `block_size`.
pub(crate) fn padded_block(chunk: &[u8], block_size: usize) -> Cow<'_, [u8]> {
    if chunk.len() >= block_size {
        Cow::Borrowed(chunk)
    } else {
        let mut temp = Vec::with_capacity(block_size);
        temp.extend_from_slice(chunk);
        temp.resize(block_size, FILLER);
        Cow::Owned(temp)
    }
}

fn chunk_address(address: u32, offset: usize) -> Result<u32> {
    u32::try_from(u64::from(address) + offset as u64)
        .map_err(|_| Error::InvalidImage(format!("{address:#010x} + {offset} overflows")))
}

/// One open DFU device. Dropping the session releases the transport.
pub struct DfuSession<T: DfuTransport> {
    transport: T,
    identity: UsbIdentity,
    sectors: SectorMap,
    block_size: usize,
    alt_setting: Option<u8>,
    state: DfuState,
    options: DfuOptions,
    chan: Option<mpsc::Sender<Status>>,
    cancel: Option<CancellationToken>,
}

impl<T: DfuTransport> DfuSession<T> {
    /// Read the memory layout and bring the device back to `dfuIDLE`.
    pub fn open(mut transport: T, options: DfuOptions) -> Result<Self> {
        let identity = transport.identity();
        let block_size = block_size_for(identity.protocol_version);

        let mut sectors = SectorMap::new();
        for (alt, desc) in transport.alt_settings()? {
            match sectors.push_descriptor(&desc) {
                Ok(()) => debug!("Alt setting {alt}: {desc}"),
                Err(e) => warn!("Ignoring memory layout of alt setting {alt} ({desc}): {e}"),
            }
        }

        let mut session = Self {
            transport,
            identity,
            sectors,
            block_size,
            alt_setting: None,
            state: DfuState::DfuIdle,
            options,
            chan: None,
            cancel: None,
        };

        session.recover()?;
        info!(
            "Opened DFU device {:04x}:{:04x}, bootloader {:#06x}, {} byte blocks",
            identity.vendor_id, identity.product_id, identity.protocol_version, block_size
        );

        Ok(session)
    }

    pub fn with_progress(mut self, chan: Option<mpsc::Sender<Status>>) -> Self {
        self.chan = chan;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub const fn identity(&self) -> UsbIdentity {
        self.identity
    }

    pub const fn sectors(&self) -> &SectorMap {
        &self.sectors
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn state(&self) -> DfuState {
        self.state
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Compare the DFU file suffix against the connected device. A mismatch is only a warning:
    /// compatible variants sometimes report a different PID.
    pub fn check_identity(&self, file: &DfuFile) -> Option<IdentityMismatch> {
        if file.matches_device(self.identity.vendor_id, self.identity.product_id) {
            return None;
        }

        let mismatch = IdentityMismatch {
            file: (file.vendor_id, file.product_id),
            device: (self.identity.vendor_id, self.identity.product_id),
        };
        warn!("{mismatch}");
        Some(mismatch)
    }

    /// Erase the whole flash with a single command.
    pub fn mass_erase(&mut self) -> Result<()> {
        check_token(self.cancel.as_ref())?;
        info!("Mass erase");

        chan_send(self.chan.as_mut(), Status::Erasing(0.0));
        self.command(&[COMMAND_ERASE])?;
        chan_send(self.chan.as_mut(), Status::Erasing(1.0));

        Ok(())
    }

    /// Erase every erasable sector touched by `segments`, each sector once. Returns the number of
    /// sectors erased.
    pub fn erase_for(&mut self, segments: &[(u32, &[u8])]) -> Result<usize> {
        let mut pages = BTreeSet::new();

        for (address, data) in segments {
            if data.is_empty() {
                continue;
            }
            if !self.sectors.covers(*address, data.len()) {
                return Err(Error::AddressNotMapped(*address));
            }

            pages.extend(
                self.sectors
                    .overlapping(*address, data.len())
                    .filter(|s| s.flags.erasable())
                    .map(|s| s.start_address),
            );
        }

        info!("Erasing {} sectors", pages.len());
        chan_send(self.chan.as_mut(), Status::Erasing(0.0));

        for (i, page) in pages.iter().enumerate() {
            check_token(self.cancel.as_ref())?;

            debug!("Erase sector {page:#010x}");
            let [a, b, c, d] = page.to_le_bytes();
            self.command(&[COMMAND_ERASE, a, b, c, d])?;

            chan_send(
                self.chan.as_mut(),
                Status::Erasing(progress(i + 1, pages.len())),
            );
        }

        Ok(pages.len())
    }

    /// Write `segments` to the memory behind `alt_setting`.
    pub fn program(&mut self, alt_setting: u8, segments: &[(u32, &[u8])]) -> Result<()> {
        self.select(alt_setting)?;

        let total: usize = segments.iter().map(|(_, d)| d.len()).sum();
        let mut done = 0;
        chan_send(self.chan.as_mut(), Status::Flashing(0.0));

        for (address, data) in segments {
            info!("Writing {} bytes at {address:#010x}", data.len());

            // Block numbers are relative to the address pointer. Re-address before wrapping.
            let mut next_block = None;
            for (i, chunk) in data.chunks(self.block_size).enumerate() {
                check_token(self.cancel.as_ref())?;

                let block = match next_block {
                    Some(x) => x,
                    None => {
                        self.set_address(chunk_address(*address, i * self.block_size)?)?;
                        FIRST_DATA_BLOCK
                    }
                };

                let temp = padded_block(chunk, self.block_size);
                self.transport.download(block, &temp)?;
                self.wait_idle()?;
                next_block = block.checked_add(1);

                done += chunk.len();
                chan_send(self.chan.as_mut(), Status::Flashing(progress(done, total)));
            }
        }

        Ok(())
    }

    /// Read back `segments` and compare. Fails with the first differing address.
    pub fn verify(&mut self, alt_setting: u8, segments: &[(u32, &[u8])]) -> Result<()> {
        self.select(alt_setting)?;

        let total: usize = segments.iter().map(|(_, d)| d.len()).sum();
        let mut done = 0;
        chan_send(self.chan.as_mut(), Status::Verifying(0.0));

        for (address, data) in segments {
            info!("Verifying {} bytes at {address:#010x}", data.len());

            let mut next_block = None;
            for (i, chunk) in data.chunks(self.block_size).enumerate() {
                check_token(self.cancel.as_ref())?;
                let chunk_start = chunk_address(*address, i * self.block_size)?;

                let block = match next_block {
                    Some(x) => x,
                    None => {
                        self.set_address(chunk_start)?;
                        // Uploads are only accepted from dfuIDLE
                        self.transport.abort()?;
                        FIRST_DATA_BLOCK
                    }
                };

                let read = self.transport.upload(block, self.block_size)?;
                if read.len() < chunk.len() {
                    return Err(Error::MalformedResponse("short upload"));
                }
                if let Some(pos) = chunk.iter().zip(&read).position(|(a, b)| a != b) {
                    warn!("Mismatch at {:#010x}", chunk_start as usize + pos);
                    return Err(Error::VerifyFailed(chunk_address(chunk_start, pos)?));
                }
                next_block = block.checked_add(1);

                done += chunk.len();
                chan_send(self.chan.as_mut(), Status::Verifying(progress(done, total)));
            }

            self.transport.abort()?;
            self.state = DfuState::DfuIdle;
        }

        Ok(())
    }

    /// Leave DFU mode and start the firmware at the configured entry address.
    pub fn leave(&mut self) -> Result<()> {
        self.leave_at(self.options.entry_address)
    }

    pub fn leave_at(&mut self, entry_address: u32) -> Result<()> {
        info!("Leaving DFU mode, entry {entry_address:#010x}");

        self.set_address(entry_address)?;

        // The device resets as soon as it manifests, so it may vanish under us
        match self.transport.download(FIRST_DATA_BLOCK, &[]) {
            Ok(()) => match self.transport.get_status() {
                Ok(s) => debug!("State after leave request: {:?}", s.state),
                Err(e) => debug!("Device gone after leave request: {e}"),
            },
            Err(e) => debug!("Device gone after leave request: {e}"),
        }

        self.state = DfuState::DfuManifest;
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let status = self.transport.get_status()?;

        match status.state {
            DfuState::DfuError => {
                warn!(
                    "Device in dfuERROR ({}), clearing",
                    StatusCode(status.status)
                );
                self.transport.clear_status()?;
            }
            DfuState::DfuIdle => {}
            x => {
                debug!("Device in {x:?}, aborting");
                self.transport.abort()?;
            }
        }

        let status = self.transport.get_status()?;
        self.state = status.state;
        if status.state == DfuState::DfuIdle && status.is_ok() {
            Ok(())
        } else {
            Err(Error::Protocol {
                status: StatusCode(status.status),
                state: status.state,
            })
        }
    }

    fn select(&mut self, alt_setting: u8) -> Result<()> {
        if self.alt_setting != Some(alt_setting) {
            self.transport.select_configuration(alt_setting)?;
            self.alt_setting = Some(alt_setting);
        }

        Ok(())
    }

    fn set_address(&mut self, address: u32) -> Result<()> {
        debug!("Set address {address:#010x}");
        let [a, b, c, d] = address.to_le_bytes();
        self.command(&[COMMAND_SET_ADDRESS, a, b, c, d])
    }

    fn command(&mut self, payload: &[u8]) -> Result<()> {
        self.transport.download(0, payload)?;
        self.wait_idle().map(|_| ())
    }

    /// Poll GETSTATUS until the device is idle again.
    fn wait_idle(&mut self) -> Result<DfuStatus> {
        let timeout = self.options.poll_timeout;
        let transport = &mut self.transport;
        let cancel = self.cancel.as_ref();

        let res = poll_until(timeout, || {
            check_token(cancel)?;
            let status = transport.get_status()?;

            if !status.is_ok() || status.state == DfuState::DfuError {
                Err(Error::Protocol {
                    status: StatusCode(status.status),
                    state: status.state,
                })
            } else if status.state.is_idle() {
                Ok(Attempt::Ready(status))
            } else {
                Ok(Attempt::Pending(status.poll_timeout.max(MIN_POLL_INTERVAL)))
            }
        });

        match res {
            Ok(status) => {
                self.state = status.state;
                Ok(status)
            }
            Err(PollError::TimedOut(t)) => Err(Error::Timeout(t)),
            Err(PollError::Failed(e)) => {
                if let Error::Protocol { state, .. } = e {
                    self.state = state;
                    // Leave the device usable for a retry
                    let _ = self.transport.clear_status();
                }
                Err(e)
            }
        }
    }
}
