use std::{
    collections::VecDeque,
    io::ErrorKind,
    time::{Duration, Instant},
};

use futures::channel::mpsc;
use nf_helper::console::ConnectWatcher;
use tracing::{debug, info, trace, warn};

use crate::{
    Error, Result, Status,
    command::{Command, CommandType, Response},
    helpers::{chan_send, check_token},
    serial::SerialTransport,
    slip::{self, Decoder},
};

/// Syncs tried after each reset pulse.
const SYNC_ATTEMPTS: usize = 5;
/// Stale responses skipped while waiting for the one we asked for.
const MAX_STALE_RESPONSES: usize = 100;
/// The ROM answers one SYNC with several replies.
const SYNC_REPLIES: usize = 7;
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
const STATUS_LEN_ROM: usize = 4;
const STATUS_LEN_STUB: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Continuous failure after which the user is asked to enter the bootloader by hand.
    pub prompt_after: Duration,
    /// Stop waiting altogether. `None` waits until cancelled.
    pub give_up_after: Option<Duration>,
    pub sync_timeout: Duration,
    /// How long EN is held low by the reset pulse.
    pub reset_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            prompt_after: ConnectWatcher::DEFAULT_THRESHOLD,
            give_up_after: None,
            sync_timeout: CommandType::Sync.timeout(),
            reset_delay: Duration::from_millis(100),
        }
    }
}

/// Link to the ROM loader, or to the flasher stub once it is running.
pub struct Connection<P> {
    port: P,
    decoder: Decoder,
    pending: VecDeque<u8>,
    baud: u32,
    bootstrapped: bool,
}

impl<P: SerialTransport> Connection<P> {
    pub fn new(port: P, baud: u32) -> Self {
        Self {
            port,
            decoder: Decoder::new(),
            pending: VecDeque::new(),
            baud,
            bootstrapped: false,
        }
    }

    pub const fn baud(&self) -> u32 {
        self.baud
    }

    /// True once the flasher stub has been started in this session.
    pub const fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub(crate) fn set_bootstrapped(&mut self) {
        self.bootstrapped = true;
    }

    pub(crate) const fn status_len(&self) -> usize {
        if self.bootstrapped {
            STATUS_LEN_STUB
        } else {
            STATUS_LEN_ROM
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    /// Reset the chip into the bootloader and sync with it.
    ///
    /// Keeps trying until a sync succeeds, `give_up_after` elapses or `cancel` fires. When the
    /// chip has not answered for `prompt_after`, [`Status::BootloaderPrompt`] is sent once.
    pub fn connect(
        &mut self,
        options: &ConnectOptions,
        mut chan: Option<&mut mpsc::Sender<Status>>,
        cancel: Option<&tokio_util::sync::CancellationToken>,
    ) -> Result<()> {
        info!("Connecting to bootloader");
        chan_send(chan.as_deref_mut(), Status::Connecting);

        let start = Instant::now();
        let mut watcher = ConnectWatcher::new(options.prompt_after);

        loop {
            check_token(cancel)?;
            if let Some(limit) = options.give_up_after {
                let elapsed = start.elapsed();
                if elapsed >= limit {
                    return Err(Error::ConnectTimeout(elapsed));
                }
            }

            self.reset_to_bootloader(options.reset_delay)?;
            Self::observe(&mut watcher, b"_", chan.as_deref_mut());

            for _ in 0..SYNC_ATTEMPTS {
                check_token(cancel)?;

                match self.sync(options.sync_timeout) {
                    Ok(()) => {
                        info!("Connected after {:?}", start.elapsed());
                        return Ok(());
                    }
                    Err(e) => {
                        trace!("Sync failed: {e}");
                        Self::observe(&mut watcher, b".", chan.as_deref_mut());
                    }
                }
            }
        }
    }

    fn observe(
        watcher: &mut ConnectWatcher,
        chunk: &[u8],
        chan: Option<&mut mpsc::Sender<Status>>,
    ) {
        if watcher.observe(chunk, Instant::now()) {
            warn!("No answer from the chip. Hold BOOT and press RESET to enter the bootloader");
            chan_send(chan, Status::BootloaderPrompt);
        }
    }

    /// Classic DTR/RTS reset with IO0 held low while EN is released.
    fn reset_to_bootloader(&mut self, delay: Duration) -> Result<()> {
        debug!("Reset into bootloader");

        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(true)?;
        std::thread::sleep(delay);
        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(false)?;
        std::thread::sleep(delay / 2);
        self.port.write_data_terminal_ready(false)?;

        self.bootstrapped = false;
        Ok(())
    }

    /// Reboot into the application.
    pub fn hard_reset(&mut self) -> Result<()> {
        info!("Hard reset");

        self.port.write_data_terminal_ready(false)?;
        self.port.write_request_to_send(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.write_request_to_send(false)?;

        self.bootstrapped = false;
        Ok(())
    }

    pub fn sync(&mut self, timeout: Duration) -> Result<()> {
        self.command_with_timeout(Command::Sync, timeout)?;

        for _ in 1..SYNC_REPLIES {
            if self.read_frame(SYNC_DRAIN_TIMEOUT).is_err() {
                break;
            }
        }

        Ok(())
    }

    pub fn command(&mut self, command: Command<'_>) -> Result<Response> {
        let timeout = command.command_type().timeout();
        self.command_with_timeout(command, timeout)
    }

    pub fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<Response> {
        let ty = command.command_type();
        trace!("Command {ty:?}");

        self.port.clear_input()?;
        self.pending.clear();
        self.decoder.reset();
        self.write_frame(&command.encode())?;

        for _ in 0..MAX_STALE_RESPONSES {
            let frame = match self.read_frame(timeout) {
                Ok(x) => x,
                Err(Error::ConnectTimeout(_)) => return Err(Error::NoResponse(ty)),
                Err(e) => return Err(e),
            };

            let res = match Response::parse(&frame, self.status_len()) {
                Ok(x) => x,
                Err(e) => {
                    debug!("Skipping frame: {e}");
                    continue;
                }
            };

            if res.op != ty as u8 {
                debug!("Skipping response to {:#04x}", res.op);
                continue;
            }

            if !res.is_ok() {
                return Err(Error::Rom {
                    command: ty,
                    error: crate::RomError(res.error),
                });
            }

            return Ok(res);
        }

        Err(Error::NoResponse(ty))
    }

    pub(crate) fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(&slip::encode(data))?;
        self.port.flush()?;
        Ok(())
    }

    /// Next complete frame. Fails with [`Error::ConnectTimeout`] if none arrives in `timeout`.
    pub(crate) fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 512];

        loop {
            while let Some(b) = self.pending.pop_front() {
                if let Some(frame) = self.decoder.push(b) {
                    self.log_noise();
                    return Ok(frame);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                self.log_noise();
                return Err(Error::ConnectTimeout(timeout));
            }

            match self.port.read(&mut buf) {
                Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                Ok(n) => self.pending.extend(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn log_noise(&mut self) {
        let noise = self.decoder.take_noise();
        if !noise.is_empty() {
            debug!("Device output: {}", String::from_utf8_lossy(&noise).trim());
        }
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        self.command(Command::ReadReg { address }).map(|x| x.value)
    }

    pub fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
        self.command(Command::WriteReg { address, value })?;
        Ok(())
    }

    /// Switch both ends to `baud`.
    pub fn change_baud(&mut self, baud: u32) -> Result<()> {
        // The ROM loader ignores the old rate, the stub uses it to adjust its clock
        let old = if self.bootstrapped { self.baud } else { 0 };
        self.command(Command::ChangeBaudrate { new: baud, old })?;

        self.port.set_baud_rate(baud)?;
        std::thread::sleep(Duration::from_millis(50));
        self.port.clear_input()?;
        self.pending.clear();
        self.decoder.reset();

        info!("Changed baud rate {} -> {baud}", self.baud);
        self.baud = baud;
        Ok(())
    }
}
