use std::{borrow::Cow, time::Duration};

use futures::channel::mpsc;
use nf_helper::PartitionMap;
use tracing::{debug, info, warn};

use crate::{
    ConnectOptions, Connection, DeviceInfo, Error, FlashSize, PartitionLayout, Result, Status,
    StubImage, chip,
    command::{Command, CommandType},
    errata,
    helpers::{chan_send, check_token, progress, timeout_for_size},
    serial::SerialTransport,
};

const FLASH_SECTOR_SIZE: u32 = 0x1000;
const FLASH_WRITE_SIZE_ROM: usize = 0x400;
const FLASH_WRITE_SIZE_STUB: usize = 0x4000;
const READ_PACKETS_IN_FLIGHT: u32 = 64;
const DIGEST_LEN: usize = 16;
const FILLER: u8 = 0xff;

const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);

pub const DEFAULT_BAUD: u32 = 115200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Rate the ROM loader is reached at.
    pub baud: u32,
    /// Rate to switch to once the stub is running.
    pub flash_baud: Option<u32>,
    /// Stub to bootstrap. `None` talks to the ROM loader only.
    pub stub: Option<StubImage>,
    pub connect: ConnectOptions,
    /// Firmware target name. Used to look up board errata.
    pub target: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            flash_baud: None,
            stub: None,
            connect: ConnectOptions::default(),
            target: None,
        }
    }
}

/// Whole sectors covering `[offset, offset + size)`, as start and length.
fn sector_span(offset: u32, size: u32) -> Result<(u32, u32)> {
    let start = offset - offset % FLASH_SECTOR_SIZE;
    let end = (u64::from(offset) + u64::from(size))
        .next_multiple_of(u64::from(FLASH_SECTOR_SIZE));

    if end > u64::from(u32::MAX) + 1 {
        return Err(Error::RegionOutOfRange { offset, size });
    }
    let len = u32::try_from(end - u64::from(start))
        .map_err(|_| Error::RegionOutOfRange { offset, size })?;

    Ok((start, len))
}

/// One flashing session with a connected ESP32.
pub struct Esp32<P: SerialTransport> {
    conn: Connection<P>,
    info: DeviceInfo,
    settle: Option<Duration>,
    chan: Option<mpsc::Sender<Status>>,
    cancel: Option<tokio_util::sync::CancellationToken>,
}

fn padded_block(chunk: &[u8], size: usize) -> Cow<'_, [u8]> {
    if chunk.len() == size {
        Cow::Borrowed(chunk)
    } else {
        let mut temp = chunk.to_vec();
        temp.resize(size, FILLER);
        Cow::Owned(temp)
    }
}

impl<P: SerialTransport> Esp32<P> {
    /// Connect, identify the chip, bootstrap the stub if given and attach the SPI flash.
    pub fn open(
        port: P,
        options: &SessionOptions,
        mut chan: Option<mpsc::Sender<Status>>,
        cancel: Option<tokio_util::sync::CancellationToken>,
    ) -> Result<Self> {
        chan_send(chan.as_mut(), Status::Preparing);
        check_token(cancel.as_ref())?;

        let mut conn = Connection::new(port, options.baud);
        conn.connect(&options.connect, chan.as_mut(), cancel.as_ref())?;

        let (family, revision, features) = chip::detect(&mut conn)?;
        info!("Detected {family}, revision {revision:?}");

        if let Some(stub) = &options.stub {
            check_token(cancel.as_ref())?;
            stub.run(&mut conn)?;

            if let Some(baud) = options.flash_baud {
                conn.change_baud(baud)?;
            }
        } else if options.flash_baud.is_some() {
            debug!("Staying at {} baud without the stub", conn.baud());
        }

        let stub = conn.is_bootstrapped();
        conn.command(Command::SpiAttach { stub })?;

        let flash_id = chip::flash_id(&mut conn, family)?;
        let flash_size = DeviceInfo::flash_size_from_id(flash_id);
        conn.command(Command::SpiSetParams { size: flash_size })?;
        info!("Flash id {flash_id:#08x}, {} MB", flash_size / (1024 * 1024));

        let settle = errata::settle_delay(options.target.as_deref());
        if let Some(d) = settle {
            info!("Board needs {d:?} to settle before erase and write");
        }

        Ok(Self {
            conn,
            info: DeviceInfo {
                family,
                revision,
                features,
                flash_id,
                flash_size,
            },
            settle,
            chan,
            cancel,
        })
    }

    pub const fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub const fn is_bootstrapped(&self) -> bool {
        self.conn.is_bootstrapped()
    }

    /// Flash size to use. `override_mb` wins over the detected size.
    pub fn flash_size(&self, override_mb: Option<u32>) -> Result<FlashSize> {
        FlashSize::select(self.info.flash_size, override_mb)
    }

    pub const fn layout(&self, size: FlashSize) -> PartitionLayout {
        PartitionLayout::new(self.info.family, size)
    }

    fn require_stub(&self, what: &'static str) -> Result<()> {
        if self.conn.is_bootstrapped() {
            Ok(())
        } else {
            Err(Error::StubRequired(what))
        }
    }

    fn settle(&self) {
        if let Some(d) = self.settle {
            info!("Waiting {d:?} for the board to settle");
            std::thread::sleep(d);
        }
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        self.require_stub("Chip erase")?;
        check_token(self.cancel.as_ref())?;
        self.settle();

        info!("Erasing flash");
        chan_send(self.chan.as_mut(), Status::Erasing);
        self.conn.command(Command::EraseFlash)?;

        Ok(())
    }

    /// Erase whole sectors covering `[offset, offset + size)`.
    pub fn erase_region(&mut self, offset: u32, size: u32) -> Result<()> {
        self.require_stub("Region erase")?;
        let (start, size) = sector_span(offset, size)?;
        check_token(self.cancel.as_ref())?;
        self.settle();

        info!("Erasing {size:#x} bytes at {start:#010x}");
        chan_send(self.chan.as_mut(), Status::Erasing);
        self.conn.command_with_timeout(
            Command::EraseRegion {
                offset: start,
                size,
            },
            timeout_for_size(
                ERASE_REGION_TIMEOUT_PER_MB,
                size,
                CommandType::EraseRegion.timeout(),
            ),
        )?;

        Ok(())
    }

    /// Write every image of `map`, lowest address first.
    pub fn write(&mut self, map: &PartitionMap) -> Result<()> {
        self.settle();

        let images = map.ascending();
        let total: usize = images.iter().map(|(_, x)| x.len()).sum();
        let mut done = 0;

        chan_send(self.chan.as_mut(), Status::Flashing(0.0));
        for (address, image) in images {
            if image.is_empty() {
                warn!("Skipping empty image {}", image.name());
                continue;
            }

            info!(
                "Writing {} ({} bytes) at {address:#010x}",
                image.name(),
                image.len()
            );
            self.write_region(address, image.data(), &mut done, total)?;
        }

        self.conn.command(Command::FlashEnd { reboot: false })?;
        info!("Wrote {total} bytes");

        Ok(())
    }

    fn write_region(
        &mut self,
        address: u32,
        data: &[u8],
        done: &mut usize,
        total: usize,
    ) -> Result<()> {
        let stub = self.conn.is_bootstrapped();
        let block_size = if stub {
            FLASH_WRITE_SIZE_STUB
        } else {
            FLASH_WRITE_SIZE_ROM
        };
        let size = data.len() as u32;

        check_token(self.cancel.as_ref())?;
        self.conn.command_with_timeout(
            Command::FlashBegin {
                size,
                blocks: data.len().div_ceil(block_size) as u32,
                block_size: block_size as u32,
                offset: address,
                encrypted_field: !stub && self.info.family.rom_has_encrypted_flag(),
            },
            timeout_for_size(
                ERASE_WRITE_TIMEOUT_PER_MB,
                size,
                CommandType::FlashBegin.timeout(),
            ),
        )?;

        let data_timeout = timeout_for_size(
            ERASE_WRITE_TIMEOUT_PER_MB,
            block_size as u32,
            CommandType::FlashData.timeout(),
        );

        for (sequence, chunk) in data.chunks(block_size).enumerate() {
            check_token(self.cancel.as_ref())?;

            let block = padded_block(chunk, block_size);
            self.conn.command_with_timeout(
                Command::FlashData {
                    data: &block,
                    sequence: sequence as u32,
                },
                data_timeout,
            )?;

            *done += chunk.len();
            chan_send(self.chan.as_mut(), Status::Flashing(progress(*done, total)));
        }

        Ok(())
    }

    /// Read `size` bytes of flash at `offset`.
    pub fn backup(&mut self, offset: u32, size: u32) -> Result<Vec<u8>> {
        self.require_stub("Flash read")?;
        check_token(self.cancel.as_ref())?;

        info!("Reading {size:#x} bytes at {offset:#010x}");
        self.conn.command(Command::ReadFlash {
            offset,
            size,
            sector_size: FLASH_SECTOR_SIZE,
            in_flight: READ_PACKETS_IN_FLIGHT,
        })?;

        let expected = size as usize;
        let mut data = Vec::with_capacity(expected);
        chan_send(self.chan.as_mut(), Status::Reading(0.0));

        while data.len() < expected {
            let packet = self.read_packet()?;
            if packet.is_empty() || data.len() + packet.len() > expected {
                return Err(Error::ShortRead {
                    received: data.len() + packet.len(),
                    expected,
                });
            }

            data.extend_from_slice(&packet);
            self.conn.write_frame(&(data.len() as u32).to_le_bytes())?;
            chan_send(
                self.chan.as_mut(),
                Status::Reading(progress(data.len(), expected)),
            );
        }

        let digest = self.read_packet()?;
        if digest.len() != DIGEST_LEN {
            return Err(Error::InvalidResponse("bad flash read digest"));
        }
        debug!("Flash read digest {}", const_hex::encode(&digest));

        Ok(data)
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.conn.read_frame(CommandType::ReadFlash.timeout()) {
            Err(Error::ConnectTimeout(_)) => Err(Error::NoResponse(CommandType::ReadFlash)),
            x => x,
        }
    }

    /// Reboot into the application.
    pub fn reset(&mut self) -> Result<()> {
        self.conn.hard_reset()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use nf_helper::{PartitionImage, PartitionMap};

    use super::{SessionOptions, padded_block, sector_span};
    use crate::{
        Error, Esp32, FlashSize, Status, StubImage,
        fake::{FakeEsp, fast_connect},
    };

    fn stub() -> StubImage {
        StubImage {
            entry: 0x400be5ac,
            text: vec![0x11; 100],
            text_start: 0x400be000,
            data: vec![0x22; 10],
            data_start: 0x3ffe0000,
        }
    }

    fn session(stub: Option<StubImage>) -> SessionOptions {
        SessionOptions {
            stub,
            connect: fast_connect(),
            ..Default::default()
        }
    }

    fn package() -> PartitionMap {
        [
            (0x10000, PartitionImage::new("nanoCLR.bin", vec![0x33; 0x5000])),
            (0x8000, PartitionImage::new("partitions_4mb.bin", vec![0x44; 0xc00])),
            (0x1000, PartitionImage::new("bootloader.bin", vec![0x55; 0x1234])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn pad_with_filler() {
        assert_eq!(padded_block(&[1, 2], 4).as_ref(), [1, 2, 0xff, 0xff]);
        assert_eq!(padded_block(&[1, 2], 2).as_ref(), [1, 2]);
    }

    #[test]
    fn rom_write_ascending() {
        let mut dev = FakeEsp::esp32();
        let (tx, rx) = futures::channel::mpsc::channel(256);

        let mut esp = Esp32::open(&mut dev, &session(None), Some(tx), None).unwrap();
        assert_eq!(esp.info().flash_size, 4 * 1024 * 1024);
        esp.write(&package()).unwrap();
        drop(esp);

        assert_eq!(dev.flash_begins, [(0x1000, 0x400), (0x8000, 0x400), (0x10000, 0x400)]);
        assert_eq!(dev.read(0x1000, 0x1234), vec![0x55; 0x1234]);
        // Last ROM block is padded
        assert_eq!(dev.read(0x1000 + 0x1234, 0x1400 - 0x1234), vec![0xff; 0x1400 - 0x1234]);
        assert_eq!(dev.read(0x10000, 0x5000), vec![0x33; 0x5000]);

        let statuses: Vec<Status> = futures::executor::block_on(rx.collect());
        assert_eq!(statuses[0], Status::Preparing);
        assert_eq!(statuses.last(), Some(&Status::Flashing(1.0)));
    }

    #[test]
    fn stub_chip_erase_and_reset() {
        let mut dev = FakeEsp::esp32();
        dev.fill(0x00);

        let mut esp = Esp32::open(&mut dev, &session(Some(stub())), None, None).unwrap();
        esp.erase_chip().unwrap();
        esp.write(&package()).unwrap();
        esp.reset().unwrap();
        drop(esp);

        assert!(dev.chip_erased);
        assert_eq!(dev.flash_begins[0], (0x1000, 0x4000));
        // Untouched flash stays erased
        assert_eq!(dev.read(0x300000, 16), vec![0xff; 16]);
        assert_eq!(dev.resets, 2);
    }

    #[test]
    fn chip_erase_needs_stub() {
        let mut dev = FakeEsp::esp32();
        let mut esp = Esp32::open(&mut dev, &session(None), None, None).unwrap();

        assert!(matches!(esp.erase_chip(), Err(Error::StubRequired(_))));
        drop(esp);
        assert!(!dev.chip_erased);
    }

    #[test]
    fn size_override() {
        let mut dev = FakeEsp::esp32();
        let esp = Esp32::open(&mut dev, &session(None), None, None).unwrap();

        assert_eq!(esp.flash_size(None).unwrap(), FlashSize::Mb4);
        assert_eq!(esp.flash_size(Some(8)).unwrap(), FlashSize::Mb8);
        assert!(matches!(
            esp.flash_size(Some(32)),
            Err(Error::UnsupportedFlashSize(32))
        ));
    }

    #[test]
    fn wrong_partition_table_variant() {
        let mut dev = FakeEsp::esp32();
        let esp = Esp32::open(&mut dev, &session(None), None, None).unwrap();
        let mut map = package();
        map.insert(0x8000, PartitionImage::new("partitions_8mb.bin", vec![0; 16]));

        let size = esp.flash_size(None).unwrap();
        assert!(matches!(
            esp.layout(size).check(&map, size),
            Err(Error::PartitionTableMismatch { .. })
        ));

        // Overriding the size makes the 8 MB table the right one
        let size = esp.flash_size(Some(8)).unwrap();
        esp.layout(size).check(&map, size).unwrap();
    }

    #[test]
    fn backup_reads_flash() {
        let mut dev = FakeEsp::esp32();
        for (i, b) in dev.flash[0x2000..0x4800].iter_mut().enumerate() {
            *b = i as u8;
        }

        let (tx, rx) = futures::channel::mpsc::channel(256);
        let mut esp = Esp32::open(&mut dev, &session(Some(stub())), Some(tx), None).unwrap();
        let data = esp.backup(0x2000, 0x2800).unwrap();
        drop(esp);

        assert_eq!(data.len(), 0x2800);
        assert!(data.iter().enumerate().all(|(i, b)| *b == i as u8));
        assert_eq!(dev.read_acks.last(), Some(&0x2800));

        let statuses: Vec<Status> = futures::executor::block_on(rx.collect());
        assert_eq!(statuses.last(), Some(&Status::Reading(1.0)));
    }

    #[test]
    fn backup_needs_stub() {
        let mut dev = FakeEsp::esp32();
        let mut esp = Esp32::open(&mut dev, &session(None), None, None).unwrap();

        assert!(matches!(esp.backup(0, 0x1000), Err(Error::StubRequired(_))));
    }

    #[test]
    fn erase_region_is_sector_aligned() {
        let mut dev = FakeEsp::esp32();
        let mut esp = Esp32::open(&mut dev, &session(Some(stub())), None, None).unwrap();
        esp.erase_region(0x1800, 0x1000).unwrap();
        drop(esp);

        assert_eq!(dev.region_erases, [(0x1000, 0x2000)]);
    }

    #[test]
    fn erase_span_near_end_of_address_space() {
        assert_eq!(sector_span(0x1800, 0x1000).unwrap(), (0x1000, 0x2000));
        assert_eq!(
            sector_span(0xffff_e000, 0x2000).unwrap(),
            (0xffff_e000, 0x2000)
        );
        assert!(matches!(
            sector_span(0xffff_f001, 0x2000),
            Err(Error::RegionOutOfRange {
                offset: 0xffff_f001,
                size: 0x2000
            })
        ));

        let mut dev = FakeEsp::esp32();
        let mut esp = Esp32::open(&mut dev, &session(Some(stub())), None, None).unwrap();
        assert!(matches!(
            esp.erase_region(0xffff_f001, 0x2000),
            Err(Error::RegionOutOfRange { .. })
        ));
        drop(esp);
        assert!(dev.region_erases.is_empty());
    }

    #[test]
    fn cancel_between_blocks() {
        let token = tokio_util::sync::CancellationToken::new();
        let mut dev = FakeEsp::esp32();
        let mut esp = Esp32::open(&mut dev, &session(None), None, Some(token.clone())).unwrap();

        token.cancel();
        assert!(matches!(esp.write(&package()), Err(Error::Aborted)));
        drop(esp);

        assert!(dev.flash_begins.is_empty());
    }
}
