//! In-memory ESP32 ROM loader and stub for tests.

use std::{
    collections::{HashMap, VecDeque},
    io,
    time::Duration,
};

use crate::{
    ConnectOptions,
    chip::{ChipFamily, SpiRegisters},
    command::CommandType,
    serial::SerialTransport,
    slip::{self, Decoder},
};

const SPI_CMD_USR: u32 = 1 << 18;
const ROM_INVALID_MESSAGE: u8 = 0x05;

pub(crate) fn fast_connect() -> ConnectOptions {
    ConnectOptions {
        prompt_after: Duration::from_millis(40),
        give_up_after: Some(Duration::from_secs(5)),
        sync_timeout: Duration::from_millis(5),
        reset_delay: Duration::ZERO,
    }
}

pub(crate) struct FakeEsp {
    pub(crate) magic: u32,
    pub(crate) flash: Vec<u8>,
    pub(crate) flash_id: u32,
    pub(crate) registers: HashMap<u32, u32>,
    /// Syncs to ignore before answering.
    pub(crate) silent_syncs: usize,
    pub(crate) stub_running: bool,
    pub(crate) baud: u32,
    pub(crate) requested_baud: Option<(u32, u32)>,
    pub(crate) resets: usize,
    pub(crate) ram: HashMap<u32, Vec<u8>>,
    pub(crate) flash_begins: Vec<(u32, u32)>,
    pub(crate) region_erases: Vec<(u32, u32)>,
    pub(crate) chip_erased: bool,
    pub(crate) read_acks: Vec<u32>,
    /// Raw bytes written by the host.
    pub(crate) received: Vec<u8>,
    spi: SpiRegisters,
    decoder: Decoder,
    tx: VecDeque<u8>,
    mem_offset: u32,
    write_offset: u32,
    write_block: u32,
}

impl FakeEsp {
    pub(crate) fn new(magic: u32, flash_size: usize) -> Self {
        let family = ChipFamily::from_magic(magic).unwrap();
        let code = flash_size.trailing_zeros();

        Self {
            magic,
            flash: vec![0xff; flash_size],
            flash_id: (code << 16) | 0x40ef,
            registers: HashMap::new(),
            silent_syncs: 0,
            stub_running: false,
            baud: 115200,
            requested_baud: None,
            resets: 0,
            ram: HashMap::new(),
            flash_begins: Vec::new(),
            region_erases: Vec::new(),
            chip_erased: false,
            read_acks: Vec::new(),
            received: Vec::new(),
            spi: family.spi_registers(),
            decoder: Decoder::new(),
            tx: VecDeque::new(),
            mem_offset: 0,
            write_offset: 0,
            write_block: 0,
        }
    }

    /// ESP32 with 4 MB of flash.
    pub(crate) fn esp32() -> Self {
        Self::new(0x00f0_1d83, 4 * 1024 * 1024)
    }

    /// eFuse and APB bits of an ECO3 ESP32.
    pub(crate) fn set_revision3(&mut self) {
        self.registers.insert(0x3ff5_a00c, 1 << 15);
        self.registers.insert(0x3ff5_a014, 1 << 20);
        self.registers.insert(0x3ff6_607c, 1 << 31);
    }

    pub(crate) fn fill(&mut self, value: u8) {
        self.flash.fill(value);
    }

    pub(crate) fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let start = address as usize;
        self.flash[start..start + len].to_vec()
    }

    fn status_len(&self) -> usize {
        if self.stub_running { 2 } else { 4 }
    }

    fn respond(&mut self, op: u8, value: u32, data: &[u8], error: Option<u8>) {
        let mut status = vec![0u8; self.status_len()];
        if let Some(e) = error {
            status[0] = 1;
            status[1] = e;
        }

        let mut pkt = vec![0x01, op];
        pkt.extend(((data.len() + status.len()) as u16).to_le_bytes());
        pkt.extend(value.to_le_bytes());
        pkt.extend_from_slice(data);
        pkt.extend(status);

        self.tx.extend(slip::encode(&pkt));
    }

    fn send_raw(&mut self, data: &[u8]) {
        self.tx.extend(slip::encode(data));
    }

    fn erase(&mut self, offset: u32, size: u32) {
        let start = (offset as usize).min(self.flash.len());
        let end = (start + size as usize).min(self.flash.len());
        self.flash[start..end].fill(0xff);
    }

    fn write_reg(&mut self, address: u32, value: u32) {
        self.registers.insert(address, value);

        if address == self.spi.cmd() && value & SPI_CMD_USR != 0 {
            let usr2 = self.registers.get(&self.spi.usr2()).copied().unwrap_or(0);
            if usr2 & 0xff == 0x9f {
                self.registers.insert(self.spi.w0(), self.flash_id);
            }
            self.registers.insert(address, 0);
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        // Flash read acknowledgements
        if frame.len() == 4 {
            self.read_acks
                .push(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]));
            return;
        }
        if frame.len() < 8 || frame[0] != 0x00 {
            return;
        }

        let op = frame[1];
        let body = &frame[8..];
        let word = |i: usize| {
            u32::from_le_bytes([body[4 * i], body[4 * i + 1], body[4 * i + 2], body[4 * i + 3]])
        };

        match op {
            x if x == CommandType::Sync as u8 => {
                if self.silent_syncs > 0 {
                    self.silent_syncs -= 1;
                } else {
                    self.respond(op, 0, &[], None);
                }
            }
            x if x == CommandType::ReadReg as u8 => {
                let address = word(0);
                let value = if address == crate::chip::CHIP_DETECT_MAGIC_REG {
                    self.magic
                } else {
                    self.registers.get(&address).copied().unwrap_or(0)
                };
                self.respond(op, value, &[], None);
            }
            x if x == CommandType::WriteReg as u8 => {
                self.write_reg(word(0), word(1));
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::SpiAttach as u8 || x == CommandType::SpiSetParams as u8 => {
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::ChangeBaudrate as u8 => {
                self.requested_baud = Some((word(0), word(1)));
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::MemBegin as u8 => {
                self.mem_offset = word(3);
                self.ram.insert(self.mem_offset, Vec::new());
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::MemData as u8 => {
                let len = word(0) as usize;
                let data = body[16..16 + len].to_vec();
                self.ram.entry(self.mem_offset).or_default().extend(data);
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::MemEnd as u8 => {
                let entry = word(1);
                self.respond(op, 0, &[], None);
                if entry != 0 {
                    self.stub_running = true;
                    self.send_raw(b"OHAI");
                }
            }
            x if x == CommandType::FlashBegin as u8 => {
                let (size, block, offset) = (word(0), word(2), word(3));
                if !self.stub_running {
                    self.erase(offset, size.next_multiple_of(0x1000));
                }
                self.flash_begins.push((offset, block));
                self.write_offset = offset;
                self.write_block = block;
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::FlashData as u8 => {
                let (len, seq) = (word(0) as usize, word(1));
                let start = (self.write_offset + seq * self.write_block) as usize;
                self.flash[start..start + len].copy_from_slice(&body[16..16 + len]);
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::FlashEnd as u8 => self.respond(op, 0, &[], None),
            x if !self.stub_running => self.respond(x, 0, &[], Some(ROM_INVALID_MESSAGE)),
            x if x == CommandType::EraseFlash as u8 => {
                self.chip_erased = true;
                self.flash.fill(0xff);
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::EraseRegion as u8 => {
                self.region_erases.push((word(0), word(1)));
                self.erase(word(0), word(1));
                self.respond(op, 0, &[], None);
            }
            x if x == CommandType::ReadFlash as u8 => {
                let (offset, size, packet) = (word(0) as usize, word(1) as usize, word(2) as usize);
                self.respond(op, 0, &[], None);

                let data = self.flash[offset..offset + size].to_vec();
                for chunk in data.chunks(packet) {
                    self.send_raw(chunk);
                }
                self.send_raw(&[0u8; 16]);
            }
            x => self.respond(x, 0, &[], Some(ROM_INVALID_MESSAGE)),
        }
    }
}

impl io::Read for FakeEsp {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.tx.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Err(io::ErrorKind::TimedOut.into());
        }

        let n = buf.len().min(self.tx.len());
        for (dst, src) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *dst = src;
        }

        Ok(n)
    }
}

impl io::Write for FakeEsp {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.received.extend_from_slice(buf);

        for b in buf {
            if let Some(frame) = self.decoder.push(*b) {
                self.handle(&frame);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialTransport for FakeEsp {
    fn name(&self) -> Option<String> {
        Some("fake".to_string())
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.baud = baud;
        Ok(())
    }

    fn set_timeout(&mut self, _: Duration) -> io::Result<()> {
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, _: bool) -> io::Result<()> {
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> io::Result<()> {
        if level {
            self.resets += 1;
            self.stub_running = false;
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.tx.clear();
        Ok(())
    }
}
