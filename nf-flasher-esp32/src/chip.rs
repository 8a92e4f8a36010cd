//! Chip detection, identity and SPI flash id.

use std::fmt;

use tracing::debug;

use crate::{Connection, Error, Result, serial::SerialTransport};

/// Register holding a per family magic value in every ROM.
pub const CHIP_DETECT_MAGIC_REG: u32 = 0x4000_1000;

const ESP32_EFUSE_BASE: u32 = 0x3ff5_a000;
const ESP32_APB_CTL_DATE: u32 = 0x3ff6_607c;

const SPI_USR_COMMAND: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_FLASH_RDID: u32 = 0x9f;
const SPI_CMD_POLLS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    Esp32,
    Esp32S2,
    Esp32S3,
    Esp32C3,
    Esp32C6,
}

/// SPI controller register addresses used to run a user command on the flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRegisters {
    pub base: u32,
    pub usr_offset: u32,
    pub usr1_offset: u32,
    pub usr2_offset: u32,
    pub mosi_dlen_offset: u32,
    pub miso_dlen_offset: u32,
    pub w0_offset: u32,
}

impl SpiRegisters {
    pub const fn cmd(&self) -> u32 {
        self.base
    }

    pub const fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub const fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub const fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub const fn mosi_dlen(&self) -> u32 {
        self.base + self.mosi_dlen_offset
    }

    pub const fn miso_dlen(&self) -> u32 {
        self.base + self.miso_dlen_offset
    }

    pub const fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }
}

const fn spi_registers(base: u32) -> SpiRegisters {
    SpiRegisters {
        base,
        usr_offset: 0x18,
        usr1_offset: 0x1c,
        usr2_offset: 0x20,
        mosi_dlen_offset: 0x24,
        miso_dlen_offset: 0x28,
        w0_offset: 0x58,
    }
}

impl ChipFamily {
    pub fn from_magic(magic: u32) -> Result<Self> {
        let family = match magic {
            0x00f0_1d83 => Self::Esp32,
            0x0000_07c6 => Self::Esp32S2,
            0x0000_0009 => Self::Esp32S3,
            0x6921_506f | 0x1b31_506f | 0x4881_606f | 0x4361_606f => Self::Esp32C3,
            0x2ce0_806f => Self::Esp32C6,
            _ => return Err(Error::UnknownChip(magic)),
        };

        Ok(family)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Esp32 => "ESP32",
            Self::Esp32S2 => "ESP32-S2",
            Self::Esp32S3 => "ESP32-S3",
            Self::Esp32C3 => "ESP32-C3",
            Self::Esp32C6 => "ESP32-C6",
        }
    }

    pub const fn spi_registers(self) -> SpiRegisters {
        match self {
            Self::Esp32 => SpiRegisters {
                base: 0x3ff4_2000,
                usr_offset: 0x1c,
                usr1_offset: 0x20,
                usr2_offset: 0x24,
                mosi_dlen_offset: 0x28,
                miso_dlen_offset: 0x2c,
                w0_offset: 0x80,
            },
            Self::Esp32S2 => spi_registers(0x3f40_2000),
            Self::Esp32S3 | Self::Esp32C3 => spi_registers(0x6000_2000),
            Self::Esp32C6 => spi_registers(0x6000_3000),
        }
    }

    /// Where the second stage bootloader lives in flash.
    pub const fn bootloader_address(self) -> u32 {
        match self {
            Self::Esp32 | Self::Esp32S2 => 0x1000,
            Self::Esp32S3 | Self::Esp32C3 | Self::Esp32C6 => 0x0,
        }
    }

    /// ROM loaders newer than the ESP32 take an extra word in FLASH_BEGIN.
    pub const fn rom_has_encrypted_flag(self) -> bool {
        !matches!(self, Self::Esp32)
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub wifi: bool,
    pub bluetooth: bool,
    pub ble: bool,
    pub dual_core: bool,
    pub embedded_flash: bool,
    pub embedded_psram: bool,
}

/// What is known about the connected chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub family: ChipFamily,
    /// Silicon revision. Only read on the ESP32.
    pub revision: Option<u8>,
    pub features: Features,
    /// Raw JEDEC id of the attached flash.
    pub flash_id: u32,
    /// Flash size in bytes from the JEDEC id.
    pub flash_size: u32,
}

impl DeviceInfo {
    pub fn flash_size_from_id(flash_id: u32) -> u32 {
        let code = (flash_id >> 16) & 0xff;
        1u32.checked_shl(code).unwrap_or(0)
    }
}

fn read_efuse<P: SerialTransport>(conn: &mut Connection<P>, word: u32) -> Result<u32> {
    conn.read_reg(ESP32_EFUSE_BASE + 4 * word)
}

fn esp32_revision<P: SerialTransport>(conn: &mut Connection<P>) -> Result<Option<u8>> {
    let word3 = read_efuse(conn, 3)?;
    let word5 = read_efuse(conn, 5)?;
    let apb_date = conn.read_reg(ESP32_APB_CTL_DATE)?;

    let rev0 = (word3 >> 15) & 1;
    let rev1 = (word5 >> 20) & 1;
    let rev2 = (apb_date >> 31) & 1;

    let rev = match rev0 | (rev1 << 1) | (rev2 << 2) {
        0 => Some(0),
        1 => Some(1),
        3 => Some(2),
        7 => Some(3),
        x => {
            debug!("Unexpected revision bits {x:#05b}");
            None
        }
    };

    Ok(rev)
}

fn esp32_features(word3: u32) -> Features {
    let pkg = ((word3 >> 9) & 0x7) | (((word3 >> 2) & 0x1) << 3);

    Features {
        wifi: true,
        bluetooth: word3 & (1 << 1) == 0,
        ble: word3 & (1 << 1) == 0,
        dual_core: word3 & 1 == 0,
        embedded_flash: matches!(pkg, 2 | 4 | 5 | 6),
        embedded_psram: matches!(pkg, 6 | 7),
    }
}

const fn family_features(family: ChipFamily) -> Features {
    match family {
        ChipFamily::Esp32S2 => Features {
            wifi: true,
            bluetooth: false,
            ble: false,
            dual_core: false,
            embedded_flash: false,
            embedded_psram: false,
        },
        ChipFamily::Esp32S3 => Features {
            wifi: true,
            bluetooth: false,
            ble: true,
            dual_core: true,
            embedded_flash: false,
            embedded_psram: false,
        },
        _ => Features {
            wifi: true,
            bluetooth: false,
            ble: true,
            dual_core: false,
            embedded_flash: false,
            embedded_psram: false,
        },
    }
}

/// Detect the chip family, revision and features.
pub fn detect<P: SerialTransport>(conn: &mut Connection<P>) -> Result<(ChipFamily, Option<u8>, Features)> {
    let magic = conn.read_reg(CHIP_DETECT_MAGIC_REG)?;
    let family = ChipFamily::from_magic(magic)?;

    if family == ChipFamily::Esp32 {
        let revision = esp32_revision(conn)?;
        let features = esp32_features(read_efuse(conn, 3)?);
        Ok((family, revision, features))
    } else {
        Ok((family, None, family_features(family)))
    }
}

/// Read the JEDEC id of the flash chip with a SPI user command.
pub fn flash_id<P: SerialTransport>(conn: &mut Connection<P>, family: ChipFamily) -> Result<u32> {
    let regs = family.spi_registers();

    let old_usr = conn.read_reg(regs.usr())?;
    let old_usr2 = conn.read_reg(regs.usr2())?;

    conn.write_reg(regs.mosi_dlen(), 0)?;
    // 24 bits of id
    conn.write_reg(regs.miso_dlen(), 24 - 1)?;
    conn.write_reg(regs.usr(), SPI_USR_COMMAND | SPI_USR_MISO)?;
    conn.write_reg(regs.usr2(), (7 << 28) | SPI_FLASH_RDID)?;
    conn.write_reg(regs.w0(), 0)?;
    conn.write_reg(regs.cmd(), SPI_CMD_USR)?;

    let mut done = false;
    for _ in 0..SPI_CMD_POLLS {
        if conn.read_reg(regs.cmd())? & SPI_CMD_USR == 0 {
            done = true;
            break;
        }
    }
    if !done {
        return Err(Error::InvalidResponse("SPI command did not complete"));
    }

    let id = conn.read_reg(regs.w0())? & 0x00ff_ffff;

    conn.write_reg(regs.usr(), old_usr)?;
    conn.write_reg(regs.usr2(), old_usr2)?;

    debug!("Flash id {id:#08x}");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::{ChipFamily, DeviceInfo, detect, esp32_features, flash_id};
    use crate::{
        Connection,
        fake::{FakeEsp, fast_connect},
    };

    #[test]
    fn magic_values() {
        assert_eq!(ChipFamily::from_magic(0x00f01d83).unwrap(), ChipFamily::Esp32);
        assert_eq!(ChipFamily::from_magic(0x1b31506f).unwrap(), ChipFamily::Esp32C3);
        assert_eq!(ChipFamily::from_magic(0x2ce0806f).unwrap(), ChipFamily::Esp32C6);
        assert!(ChipFamily::from_magic(0xdeadbeef).is_err());
    }

    #[test]
    fn esp32_feature_bits() {
        // Single core, no bluetooth, PICO-D4 package
        let word3 = 0b11 | (4 << 9);
        let features = esp32_features(word3);

        assert!(!features.dual_core);
        assert!(!features.bluetooth);
        assert!(features.embedded_flash);
        assert!(!features.embedded_psram);

        assert!(esp32_features(0).dual_core);
    }

    #[test]
    fn flash_size_code() {
        assert_eq!(DeviceInfo::flash_size_from_id(0x1640ef), 4 * 1024 * 1024);
        assert_eq!(DeviceInfo::flash_size_from_id(0x1840c8), 16 * 1024 * 1024);
    }

    #[test]
    fn detect_esp32_rev3() {
        let mut dev = FakeEsp::esp32();
        dev.set_revision3();

        let mut conn = Connection::new(&mut dev, 115200);
        conn.connect(&fast_connect(), None, None).unwrap();

        let (family, rev, features) = detect(&mut conn).unwrap();
        assert_eq!(family, ChipFamily::Esp32);
        assert_eq!(rev, Some(3));
        assert!(features.bluetooth);
        assert!(features.dual_core);

        assert_eq!(flash_id(&mut conn, family).unwrap(), 0x1640ef);
    }

    #[test]
    fn detect_c3() {
        let mut dev = FakeEsp::new(0x1b31506f, 2 * 1024 * 1024);

        let mut conn = Connection::new(&mut dev, 115200);
        conn.connect(&fast_connect(), None, None).unwrap();

        let (family, rev, features) = detect(&mut conn).unwrap();
        assert_eq!(family, ChipFamily::Esp32C3);
        assert_eq!(rev, None);
        assert!(features.ble);
        assert_eq!(
            DeviceInfo::flash_size_from_id(flash_id(&mut conn, family).unwrap()),
            2 * 1024 * 1024
        );
    }
}
