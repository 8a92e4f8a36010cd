//! Memory layout advertised by DfuSe devices in their alternate setting string descriptors.
//!
//! ```text
//! descriptor := '@' name region+
//! region     := '/' address '/' group (',' group)*
//! group      := count '*' size unit? kind
//! unit       := 'K' | 'M' | 'B' | ' '
//! kind       := 'a'..'g'
//! ```
//!
//! Example: `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`

use std::fmt;

/// Upper bound on the sectors of one descriptor. Real parts list a few hundred at most.
pub const MAX_SECTORS: u32 = 0x1_0000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid memory layout descriptor at offset {offset}: {reason}")]
pub struct SectorMapError {
    pub offset: usize,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    InternalFlash,
    OptionBytes,
    Otp,
    DeviceFeature,
    Other,
}

impl RegionKind {
    fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();

        if name.contains("option") {
            Self::OptionBytes
        } else if name.contains("otp") {
            Self::Otp
        } else if name.contains("feature") {
            Self::DeviceFeature
        } else if name.contains("flash") {
            Self::InternalFlash
        } else {
            Self::Other
        }
    }
}

/// Sector access bits, encoded by the descriptor as `'a' + bits - 1`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectorFlags(u8);

impl SectorFlags {
    pub const fn readable(self) -> bool {
        self.0 & 0b001 != 0
    }

    pub const fn erasable(self) -> bool {
        self.0 & 0b010 != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & 0b100 != 0
    }
}

impl fmt::Debug for SectorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            bit(self.readable(), 'r'),
            bit(self.erasable(), 'e'),
            bit(self.writable(), 'w')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorMapEntry {
    pub start_address: u32,
    pub sector_size: u32,
    /// Index of the sector within its memory (named descriptor).
    pub sector_index: u32,
    pub region_kind: RegionKind,
    pub name: String,
    pub flags: SectorFlags,
}

impl SectorMapEntry {
    pub fn end(&self) -> u64 {
        u64::from(self.start_address) + u64::from(self.sector_size)
    }

    /// Whether the sector shares at least one byte with `[start, end)`.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        u64::from(self.start_address) < end && start < self.end()
    }
}

/// Sectors of every memory a device exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorMap(Vec<SectorMapEntry>);

impl SectorMap {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Add the sectors described by one string descriptor.
    pub fn push_descriptor(&mut self, descriptor: &str) -> Result<(), SectorMapError> {
        self.0.extend(parse(descriptor)?);
        Ok(())
    }

    pub fn entries(&self) -> &[SectorMapEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sectors touched by `len` bytes starting at `address`, in ascending order.
    pub fn overlapping(&self, address: u32, len: usize) -> impl Iterator<Item = &SectorMapEntry> {
        let start = u64::from(address);
        let end = start + len as u64;
        self.0.iter().filter(move |s| s.intersects(start, end))
    }

    /// Whether every byte of the range lies in some sector.
    pub fn covers(&self, address: u32, len: usize) -> bool {
        let mut sectors: Vec<_> = self.overlapping(address, len).collect();
        sectors.sort_by_key(|s| s.start_address);

        let end = u64::from(address) + len as u64;
        let mut next = u64::from(address);
        for s in sectors {
            if u64::from(s.start_address) > next {
                return false;
            }
            next = next.max(s.end());
        }

        next >= end
    }
}

/// Parse a single descriptor into sector entries.
pub fn parse(descriptor: &str) -> Result<Vec<SectorMapEntry>, SectorMapError> {
    Parser {
        input: descriptor.as_bytes(),
        pos: 0,
    }
    .descriptor()
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn descriptor(&mut self) -> Result<Vec<SectorMapEntry>, SectorMapError> {
        self.literal(b'@', "expected '@'")?;

        let name_start = self.pos;
        while self.peek().is_some_and(|c| c != b'/') {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.input[name_start..self.pos])
            .trim()
            .to_string();
        if name.is_empty() {
            return Err(self.error("empty memory name"));
        }

        let region_kind = RegionKind::from_name(&name);
        let mut entries = Vec::new();
        let mut sector_index = 0;

        loop {
            self.region(&name, region_kind, &mut sector_index, &mut entries)?;
            if self.peek().is_none() {
                break;
            }
        }

        Ok(entries)
    }

    fn region(
        &mut self,
        name: &str,
        region_kind: RegionKind,
        sector_index: &mut u32,
        entries: &mut Vec<SectorMapEntry>,
    ) -> Result<(), SectorMapError> {
        self.literal(b'/', "expected '/' before address")?;
        let mut address = u64::from(self.address()?);
        self.literal(b'/', "expected '/' after address")?;

        loop {
            let group_start = self.pos;
            let (count, size, flags) = self.group()?;

            let group_error = |reason| SectorMapError {
                offset: group_start,
                reason,
            };
            if u64::from(*sector_index) + u64::from(count) > u64::from(MAX_SECTORS) {
                return Err(group_error("too many sectors"));
            }
            if address + u64::from(count) * u64::from(size) > u64::from(u32::MAX) + 1 {
                return Err(group_error("region extends past the 32-bit address space"));
            }

            for _ in 0..count {
                let start_address = u32::try_from(address)
                    .map_err(|_| group_error("region extends past the 32-bit address space"))?;
                entries.push(SectorMapEntry {
                    start_address,
                    sector_size: size,
                    sector_index: *sector_index,
                    region_kind,
                    name: name.to_string(),
                    flags,
                });
                address += u64::from(size);
                *sector_index += 1;
            }

            if self.peek() == Some(b',') {
                self.pos += 1;
            } else {
                return Ok(());
            }
        }
    }

    fn group(&mut self) -> Result<(u32, u32, SectorFlags), SectorMapError> {
        let count = self.decimal("expected sector count")?;
        self.literal(b'*', "expected '*' after sector count")?;
        let size = self.decimal("expected sector size")?;

        let multiplier = match self.peek() {
            Some(b'K') => 1024,
            Some(b'M') => 1024 * 1024,
            Some(b'B' | b' ') => 1,
            _ => 0,
        };
        let multiplier = if multiplier == 0 {
            1
        } else {
            self.pos += 1;
            multiplier
        };

        let size = size
            .checked_mul(multiplier)
            .filter(|x| *x != 0)
            .ok_or_else(|| self.error("invalid sector size"))?;

        let flags = match self.peek() {
            Some(c @ b'a'..=b'g') => {
                self.pos += 1;
                SectorFlags(c - b'a' + 1)
            }
            _ => return Err(self.error("expected sector type 'a'..'g'")),
        };

        Ok((count, size, flags))
    }

    fn address(&mut self) -> Result<u32, SectorMapError> {
        if !(self.input[self.pos..].starts_with(b"0x") || self.input[self.pos..].starts_with(b"0X"))
        {
            return Err(self.error("expected hexadecimal address"));
        }
        self.pos += 2;

        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
            self.pos += 1;
        }

        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|x| u32::from_str_radix(x, 16).ok())
            .ok_or(SectorMapError {
                offset: start,
                reason: "invalid address",
            })
    }

    fn decimal(&mut self, reason: &'static str) -> Result<u32, SectorMapError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }

        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|x| x.parse().ok())
            .ok_or(SectorMapError {
                offset: start,
                reason,
            })
    }

    fn literal(&mut self, c: u8, reason: &'static str) -> Result<(), SectorMapError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(reason))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    const fn error(&self, reason: &'static str) -> SectorMapError {
        SectorMapError {
            offset: self.pos,
            reason,
        }
    }
}
