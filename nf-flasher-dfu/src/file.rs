//! DfuSe firmware container.
//!
//! Layout (little-endian):
//!
//! ```text
//! prefix  : "DfuSe" version:u8 image_size:u32 target_count:u8
//! target  : "Target" alt:u8 is_named:u32 name[255] target_size:u32 element_count:u32
//! element : address:u32 size:u32 data[size]
//! suffix  : device:u16 pid:u16 vid:u16 dfu_version:u16 "UFD" length:u8 crc:u32
//! ```

use crate::reader::ByteReader;

const PREFIX_SIGNATURE: &[u8] = b"DfuSe";
const PREFIX_LEN: usize = 11;
const FORMAT_VERSION: u8 = 1;

const TARGET_SIGNATURE: &[u8] = b"Target";
const TARGET_NAME_LEN: usize = 255;
const TARGET_PREFIX_LEN: usize = 274;
const ELEMENT_PREFIX_LEN: usize = 8;

const SUFFIX_SIGNATURE: &[u8] = b"UFD";
const SUFFIX_LEN: usize = 16;
const DFU_VERSION: u16 = 0x011A;

/// VID/PID value in the suffix that matches any device.
pub const ANY_ID: u16 = 0xFFFF;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid DFU file at offset {offset:#x}: {reason}")]
    FormatInvalid { offset: usize, reason: &'static str },
    #[error("DFU file checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuElement {
    pub address: u32,
    pub data: Vec<u8>,
}

impl DfuElement {
    pub fn new(address: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }

    /// Address one past the last byte of the element.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<DfuElement>,
}

impl DfuTarget {
    fn encoded_size(&self) -> usize {
        self.elements
            .iter()
            .map(|e| ELEMENT_PREFIX_LEN + e.data.len())
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuFile {
    pub targets: Vec<DfuTarget>,
    pub device_version: u16,
    pub product_id: u16,
    pub vendor_id: u16,
}

impl DfuFile {
    /// Parse and validate a complete container.
    ///
    /// Checks run suffix first, then CRC, then the body, so a flipped CRC byte is reported as
    /// [`ParseError::ChecksumMismatch`] and truncation as [`ParseError::FormatInvalid`].
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < PREFIX_LEN + SUFFIX_LEN {
            return Err(ParseError::FormatInvalid {
                offset: bytes.len(),
                reason: "file too short",
            });
        }

        let suffix_start = bytes.len() - SUFFIX_LEN;
        let mut suffix = ByteReader::new(&bytes[suffix_start..]);
        let device_version = suffix.u16("suffix device version")?;
        let product_id = suffix.u16("suffix product id")?;
        let vendor_id = suffix.u16("suffix vendor id")?;

        let at = |x: usize| suffix_start + x;
        if suffix.u16("suffix dfu version")? != DFU_VERSION {
            return Err(ParseError::FormatInvalid {
                offset: at(6),
                reason: "unsupported DFU specification version",
            });
        }
        suffix.expect(SUFFIX_SIGNATURE, "missing DFU suffix signature")?;
        if usize::from(suffix.u8("suffix length")?) != SUFFIX_LEN {
            return Err(ParseError::FormatInvalid {
                offset: at(11),
                reason: "unsupported DFU suffix length",
            });
        }

        let stored = suffix.u32("suffix crc")?;
        let computed = crc(&bytes[..bytes.len() - 4]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }

        let targets = parse_body(&bytes[..suffix_start])?;

        Ok(Self {
            targets,
            device_version,
            product_id,
            vendor_id,
        })
    }

    /// Serialize back into container bytes, computing image size and CRC.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = PREFIX_LEN
            + self
                .targets
                .iter()
                .map(|t| TARGET_PREFIX_LEN + t.encoded_size())
                .sum::<usize>();
        let mut buf = Vec::with_capacity(body_len + SUFFIX_LEN);

        buf.extend_from_slice(PREFIX_SIGNATURE);
        buf.push(FORMAT_VERSION);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.push(self.targets.len() as u8);

        for target in &self.targets {
            buf.extend_from_slice(TARGET_SIGNATURE);
            buf.push(target.alt_setting);

            let mut name = [0u8; TARGET_NAME_LEN];
            match &target.name {
                Some(x) => {
                    buf.extend_from_slice(&1u32.to_le_bytes());
                    // Keep the terminating NUL
                    let len = x.len().min(TARGET_NAME_LEN - 1);
                    name[..len].copy_from_slice(&x.as_bytes()[..len]);
                }
                None => buf.extend_from_slice(&0u32.to_le_bytes()),
            }
            buf.extend_from_slice(&name);

            buf.extend_from_slice(&(target.encoded_size() as u32).to_le_bytes());
            buf.extend_from_slice(&(target.elements.len() as u32).to_le_bytes());

            for element in &target.elements {
                buf.extend_from_slice(&element.address.to_le_bytes());
                buf.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
                buf.extend_from_slice(&element.data);
            }
        }

        buf.extend_from_slice(&self.device_version.to_le_bytes());
        buf.extend_from_slice(&self.product_id.to_le_bytes());
        buf.extend_from_slice(&self.vendor_id.to_le_bytes());
        buf.extend_from_slice(&DFU_VERSION.to_le_bytes());
        buf.extend_from_slice(SUFFIX_SIGNATURE);
        buf.push(SUFFIX_LEN as u8);

        let crc = crc(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Check the suffix identity against a connected device. `0xFFFF` matches anything.
    pub const fn matches_device(&self, vendor_id: u16, product_id: u16) -> bool {
        (self.vendor_id == ANY_ID || self.vendor_id == vendor_id)
            && (self.product_id == ANY_ID || self.product_id == product_id)
    }

    pub fn total_size(&self) -> usize {
        self.targets
            .iter()
            .flat_map(|t| t.elements.iter())
            .map(|e| e.data.len())
            .sum()
    }
}

/// CRC as stored in the DFU suffix: the reflected CRC-32 register without the final inversion.
pub fn crc(data: &[u8]) -> u32 {
    !crc32fast::hash(data)
}

fn parse_body(body: &[u8]) -> Result<Vec<DfuTarget>, ParseError> {
    let mut r = ByteReader::new(body);

    r.expect(PREFIX_SIGNATURE, "missing DfuSe signature")?;
    if r.u8("format version")? != FORMAT_VERSION {
        return Err(ParseError::FormatInvalid {
            offset: 5,
            reason: "unsupported format version",
        });
    }
    if r.u32("image size")? as usize != body.len() {
        return Err(ParseError::FormatInvalid {
            offset: 6,
            reason: "image size does not match file length",
        });
    }

    let target_count = r.u8("target count")?;
    if target_count == 0 {
        return Err(ParseError::FormatInvalid {
            offset: 10,
            reason: "no targets",
        });
    }

    let targets = (0..target_count)
        .map(|_| parse_target(&mut r))
        .collect::<Result<Vec<_>, _>>()?;

    if r.remaining() != 0 {
        return Err(ParseError::FormatInvalid {
            offset: r.position(),
            reason: "trailing data after last target",
        });
    }

    Ok(targets)
}

fn parse_target(r: &mut ByteReader) -> Result<DfuTarget, ParseError> {
    let start = r.position();

    r.expect(TARGET_SIGNATURE, "missing target signature")?;
    let alt_setting = r.u8("target alternate setting")?;
    let is_named = r.u32("target name flag")? != 0;
    let raw_name = r.take(TARGET_NAME_LEN, "target name")?;
    let target_size = r.u32("target size")?;
    let element_count = r.u32("element count")?;

    if element_count == 0 {
        return Err(ParseError::FormatInvalid {
            offset: r.position() - 4,
            reason: "target has no elements",
        });
    }

    let name = is_named.then(|| {
        let len = raw_name.iter().position(|x| *x == 0).unwrap_or(raw_name.len());
        String::from_utf8_lossy(&raw_name[..len]).into_owned()
    });

    let elements_start = r.position();
    let elements = (0..element_count)
        .map(|_| parse_element(r))
        .collect::<Result<Vec<_>, _>>()?;

    let consumed = r.position() - elements_start;
    if consumed != target_size as usize {
        tracing::warn!(
            "Target at {start:#x} declares {target_size} bytes of elements, found {consumed}"
        );
    }

    Ok(DfuTarget {
        alt_setting,
        name,
        elements,
    })
}

fn parse_element(r: &mut ByteReader) -> Result<DfuElement, ParseError> {
    let address = r.u32("element address")?;
    let size_offset = r.position();
    let size = r.u32("element size")?;

    if size == 0 {
        return Err(ParseError::FormatInvalid {
            offset: size_offset,
            reason: "element is empty",
        });
    }

    let data = r.take(size as usize, "element data")?;

    Ok(DfuElement {
        address,
        data: data.to_vec(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{DfuElement, DfuFile, DfuTarget, ParseError, crc};

    pub(crate) fn sample() -> DfuFile {
        DfuFile {
            targets: vec![
                DfuTarget {
                    alt_setting: 0,
                    name: Some("ST...".to_string()),
                    elements: vec![
                        DfuElement::new(0x08000000, vec![0xde, 0xad, 0xbe, 0xef]),
                        DfuElement::new(0x08004000, (0..4100).map(|x| x as u8).collect::<Vec<_>>()),
                    ],
                },
                DfuTarget {
                    alt_setting: 1,
                    name: None,
                    elements: vec![DfuElement::new(0x1FFFC000, vec![0xaa; 16])],
                },
            ],
            device_version: 0x2200,
            product_id: 0xdf11,
            vendor_id: 0x0483,
        }
    }

    #[test]
    fn round_trip() {
        let file = sample();
        let bytes = file.to_bytes();

        let parsed = DfuFile::parse(&bytes).unwrap();
        assert_eq!(parsed, file);

        let stored = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        assert_eq!(crc(&parsed.to_bytes()[..bytes.len() - 4]), stored);
        assert_eq!(parsed.total_size(), 4 + 4100 + 16);
    }

    #[test]
    fn known_crc() {
        // Standard CRC-32 check value for "123456789" is 0xCBF43926
        assert_eq!(crc(b"123456789"), !0xCBF43926);
    }

    #[test]
    fn flipped_crc_byte_is_checksum_mismatch() {
        let bytes = sample().to_bytes();
        let len = bytes.len();

        for i in len - 4..len {
            let mut corrupt = bytes.clone();
            corrupt[i] ^= 0x01;
            assert!(matches!(
                DfuFile::parse(&corrupt),
                Err(ParseError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn truncation_is_format_invalid() {
        let bytes = sample().to_bytes();

        for len in [bytes.len() - 1, bytes.len() / 2, 20, 3, 0] {
            assert!(matches!(
                DfuFile::parse(&bytes[..len]),
                Err(ParseError::FormatInvalid { .. })
            ));
        }
    }

    #[test]
    fn corrupt_body_never_panics() {
        let bytes = sample().to_bytes();

        for i in 0..bytes.len() - 16 {
            let mut corrupt = bytes.clone();
            corrupt[i] = corrupt[i].wrapping_add(0x5a);
            // Patch the CRC so the body checks are exercised
            let len = corrupt.len();
            let crc = crc(&corrupt[..len - 4]);
            corrupt[len - 4..].copy_from_slice(&crc.to_le_bytes());

            let _ = DfuFile::parse(&corrupt);
        }
    }

    #[test]
    fn bad_version_and_signature() {
        let mut file = sample().to_bytes();
        file[5] = 2;
        let len = file.len();
        let crc = crc(&file[..len - 4]);
        file[len - 4..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            DfuFile::parse(&file),
            Err(ParseError::FormatInvalid {
                offset: 5,
                reason: "unsupported format version"
            })
        );

        let mut file = sample().to_bytes();
        let len = file.len();
        file[len - 8] = b'X';
        assert!(matches!(
            DfuFile::parse(&file),
            Err(ParseError::FormatInvalid { .. })
        ));
    }

    #[test]
    fn empty_element_is_rejected() {
        let two = DfuFile {
            targets: vec![
                DfuTarget {
                    alt_setting: 0,
                    name: None,
                    elements: vec![DfuElement::new(0x08000000, vec![1, 2, 3, 4])],
                },
                DfuTarget {
                    alt_setting: 0,
                    name: None,
                    elements: vec![DfuElement::new(0x08004000, vec![0x55; 4100])],
                },
            ],
            device_version: 0xffff,
            product_id: 0xdf11,
            vendor_id: 0x0483,
        };
        assert_eq!(DfuFile::parse(&two.to_bytes()).unwrap(), two);

        let mut three = two.clone();
        three.targets.push(DfuTarget {
            alt_setting: 0,
            name: None,
            elements: vec![DfuElement::new(0x08008000, vec![])],
        });

        let err = DfuFile::parse(&three.to_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ParseError::FormatInvalid {
                reason: "element is empty",
                ..
            }
        ));
    }

    #[test]
    fn target_without_elements_is_rejected() {
        let mut file = sample();
        file.targets[1].elements.clear();

        assert!(matches!(
            DfuFile::parse(&file.to_bytes()),
            Err(ParseError::FormatInvalid {
                reason: "target has no elements",
                ..
            })
        ));
    }

    #[test]
    fn device_identity() {
        let mut file = sample();
        assert!(file.matches_device(0x0483, 0xdf11));
        assert!(!file.matches_device(0x0483, 0xdf12));

        file.product_id = super::ANY_ID;
        assert!(file.matches_device(0x0483, 0xdf12));
    }
}
