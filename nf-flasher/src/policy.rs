//! Checks applied before and around flashing: address parsing, platform inference and the
//! target fit check.

use std::{fmt, path::PathBuf};

use nf_flasher_esp32::{ChipFamily, DeviceInfo};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ExitCode, FlashError, Warning};

/// Device families with a flashing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Serial ROM loader and stub.
    Esp32,
    /// USB DFU or JTAG.
    Stm32,
    /// TI SimpleLink, through Uniflash.
    TiSimpleLink,
    /// Silicon Labs Gecko, through J-Link.
    SiliconLabsGecko,
}

impl Platform {
    pub const fn supports_dfu(self) -> bool {
        matches!(self, Self::Stm32)
    }

    pub const fn supports_jtag(self) -> bool {
        !matches!(self, Self::Esp32)
    }

    pub const fn supports_serial(self) -> bool {
        matches!(self, Self::Esp32)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Esp32 => "ESP32",
            Self::Stm32 => "STM32",
            Self::TiSimpleLink => "TI SimpleLink",
            Self::SiliconLabsGecko => "Silicon Labs Gecko",
        };
        f.write_str(name)
    }
}

/// Target name prefixes and the platform they belong to. Longest match wins.
const TARGET_PREFIXES: &[(&str, Platform)] = &[
    ("ESP32", Platform::Esp32),
    ("ESP_", Platform::Esp32),
    ("M5", Platform::Esp32),
    ("FEATHER_S2", Platform::Esp32),
    ("KALUGA", Platform::Esp32),
    ("XIAO_ESP32", Platform::Esp32),
    ("ST_", Platform::Stm32),
    ("MBN_QUAIL", Platform::Stm32),
    ("NETDUINO3", Platform::Stm32),
    ("GHI_", Platform::Stm32),
    ("ORGPAL_", Platform::Stm32),
    ("IngenuityMicro", Platform::Stm32),
    ("WeAct_", Platform::Stm32),
    ("TI_", Platform::TiSimpleLink),
    ("SL_", Platform::SiliconLabsGecko),
];

/// Platform encoded in a target name, if the name follows a known naming scheme.
pub fn platform_from_target(target: &str) -> Option<Platform> {
    TARGET_PREFIXES
        .iter()
        .filter(|(prefix, _)| {
            target
                .get(..prefix.len())
                .is_some_and(|x| x.eq_ignore_ascii_case(prefix))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, p)| *p)
}

/// Interface options given by the caller, as far as platform inference is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceHints {
    pub serial_port: bool,
    pub dfu: bool,
    pub jtag: bool,
    /// DFU file, hex or bin files given.
    pub mcu_images: bool,
}

/// Decide the platform. An explicit platform wins over inference. Contradictory interface
/// requests are rejected instead of picking one.
pub fn resolve_platform(
    explicit: Option<Platform>,
    target: Option<&str>,
    hints: InterfaceHints,
) -> Result<Platform, FlashError> {
    if hints.dfu && hints.jtag {
        return Err(FlashError::incompatible(
            "DFU and JTAG interfaces cannot both be requested",
        ));
    }
    if hints.serial_port && (hints.dfu || hints.jtag) {
        return Err(FlashError::incompatible(
            "a serial port cannot be combined with a DFU or JTAG interface",
        ));
    }

    let from_target = target.and_then(platform_from_target);
    let platform = explicit
        .or(from_target)
        .or_else(|| {
            if hints.serial_port {
                Some(Platform::Esp32)
            } else if hints.dfu || hints.jtag || hints.mcu_images {
                Some(Platform::Stm32)
            } else {
                None
            }
        })
        .ok_or_else(|| FlashError::missing("Platform, target name or interface option"))?;

    if let (Some(explicit), Some(named)) = (explicit, from_target)
        && explicit != named
    {
        warn!("Target name suggests {named}, using {explicit} as requested");
    }

    if hints.dfu && !platform.supports_dfu() {
        return Err(FlashError::incompatible(format!(
            "{platform} cannot be flashed over DFU"
        )));
    }
    if hints.jtag && !platform.supports_jtag() {
        return Err(FlashError::incompatible(format!(
            "{platform} cannot be flashed over JTAG"
        )));
    }
    if hints.serial_port && !platform.supports_serial() {
        return Err(FlashError::incompatible(format!(
            "{platform} cannot be flashed over a serial port"
        )));
    }

    Ok(platform)
}

/// Parse a flash address. The `0x` prefix is mandatory.
pub fn parse_address(text: &str) -> Result<u32, FlashError> {
    let invalid = || FlashError::new(ExitCode::InvalidAddress, text);
    let digits = text
        .trim()
        .strip_prefix("0x")
        .or_else(|| text.trim().strip_prefix("0X"))
        .ok_or_else(invalid)?;

    // from_str_radix alone would also take a sign
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    u32::from_str_radix(digits, 16).map_err(|e| invalid().with_diagnostic(e.to_string()))
}

/// Pair each binary file with its address. Both lists must have the same length.
pub fn pair_addresses(
    files: &[PathBuf],
    addresses: &[String],
) -> Result<Vec<(u32, PathBuf)>, FlashError> {
    if files.len() != addresses.len() {
        return Err(FlashError::new(
            ExitCode::AddressCountMismatch,
            format!("{} files, {} addresses", files.len(), addresses.len()),
        ));
    }

    files
        .iter()
        .zip(addresses)
        .map(|(f, a)| Ok((parse_address(a)?, f.clone())))
        .collect()
}

/// Chip family a target name implies, if any.
fn family_from_target(target: &str) -> Option<ChipFamily> {
    let t = target.to_ascii_uppercase();

    if t.contains("ESP32_S3") || t.contains("ESP32S3") {
        Some(ChipFamily::Esp32S3)
    } else if t.contains("ESP32_S2")
        || t.contains("ESP32S2")
        || t.starts_with("FEATHER_S2")
        || t.starts_with("KALUGA")
    {
        Some(ChipFamily::Esp32S2)
    } else if t.contains("ESP32_C3") || t.contains("ESP32C3") {
        Some(ChipFamily::Esp32C3)
    } else if t.contains("ESP32_C6") || t.contains("ESP32C6") {
        Some(ChipFamily::Esp32C6)
    } else if t.starts_with("ESP32") || t.starts_with("ESP_") || t.starts_with("M5") {
        Some(ChipFamily::Esp32)
    } else {
        None
    }
}

/// Compare the assumptions a target name encodes against the connected chip.
///
/// Best effort only. Findings are warnings and never stop flashing.
pub fn fit_check(target: &str, info: &DeviceInfo) -> Vec<Warning> {
    let mut warnings = Vec::new();
    let t = target.to_ascii_uppercase();

    if let Some(family) = family_from_target(target)
        && family != info.family
    {
        warnings.push(Warning::FitCheck(format!(
            "{target} is built for {family} but the device is {}",
            info.family
        )));
    }

    if info.family == ChipFamily::Esp32
        && let Some(revision) = info.revision
    {
        if t.contains("REV3") && revision < 3 {
            warnings.push(Warning::FitCheck(format!(
                "{target} needs silicon revision 3 or later, device is revision {revision}"
            )));
        }
        if t.contains("REV0") && revision >= 3 {
            warnings.push(Warning::FitCheck(format!(
                "{target} is meant for older silicon, a REV3 target fits revision {revision} better"
            )));
        }
    }

    if t.contains("BLE") && !(info.features.ble || info.features.bluetooth) {
        warnings.push(Warning::FitCheck(format!(
            "{target} uses Bluetooth but the device has none"
        )));
    }

    if t.contains("WIFI") && !info.features.wifi {
        warnings.push(Warning::FitCheck(format!(
            "{target} uses Wi-Fi but the device reports none"
        )));
    }

    warnings
}
