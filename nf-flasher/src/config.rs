//! Flashing requests and their validation.
//!
//! A [`FlashRequest`] is everything an application collected from the user. [`FlashRequest::resolve`]
//! turns it into a [`FlashPlan`] or a configuration error, without touching any device.

use std::{path::PathBuf, time::Duration};

use nf_flasher_esp32::FlashSize;
use serde::{Deserialize, Serialize};

use crate::{
    ExitCode, FlashError,
    flasher::jtag::JtagTool,
    policy::{self, InterfaceHints, Platform},
};

/// One image of a firmware package and where it goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePartition {
    /// Hex address with `0x` prefix.
    pub address: String,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Stop waiting for a serial bootloader after this many seconds. Waits forever if unset.
    pub connect_secs: Option<u64>,
    /// Upper bound for one DFU wait-until-idle.
    pub poll_secs: Option<u64>,
    /// Wait for another session to release the device.
    pub lock_secs: Option<u64>,
}

/// Options for one flashing invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashRequest {
    /// Firmware target name, e.g. `ESP32_REV3` or `ST_STM32F769I_DISCOVERY`.
    pub target: Option<String>,
    /// Overrides the platform inferred from the target and the interface options.
    pub platform: Option<Platform>,

    pub serial_port: Option<String>,
    pub baud_rate: Option<u32>,
    /// Baud rate once the flasher stub runs.
    pub flash_baud: Option<u32>,
    /// Flasher stub image (JSON).
    pub stub: Option<PathBuf>,

    pub dfu: bool,
    pub dfu_id: Option<String>,
    pub jtag: bool,
    pub jtag_id: Option<String>,
    /// Directory holding the external JTAG tools. Uses `PATH` if unset.
    pub tool_dir: Option<PathBuf>,

    pub dfu_file: Option<PathBuf>,
    pub bin_files: Vec<PathBuf>,
    /// One address per binary file.
    pub addresses: Vec<String>,
    pub hex_files: Vec<PathBuf>,

    /// Flash a complete firmware package.
    pub update: bool,
    pub package: Vec<PackagePartition>,

    /// Flash a single application image.
    pub deploy_image: Option<PathBuf>,
    pub deploy_address: Option<String>,

    pub mass_erase: bool,
    /// Save the flash contents here before changing anything.
    pub backup: Option<PathBuf>,
    pub reset: bool,
    pub verify: bool,
    /// Flash size in MB, instead of the detected one.
    pub partition_size: Option<u32>,

    pub timeouts: Timeouts,
}

impl Default for FlashRequest {
    fn default() -> Self {
        Self {
            target: None,
            platform: None,
            serial_port: None,
            baud_rate: None,
            flash_baud: None,
            stub: None,
            dfu: false,
            dfu_id: None,
            jtag: false,
            jtag_id: None,
            tool_dir: None,
            dfu_file: None,
            bin_files: Vec::new(),
            addresses: Vec::new(),
            hex_files: Vec::new(),
            update: false,
            package: Vec::new(),
            deploy_image: None,
            deploy_address: None,
            mass_erase: false,
            backup: None,
            reset: true,
            verify: false,
            partition_size: None,
            timeouts: Timeouts::default(),
        }
    }
}

/// How the device is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interface {
    Serial {
        port: String,
        baud: u32,
    },
    Dfu {
        /// USB serial number. Any single DFU device if unset.
        id: Option<String>,
    },
    Jtag {
        tool: JtagTool,
        /// Adapter serial number.
        id: Option<String>,
        tool_dir: Option<PathBuf>,
    },
}

impl Interface {
    /// Key for the advisory device lock, as far as it can be told without enumerating devices.
    ///
    /// Serial ports are keyed by their canonical path, so aliases of one port share a key. The
    /// JTAG key is the adapter, whichever tool drives it.
    pub fn identity(&self) -> String {
        match self {
            Self::Serial { port, .. } => format!("serial-{}", canonical_port(port)),
            Self::Dfu { id } => format!("dfu-{}", id.as_deref().unwrap_or("any")),
            Self::Jtag { id, .. } => format!("jtag-{}", id.as_deref().unwrap_or("any")),
        }
    }
}

/// `/dev/serial/by-id/...` links resolve to the device node. Windows port names are case
/// insensitive and may carry the `\\.\` prefix.
pub(crate) fn canonical_port(port: &str) -> String {
    if cfg!(windows) {
        return port.trim_start_matches(r"\\.\").to_ascii_uppercase();
    }

    std::fs::canonicalize(port)
        .map(|x| x.display().to_string())
        .unwrap_or_else(|_| port.to_string())
}

/// Images of the firmware step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    DfuFile(PathBuf),
    Files {
        bins: Vec<(u32, PathBuf)>,
        hex: Vec<PathBuf>,
    },
}

/// Application image of the deploy step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploySource {
    /// `None` uses the deployment region of the connected device.
    pub address: Option<u32>,
    pub file: PathBuf,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashPlan {
    pub platform: Platform,
    pub interface: Interface,
    pub target: Option<String>,
    pub firmware: Option<FirmwareSource>,
    pub deploy: Option<DeploySource>,
    pub mass_erase: bool,
    pub backup: Option<PathBuf>,
    pub reset: bool,
    pub verify: bool,
    pub partition_size: Option<FlashSize>,
    pub stub: Option<PathBuf>,
    pub flash_baud: Option<u32>,
    pub connect_timeout: Option<Duration>,
    pub poll_timeout: Option<Duration>,
    pub lock_wait: Duration,
}

impl FlashRequest {
    pub fn from_json(text: &str) -> Result<Self, FlashError> {
        serde_json::from_str(text).map_err(|e| {
            FlashError::new(ExitCode::FileFormatInvalid, "flash request").with_diagnostic(e.to_string())
        })
    }

    fn hints(&self) -> InterfaceHints {
        InterfaceHints {
            serial_port: self.serial_port.is_some(),
            dfu: self.dfu || self.dfu_id.is_some(),
            jtag: self.jtag || self.jtag_id.is_some(),
            mcu_images: self.dfu_file.is_some()
                || !self.hex_files.is_empty()
                || !self.bin_files.is_empty(),
        }
    }

    fn firmware(&self, platform: Platform) -> Result<Option<FirmwareSource>, FlashError> {
        let mut bins = policy::pair_addresses(&self.bin_files, &self.addresses)?;

        if self.update {
            if self.package.is_empty() && self.dfu_file.is_none() {
                return Err(FlashError::missing("Firmware package"));
            }
            for p in &self.package {
                bins.push((policy::parse_address(&p.address)?, p.file.clone()));
            }
        }

        if let Some(dfu_file) = &self.dfu_file {
            if platform != Platform::Stm32 {
                return Err(FlashError::incompatible(format!(
                    "DFU files cannot be flashed to {platform}"
                )));
            }
            if !bins.is_empty() || !self.hex_files.is_empty() {
                return Err(FlashError::incompatible(
                    "a DFU file cannot be combined with bin or hex files",
                ));
            }
            return Ok(Some(FirmwareSource::DfuFile(dfu_file.clone())));
        }

        if platform == Platform::Esp32 && !self.hex_files.is_empty() {
            return Err(FlashError::incompatible("ESP32 only takes bin files"));
        }

        if bins.is_empty() && self.hex_files.is_empty() {
            Ok(None)
        } else {
            Ok(Some(FirmwareSource::Files {
                bins,
                hex: self.hex_files.clone(),
            }))
        }
    }

    fn deploy(&self, platform: Platform) -> Result<Option<DeploySource>, FlashError> {
        let Some(file) = &self.deploy_image else {
            if self.deploy_address.is_some() {
                return Err(FlashError::missing("Deployment image"));
            }
            return Ok(None);
        };

        let address = self
            .deploy_address
            .as_deref()
            .map(policy::parse_address)
            .transpose()?;

        if address.is_none() && platform != Platform::Esp32 {
            return Err(FlashError::missing("Deployment address"));
        }

        Ok(Some(DeploySource {
            address,
            file: file.clone(),
        }))
    }

    fn interface(&self, platform: Platform) -> Result<Interface, FlashError> {
        let hints = self.hints();

        let jtag = |tool| Interface::Jtag {
            tool,
            id: self.jtag_id.clone(),
            tool_dir: self.tool_dir.clone(),
        };

        match platform {
            Platform::Esp32 => {
                let port = self
                    .serial_port
                    .clone()
                    .ok_or_else(|| FlashError::missing("Serial port"))?;
                Ok(Interface::Serial {
                    port,
                    baud: self.baud_rate.unwrap_or(nf_flasher_esp32::DEFAULT_BAUD),
                })
            }
            Platform::Stm32 if hints.jtag => {
                if self.dfu_file.is_some() {
                    return Err(FlashError::incompatible(
                        "DFU files can only be flashed over DFU",
                    ));
                }
                Ok(jtag(JtagTool::StCubeProgrammer))
            }
            Platform::Stm32 if hints.dfu || self.dfu_file.is_some() => Ok(Interface::Dfu {
                id: self.dfu_id.clone(),
            }),
            Platform::Stm32 => Ok(jtag(JtagTool::StCubeProgrammer)),
            Platform::TiSimpleLink => Ok(jtag(JtagTool::Uniflash)),
            Platform::SiliconLabsGecko => Ok(jtag(JtagTool::JLink)),
        }
    }

    /// Validate everything that can be checked without a device.
    pub fn resolve(&self) -> Result<FlashPlan, FlashError> {
        let platform = policy::resolve_platform(self.platform, self.target.as_deref(), self.hints())?;

        let partition_size = match self.partition_size {
            Some(_) if platform != Platform::Esp32 => {
                return Err(FlashError::incompatible(format!(
                    "partition size only applies to ESP32, not {platform}"
                )));
            }
            Some(mb) => Some(FlashSize::from_mb(mb)?),
            None => None,
        };

        let interface = self.interface(platform)?;
        let firmware = self.firmware(platform)?;
        let deploy = self.deploy(platform)?;

        if platform == Platform::Esp32 && self.stub.is_none() {
            if self.mass_erase {
                return Err(FlashError::incompatible("mass erase needs the flasher stub"));
            }
            if self.backup.is_some() {
                return Err(FlashError::incompatible("backup needs the flasher stub"));
            }
        }
        if self.backup.is_some() && platform != Platform::Esp32 {
            return Err(FlashError::incompatible(format!(
                "backup is not supported on {platform}"
            )));
        }

        if firmware.is_none() && deploy.is_none() && !self.mass_erase && self.backup.is_none() {
            return Err(FlashError::missing("Firmware, deployment image, erase or backup"));
        }

        Ok(FlashPlan {
            platform,
            interface,
            target: self.target.clone(),
            firmware,
            deploy,
            mass_erase: self.mass_erase,
            backup: self.backup.clone(),
            reset: self.reset,
            verify: self.verify,
            partition_size,
            stub: self.stub.clone(),
            flash_baud: self.flash_baud,
            connect_timeout: self.timeouts.connect_secs.map(Duration::from_secs),
            poll_timeout: self
                .timeouts
                .poll_secs
                .map(Duration::from_secs)
                .or(nf_flasher_dfu::DfuOptions::default().poll_timeout),
            lock_wait: self
                .timeouts
                .lock_secs
                .map(Duration::from_secs)
                .unwrap_or(nf_helper::lock::DEFAULT_LOCK_WAIT),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use nf_flasher_esp32::FlashSize;

    use super::{DeploySource, FirmwareSource, FlashRequest, Interface, PackagePartition};
    use crate::{ExitCode, flasher::jtag::JtagTool, policy::Platform};

    fn esp32_update() -> FlashRequest {
        FlashRequest {
            target: Some("ESP32_REV3".to_string()),
            serial_port: Some("/dev/ttyUSB0".to_string()),
            update: true,
            package: vec![
                PackagePartition {
                    address: "0x1000".to_string(),
                    file: PathBuf::from("bootloader.bin"),
                },
                PackagePartition {
                    address: "0x8000".to_string(),
                    file: PathBuf::from("partitions_4mb.bin"),
                },
                PackagePartition {
                    address: "0x10000".to_string(),
                    file: PathBuf::from("nanoCLR.bin"),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn esp32_package() {
        let plan = esp32_update().resolve().unwrap();

        assert_eq!(plan.platform, Platform::Esp32);
        assert_eq!(
            plan.interface,
            Interface::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud: 115200
            }
        );
        assert!(plan.reset);
        let Some(FirmwareSource::Files { bins, hex }) = plan.firmware else {
            panic!("expected files");
        };
        assert_eq!(bins.len(), 3);
        assert_eq!(bins[1].0, 0x8000);
        assert!(hex.is_empty());
    }

    #[test]
    fn unsupported_partition_size() {
        let req = FlashRequest {
            partition_size: Some(32),
            ..esp32_update()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::UnsupportedFlashSize);

        let req = FlashRequest {
            partition_size: Some(8),
            ..esp32_update()
        };
        assert_eq!(req.resolve().unwrap().partition_size, Some(FlashSize::Mb8));
    }

    #[test]
    fn missing_pieces() {
        let req = FlashRequest {
            serial_port: None,
            ..esp32_update()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::MissingArgument);

        let req = FlashRequest {
            package: Vec::new(),
            ..esp32_update()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::MissingArgument);

        let req = FlashRequest {
            target: Some("ST_NUCLEO64_F091RC".to_string()),
            ..Default::default()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::MissingArgument);
    }

    #[test]
    fn stm32_deploy_needs_address() {
        let req = FlashRequest {
            target: Some("ST_STM32F769I_DISCOVERY".to_string()),
            deploy_image: Some(PathBuf::from("app.bin")),
            ..Default::default()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::MissingArgument);

        let req = FlashRequest {
            deploy_address: Some("0x080C0000".to_string()),
            ..req
        };
        let plan = req.resolve().unwrap();
        assert_eq!(
            plan.deploy,
            Some(DeploySource {
                address: Some(0x080c_0000),
                file: PathBuf::from("app.bin")
            })
        );
        assert!(matches!(
            plan.interface,
            Interface::Jtag {
                tool: JtagTool::StCubeProgrammer,
                ..
            }
        ));
    }

    #[test]
    fn dfu_file() {
        let req = FlashRequest {
            dfu_file: Some(PathBuf::from("nanoBooter.dfu")),
            ..Default::default()
        };
        let plan = req.resolve().unwrap();
        assert_eq!(plan.platform, Platform::Stm32);
        assert_eq!(plan.interface, Interface::Dfu { id: None });

        let req = FlashRequest {
            jtag: true,
            dfu_file: Some(PathBuf::from("nanoBooter.dfu")),
            ..Default::default()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::IncompatibleArguments);

        let req = FlashRequest {
            dfu_file: Some(PathBuf::from("nanoBooter.dfu")),
            hex_files: vec![PathBuf::from("nanoCLR.hex")],
            ..Default::default()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::IncompatibleArguments);
    }

    #[test]
    fn esp32_stub_only_operations() {
        let req = FlashRequest {
            mass_erase: true,
            ..esp32_update()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::IncompatibleArguments);

        let req = FlashRequest {
            stub: Some(PathBuf::from("stub.json")),
            ..req
        };
        assert!(req.resolve().unwrap().mass_erase);
    }

    #[test]
    fn bin_addresses_checked() {
        let req = FlashRequest {
            platform: Some(Platform::Stm32),
            dfu: true,
            bin_files: vec![PathBuf::from("a.bin"), PathBuf::from("b.bin")],
            addresses: vec!["0x08000000".to_string()],
            ..Default::default()
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::AddressCountMismatch);

        let req = FlashRequest {
            addresses: vec!["0x08000000".to_string(), "08004000".to_string()],
            ..req
        };
        assert_eq!(req.resolve().unwrap_err().code(), ExitCode::InvalidAddress);
    }

    #[test]
    fn bin_files_alone_mean_stm32() {
        let req = FlashRequest {
            bin_files: vec![PathBuf::from("nanoCLR.bin")],
            addresses: vec!["0x08000000".to_string()],
            ..Default::default()
        };

        let plan = req.resolve().unwrap();
        assert_eq!(plan.platform, Platform::Stm32);
        assert_eq!(
            plan.firmware,
            Some(FirmwareSource::Files {
                bins: vec![(0x0800_0000, PathBuf::from("nanoCLR.bin"))],
                hex: Vec::new(),
            })
        );
    }

    #[test]
    fn lock_key_ignores_jtag_tool() {
        let stm32 = Interface::Jtag {
            tool: JtagTool::StCubeProgrammer,
            id: Some("066DFF".to_string()),
            tool_dir: None,
        };
        let gecko = Interface::Jtag {
            tool: JtagTool::JLink,
            id: Some("066DFF".to_string()),
            tool_dir: Some(PathBuf::from("/opt/SEGGER")),
        };
        assert_eq!(stm32.identity(), gecko.identity());
    }

    #[cfg(unix)]
    #[test]
    fn serial_aliases_share_lock_key() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("ttyUSB0");
        std::fs::write(&node, "").unwrap();
        let link = dir.path().join("usb-Silicon_Labs_CP2102-if00-port0");
        std::os::unix::fs::symlink(&node, &link).unwrap();

        let port = |p: &std::path::Path| Interface::Serial {
            port: p.display().to_string(),
            baud: 115200,
        };
        assert_eq!(port(&node).identity(), port(&link).identity());

        // Ports that do not exist are keyed as given
        let missing = dir.path().join("missing");
        assert_eq!(port(&missing).identity(), format!("serial-{}", missing.display()));
    }

    #[test]
    fn from_json() {
        let req = FlashRequest::from_json(
            r#"{
                "target": "SL_STK3701A",
                "hex_files": ["nanoCLR.hex"],
                "reset": false,
                "timeouts": { "lock_secs": 1 }
            }"#,
        )
        .unwrap();
        assert!(!req.reset);

        let plan = req.resolve().unwrap();
        assert_eq!(plan.platform, Platform::SiliconLabsGecko);
        assert_eq!(plan.lock_wait.as_secs(), 1);
        assert!(matches!(
            plan.interface,
            Interface::Jtag {
                tool: JtagTool::JLink,
                ..
            }
        ));

        assert_eq!(
            FlashRequest::from_json("{ \"reset\": 3 }").unwrap_err().code(),
            ExitCode::FileFormatInvalid
        );
    }
}
