//! # Introduction
//!
//! This crate flashes nanoFramework firmware to microcontrollers. It decides which platform and
//! interface a request is for, loads the images and runs the backup, erase, write, verify and
//! reset steps through one of the platform drivers:
//!
//! - ESP32 family chips over their serial ROM loader ([`nf_flasher_esp32`]).
//! - STM32 devices in the ST DfuSe bootloader ([`nf_flasher_dfu`]).
//! - STM32, TI SimpleLink and Silicon Labs Gecko devices through the vendor JTAG tools.
//!
//! Every invocation ends with a [`FlashOutcome`], which carries a stable [`ExitCode`] on failure.
//!
//! # Usage
//!
//! ```no_run
//! use nf_flasher::{FirmwareFlasher, FlashRequest, Flasher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let request = FlashRequest {
//!         target: Some("ESP32_REV3".to_string()),
//!         serial_port: Some("/dev/ttyUSB0".to_string()),
//!         deploy_image: Some("/tmp/app.bin".into()),
//!         ..Default::default()
//!     };
//!
//!     let outcome = Flasher::new(&request).unwrap().flash(None).await;
//!     std::process::exit(outcome.exit_code().code());
//! }
//! ```
//!
//! # Features
//!
//! - `esp32`: Serial port access for ESP32 flashing. Enabled by **default**.
//! - `dfu`: libusb access for STM32 DFU flashing. Enabled by **default**.
//! - `jtag`: Running the external JTAG tools as child processes. Enabled by **default**.
//!
//! Without a feature, the matching interface fails with [`ExitCode::UnsupportedPlatform`].

mod common;
pub mod config;
mod error;
pub mod flasher;
pub mod orchestrator;
pub mod policy;
pub mod session;

pub use common::{FirmwareFlasher, FlasherTarget, Flasher, FlashingStatus};
pub use config::{FlashPlan, FlashRequest};
pub use error::{ExitCode, FailureKind, FlashError, FlashOutcome, Warning};
pub use flasher::HardwareOpener;
pub use policy::Platform;
