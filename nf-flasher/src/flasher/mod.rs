//! Platform drivers, and the opener that connects the hardware a plan names.

pub mod dfu;
pub mod esp32;
pub mod jtag;

use nf_flasher_esp32::StubImage;

use crate::{
    FlashError, FlashPlan,
    config::Interface,
    orchestrator::{DeviceOpener, PlatformDriver},
    session::DeviceSession,
};

/// Opens real devices. Interfaces whose feature is disabled fail with
/// [`crate::ExitCode::UnsupportedPlatform`].
#[derive(Debug, Clone, Default)]
pub struct HardwareOpener {
    stub: Option<StubImage>,
    /// DFU device picked for the lock key.
    #[cfg(feature = "dfu")]
    dfu: Option<nf_flasher_dfu::usb::Device>,
}

impl HardwareOpener {
    pub const fn new(stub: Option<StubImage>) -> Self {
        Self {
            stub,
            #[cfg(feature = "dfu")]
            dfu: None,
        }
    }
}

#[allow(dead_code)]
fn disabled(feature: &str) -> FlashError {
    FlashError::new(
        crate::ExitCode::UnsupportedPlatform,
        format!("built without {feature} support"),
    )
}

impl DeviceOpener for HardwareOpener {
    fn lock_key(&mut self, plan: &FlashPlan) -> Result<String, FlashError> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "dfu")] {
                if let Interface::Dfu { id } = &plan.interface {
                    // Both "any DFU device" and a serial number lock the board they end up at
                    let device = dfu::find(id.as_deref())?;
                    let key = device.identity();
                    self.dfu = Some(device);
                    return Ok(key);
                }
            }
        }

        Ok(plan.interface.identity())
    }

    fn open(
        &mut self,
        plan: &FlashPlan,
        session: &DeviceSession,
    ) -> Result<Box<dyn PlatformDriver>, FlashError> {
        match &plan.interface {
            Interface::Serial { .. } => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "esp32")] {
                        esp32::open(plan, self.stub.as_ref(), session)
                    } else {
                        Err(disabled("ESP32"))
                    }
                }
            }
            Interface::Dfu { id } => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "dfu")] {
                        let device = match self.dfu.take() {
                            Some(x) => x,
                            None => dfu::find(id.as_deref())?,
                        };
                        dfu::open(plan, device, session)
                    } else {
                        let _ = id;
                        Err(disabled("DFU"))
                    }
                }
            }
            Interface::Jtag { tool, id, tool_dir } => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "jtag")] {
                        let runner = jtag::ProcessRunner::new(tool_dir.clone());
                        let driver = jtag::JtagDriver::new(runner, *tool, id.clone(), plan.verify)
                            .with_progress(session.bridge())
                            .with_cancel(session.cancel_token());
                        Ok(Box::new(driver))
                    } else {
                        let _ = (tool, id, tool_dir);
                        Err(disabled("JTAG"))
                    }
                }
            }
        }
    }
}
