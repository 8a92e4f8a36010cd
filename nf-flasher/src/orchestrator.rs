//! Sequencing of one flashing invocation across the platform drivers.
//!
//! ```text
//! Idle -> DeviceOpened -> [Backup] -> [Erase] -> Write -> [Verify] -> [Reset] -> Done
//!                                                                     \-> Failed
//! ```
//!
//! The firmware step runs before the deploy step. A failed step ends the invocation, so a failed
//! firmware update never leads to a deploy.

use std::fmt;

use nf_flasher_dfu::{Firmware, UsbIdentity};
use nf_flasher_esp32::DeviceInfo;
use nf_helper::{PartitionImage, PartitionMap};
use tracing::{debug, error, info};

use crate::{
    ExitCode, FlashError, FlashOutcome, FlashPlan, FlashingStatus, Warning,
    flasher::jtag::JtagTool, policy, session::DeviceSession,
};

/// The connected device, as far as its driver knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescription {
    Esp32(DeviceInfo),
    Dfu(UsbIdentity),
    Tool { tool: JtagTool, id: Option<String> },
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp32(info) => write!(
                f,
                "{} with {} MB flash",
                info.family,
                info.flash_size / (1024 * 1024)
            ),
            Self::Dfu(id) => write!(f, "DFU device {:04x}:{:04x}", id.vendor_id, id.product_id),
            Self::Tool { tool, id } => match id {
                Some(id) => write!(f, "{tool} adapter {id}"),
                None => write!(f, "{tool} adapter"),
            },
        }
    }
}

/// One connected device. All calls block.
pub trait PlatformDriver {
    fn device(&self) -> DeviceDescription;

    /// Policy warnings for writing `firmware` to this device.
    fn check(&self, _firmware: &Firmware) -> Vec<Warning> {
        Vec::new()
    }

    /// Address of the application region, for deploys without an explicit address.
    fn deployment_address(&self) -> Result<Option<u32>, FlashError> {
        Ok(None)
    }

    /// Read the whole flash.
    fn backup(&mut self) -> Result<Vec<u8>, FlashError>;

    /// Erase what `firmware` needs, or everything if `None`.
    fn erase(&mut self, firmware: Option<&Firmware>) -> Result<(), FlashError>;

    fn write(&mut self, firmware: &Firmware) -> Result<(), FlashError>;

    fn verify(&mut self, firmware: &Firmware) -> Result<(), FlashError>;

    /// Why [`PlatformDriver::verify`] cannot check anything on this device, if it cannot.
    fn verify_unsupported(&self) -> Option<Warning> {
        None
    }

    fn reset(&mut self) -> Result<(), FlashError>;
}

/// Finds and connects to the device a plan is for.
pub trait DeviceOpener {
    /// Key of the device `plan` resolves to, for the advisory lock. Called before
    /// [`DeviceOpener::open`], which must then open that same device.
    fn lock_key(&mut self, plan: &FlashPlan) -> Result<String, FlashError> {
        Ok(plan.interface.identity())
    }

    fn open(
        &mut self,
        plan: &FlashPlan,
        session: &DeviceSession,
    ) -> Result<Box<dyn PlatformDriver>, FlashError>;
}

/// Loaded images of a plan.
#[derive(Debug, Clone, Default)]
pub struct Images {
    pub firmware: Option<Firmware>,
    /// Application image and its address. `None` asks the driver.
    pub deploy: Option<(Option<u32>, PartitionImage)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    DeviceOpened,
    Backup,
    Erase,
    Write,
    Verify,
    Reset,
    Done,
    Failed,
}

/// Runs a [`FlashPlan`] against one device.
#[derive(Debug)]
pub struct Orchestrator<'a> {
    plan: &'a FlashPlan,
    stage: Stage,
    trail: Vec<Stage>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(plan: &'a FlashPlan) -> Self {
        Self {
            plan,
            stage: Stage::Idle,
            trail: vec![Stage::Idle],
        }
    }

    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far.
    pub fn trail(&self) -> &[Stage] {
        &self.trail
    }

    fn enter(&mut self, stage: Stage) {
        debug!("{:?} -> {stage:?}", self.stage);
        self.stage = stage;
        self.trail.push(stage);
    }

    pub fn run(
        &mut self,
        images: &Images,
        opener: &mut dyn DeviceOpener,
        session: &mut DeviceSession,
    ) -> Result<(), FlashError> {
        match self.run_stages(images, opener, session) {
            Ok(()) => {
                self.enter(Stage::Done);
                Ok(())
            }
            Err(e) => {
                error!("Failed in {:?}: {e}", self.stage);
                self.enter(Stage::Failed);
                Err(e)
            }
        }
    }

    fn run_stages(
        &mut self,
        images: &Images,
        opener: &mut dyn DeviceOpener,
        session: &mut DeviceSession,
    ) -> Result<(), FlashError> {
        session.check_cancel()?;
        session.status(FlashingStatus::Preparing);

        let mut driver = opener.open(self.plan, session)?;
        self.enter(Stage::DeviceOpened);

        let device = driver.device();
        info!("Connected to {device}");
        if let (Some(target), DeviceDescription::Esp32(info)) = (&self.plan.target, &device) {
            for w in policy::fit_check(target, info) {
                session.warn(w);
            }
        }

        if let Some(path) = &self.plan.backup {
            session.check_cancel()?;
            self.enter(Stage::Backup);

            let data = driver
                .backup()
                .map_err(|e| e.during(ExitCode::BackupFailure))?;
            std::fs::write(path, &data).map_err(|e| {
                FlashError::new(ExitCode::BackupFailure, path.display().to_string())
                    .with_diagnostic(e.to_string())
            })?;
            info!("Saved {} bytes to {}", data.len(), path.display());
        }

        if self.plan.mass_erase {
            session.check_cancel()?;
            self.enter(Stage::Erase);
            driver
                .erase(None)
                .map_err(|e| e.during(ExitCode::EraseFailure))?;
        }

        if let Some(firmware) = &images.firmware {
            info!("Flashing firmware");
            self.flash_step(driver.as_mut(), firmware, session)?;
        }

        if let Some((address, image)) = &images.deploy {
            let address = match address {
                Some(x) => *x,
                None => driver
                    .deployment_address()?
                    .ok_or_else(|| FlashError::missing("Deployment address"))?,
            };

            info!("Deploying {} at {address:#010x}", image.name());
            let mut map = PartitionMap::new();
            map.insert(address, image.clone());
            self.flash_step(driver.as_mut(), &Firmware::Raw(map), session)?;
        }

        if self.plan.reset {
            session.check_cancel()?;
            self.enter(Stage::Reset);
            session.status(FlashingStatus::Resetting);
            driver
                .reset()
                .map_err(|e| e.during(ExitCode::ResetFailure))?;
        }

        Ok(())
    }

    fn flash_step(
        &mut self,
        driver: &mut dyn PlatformDriver,
        firmware: &Firmware,
        session: &mut DeviceSession,
    ) -> Result<(), FlashError> {
        for w in driver.check(firmware) {
            session.warn(w);
        }

        if !self.plan.mass_erase {
            session.check_cancel()?;
            self.enter(Stage::Erase);
            driver
                .erase(Some(firmware))
                .map_err(|e| e.during(ExitCode::EraseFailure))?;
        }

        session.check_cancel()?;
        self.enter(Stage::Write);
        driver
            .write(firmware)
            .map_err(|e| e.during(ExitCode::WriteFailure))?;

        if self.plan.verify {
            session.check_cancel()?;
            match driver.verify_unsupported() {
                Some(w) => session.warn(w),
                None => {
                    self.enter(Stage::Verify);
                    driver
                        .verify(firmware)
                        .map_err(|e| e.during(ExitCode::VerifyFailure))?;
                }
            }
        }

        Ok(())
    }
}

/// Run `plan` with an open session. The session, and with it the device lock, is released
/// before returning.
pub fn run(
    plan: &FlashPlan,
    images: &Images,
    opener: &mut dyn DeviceOpener,
    mut session: DeviceSession,
) -> FlashOutcome {
    let res = Orchestrator::new(plan).run(images, opener, &mut session);
    let warnings = session.into_warnings();

    match res {
        Ok(()) => FlashOutcome::Success { warnings },
        Err(e) => FlashOutcome::Failed(e),
    }
}
