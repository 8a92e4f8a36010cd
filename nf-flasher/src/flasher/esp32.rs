//! ESP32 family chips through the serial ROM loader and flasher stub.

use nf_flasher_dfu::Firmware;
use nf_flasher_esp32::{Esp32, FlashSize, serial::SerialTransport};
use nf_helper::PartitionMap;
use tracing::{debug, info, warn};

use crate::{
    ExitCode, FlashError, Warning,
    orchestrator::{DeviceDescription, PlatformDriver},
};

pub struct Esp32Driver<P: SerialTransport> {
    esp: Esp32<P>,
    partition_size: Option<FlashSize>,
}

fn partitions(firmware: &Firmware) -> Result<&PartitionMap, FlashError> {
    match firmware {
        Firmware::Raw(map) => Ok(map),
        Firmware::Dfu(_) => Err(FlashError::incompatible(
            "DFU files cannot be flashed to ESP32",
        )),
    }
}

impl<P: SerialTransport> Esp32Driver<P> {
    pub const fn new(esp: Esp32<P>, partition_size: Option<FlashSize>) -> Self {
        Self {
            esp,
            partition_size,
        }
    }

    fn flash_size(&self) -> Result<FlashSize, FlashError> {
        let size = self
            .esp
            .flash_size(self.partition_size.map(FlashSize::megabytes))?;
        Ok(size)
    }
}

impl<P: SerialTransport> PlatformDriver for Esp32Driver<P> {
    fn device(&self) -> DeviceDescription {
        DeviceDescription::Esp32(self.esp.info().clone())
    }

    fn deployment_address(&self) -> Result<Option<u32>, FlashError> {
        let size = self.flash_size()?;
        Ok(Some(self.esp.layout(size).deployment))
    }

    fn backup(&mut self) -> Result<Vec<u8>, FlashError> {
        let size = self.esp.info().flash_size;
        Ok(self.esp.backup(0, size)?)
    }

    fn erase(&mut self, firmware: Option<&Firmware>) -> Result<(), FlashError> {
        let Some(firmware) = firmware else {
            return Ok(self.esp.erase_chip()?);
        };

        if !self.esp.is_bootstrapped() {
            debug!("ROM loader erases while writing");
            return Ok(());
        }

        for (address, image) in partitions(firmware)?.ascending() {
            if !image.is_empty() {
                self.esp.erase_region(address, image.len() as u32)?;
            }
        }

        Ok(())
    }

    fn write(&mut self, firmware: &Firmware) -> Result<(), FlashError> {
        let map = partitions(firmware)?;
        let size = self.flash_size()?;
        self.esp.layout(size).check(map, size)?;

        info!("Flashing for {size} flash");
        self.esp.write(map)?;

        Ok(())
    }

    fn verify(&mut self, firmware: &Firmware) -> Result<(), FlashError> {
        if let Some(w) = self.verify_unsupported() {
            warn!("{w}");
            return Ok(());
        }

        for (address, image) in partitions(firmware)?.ascending() {
            let data = self.esp.backup(address, image.len() as u32)?;

            if let Some(pos) = data.iter().zip(image.data()).position(|(a, b)| a != b) {
                return Err(FlashError::new(
                    ExitCode::VerifyFailure,
                    format!("{} differs at {:#010x}", image.name(), address as usize + pos),
                ));
            }
        }

        Ok(())
    }

    fn verify_unsupported(&self) -> Option<Warning> {
        (!self.esp.is_bootstrapped()).then(|| {
            Warning::VerifySkipped(
                "verification skipped, reading flash needs the flasher stub".to_string(),
            )
        })
    }

    fn reset(&mut self) -> Result<(), FlashError> {
        Ok(self.esp.reset()?)
    }
}

#[cfg(feature = "esp32")]
mod hardware {
    use std::{borrow::Cow, collections::HashSet};

    use nf_flasher_esp32::{ConnectOptions, Esp32, SessionOptions, StubImage, serial};

    use super::Esp32Driver;
    use crate::{
        FlashError, FlashPlan, FlasherTarget, config::Interface, orchestrator::PlatformDriver,
        session::DeviceSession,
    };

    /// A serial port an ESP32 may be attached to.
    #[derive(Debug, Clone, Hash, PartialEq, Eq)]
    pub struct Target(String);

    impl Target {
        pub fn path(&self) -> &str {
            &self.0
        }
    }

    impl FlasherTarget for Target {
        const FILE_TYPES: &[&str] = &["bin"];

        async fn destinations() -> HashSet<Self> {
            tokio::task::spawn_blocking(serial::ports)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(Self)
                .collect()
        }

        fn is_destination_selectable() -> bool {
            true
        }

        fn identifier<'a>(&'a self) -> Cow<'a, str> {
            Cow::Borrowed(&self.0)
        }
    }

    pub(crate) fn open(
        plan: &FlashPlan,
        stub: Option<&StubImage>,
        session: &DeviceSession,
    ) -> Result<Box<dyn PlatformDriver>, FlashError> {
        let Interface::Serial { port, baud } = &plan.interface else {
            return Err(FlashError::incompatible("ESP32 needs a serial port"));
        };

        let options = SessionOptions {
            baud: *baud,
            flash_baud: plan.flash_baud,
            stub: stub.cloned(),
            connect: ConnectOptions {
                give_up_after: plan.connect_timeout,
                ..Default::default()
            },
            target: plan.target.clone(),
        };

        let port = serial::open(port, *baud)?;
        let esp = Esp32::open(port, &options, session.bridge(), session.cancel_token())?;

        Ok(Box::new(Esp32Driver::new(esp, plan.partition_size)))
    }
}

#[cfg(feature = "esp32")]
pub use hardware::Target;
#[cfg(feature = "esp32")]
pub(crate) use hardware::open;
