//! STM32 devices in the ST DfuSe bootloader.

use nf_flasher_dfu::{DfuSession, DfuTransport, Firmware};
use tracing::info;

use crate::{
    FlashError, Warning,
    orchestrator::{DeviceDescription, PlatformDriver},
};

pub struct DfuDriver<T: DfuTransport> {
    session: DfuSession<T>,
}

impl<T: DfuTransport> DfuDriver<T> {
    pub const fn new(session: DfuSession<T>) -> Self {
        Self { session }
    }
}

impl<T: DfuTransport> PlatformDriver for DfuDriver<T> {
    fn device(&self) -> DeviceDescription {
        DeviceDescription::Dfu(self.session.identity())
    }

    fn check(&self, firmware: &Firmware) -> Vec<Warning> {
        match firmware {
            Firmware::Dfu(file) => self
                .session
                .check_identity(file)
                .map(|x| Warning::DeviceIdentity(x.to_string()))
                .into_iter()
                .collect(),
            Firmware::Raw(_) => Vec::new(),
        }
    }

    fn backup(&mut self) -> Result<Vec<u8>, FlashError> {
        Err(FlashError::incompatible("backup is only supported on ESP32"))
    }

    fn erase(&mut self, firmware: Option<&Firmware>) -> Result<(), FlashError> {
        let Some(firmware) = firmware else {
            return Ok(self.session.mass_erase()?);
        };

        let segments: Vec<_> = firmware
            .targets()
            .into_iter()
            .flat_map(|(_, segments)| segments)
            .collect();
        let count = self.session.erase_for(&segments)?;
        info!("Erased {count} sectors");

        Ok(())
    }

    fn write(&mut self, firmware: &Firmware) -> Result<(), FlashError> {
        for (alt, segments) in firmware.targets() {
            self.session.program(alt, &segments)?;
        }
        Ok(())
    }

    fn verify(&mut self, firmware: &Firmware) -> Result<(), FlashError> {
        for (alt, segments) in firmware.targets() {
            self.session.verify(alt, &segments)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), FlashError> {
        Ok(self.session.leave()?)
    }
}

#[cfg(feature = "dfu")]
mod hardware {
    use std::{borrow::Cow, collections::HashSet};

    use nf_flasher_dfu::{DfuOptions, DfuSession, usb};
    use tracing::debug;

    use super::DfuDriver;
    use crate::{
        ExitCode, FlashError, FlashPlan, FlasherTarget, orchestrator::PlatformDriver,
        session::DeviceSession,
    };

    /// A USB device exposing a DFU interface.
    #[derive(Debug, Clone, Hash, PartialEq, Eq)]
    pub struct Target(usb::Device);

    impl Target {
        pub fn name(&self) -> &str {
            &self.0.name
        }
    }

    impl FlasherTarget for Target {
        const FILE_TYPES: &[&str] = &["dfu", "hex", "bin"];

        async fn destinations() -> HashSet<Self> {
            tokio::task::spawn_blocking(usb::devices)
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
            match &self.0.serial {
                Some(x) => Cow::Borrowed(x),
                None => Cow::Owned(self.0.identity()),
            }
        }
    }

    /// Pick the device `id` names, by serial number or USB location. Without an id there must be
    /// exactly one device.
    pub(crate) fn select(
        devices: impl IntoIterator<Item = usb::Device>,
        id: Option<&str>,
    ) -> Result<usb::Device, FlashError> {
        let mut found: Vec<_> = devices
            .into_iter()
            .filter(|d| match id {
                Some(id) => d.serial.as_deref() == Some(id) || d.identity() == id,
                None => true,
            })
            .collect();

        match (found.len(), id) {
            (0, Some(id)) => Err(FlashError::new(
                ExitCode::NoDeviceFound,
                format!("no DFU device with id {id}"),
            )),
            (0, None) => Err(FlashError::new(ExitCode::NoDeviceFound, "no DFU device")),
            (1, _) => Ok(found.remove(0)),
            (n, _) => Err(FlashError::incompatible(format!(
                "{n} DFU devices connected, pick one with its id"
            ))),
        }
    }

    /// The connected device `id` names.
    pub(crate) fn find(id: Option<&str>) -> Result<usb::Device, FlashError> {
        select(usb::devices(), id)
    }

    pub(crate) fn open(
        plan: &FlashPlan,
        device: usb::Device,
        session: &DeviceSession,
    ) -> Result<Box<dyn PlatformDriver>, FlashError> {
        debug!("Opening {}", device.name);

        let options = DfuOptions {
            poll_timeout: plan.poll_timeout,
            ..Default::default()
        };
        let transport = usb::open(&device)?;
        let dfu = DfuSession::open(transport, options)?
            .with_progress(session.bridge())
            .with_cancel(session.cancel_token());

        Ok(Box::new(DfuDriver::new(dfu)))
    }

    #[cfg(test)]
    mod tests {
        use std::time::Duration;

        use nf_flasher_dfu::usb::Device;

        use super::select;
        use crate::{ExitCode, session::DeviceSession};

        fn device(port_num: u8, serial: Option<&str>) -> Device {
            Device {
                bus_num: 1,
                port_num,
                vendor_id: 0x0483,
                product_id: 0xdf11,
                name: "STMicroelectronics, STM32  BOOTLOADER".to_string(),
                serial: serial.map(str::to_string),
            }
        }

        #[test]
        fn single_device_without_id() {
            let dev = select([device(1, None)], None).unwrap();
            assert_eq!(dev.port_num, 1);
        }

        #[test]
        fn by_serial_or_location() {
            let devices = [device(1, Some("205F3382")), device(2, Some("3677385E"))];

            let dev = select(devices.clone(), Some("3677385E")).unwrap();
            assert_eq!(dev.port_num, 2);

            let dev = select(devices, Some("usb-0483-df11-1-1")).unwrap();
            assert_eq!(dev.serial.as_deref(), Some("205F3382"));
        }

        #[test]
        fn any_device_and_serial_share_one_lock() {
            let devices = [device(4, Some("SN123"))];
            let any = select(devices.clone(), None).unwrap().identity();
            let by_serial = select(devices, Some("SN123")).unwrap().identity();
            assert_eq!(any, by_serial);

            let dir = tempfile::tempdir().unwrap();
            let _first =
                DeviceSession::open_in(dir.path(), &any, Duration::ZERO, None, None).unwrap();
            let err = DeviceSession::open_in(
                dir.path(),
                &by_serial,
                Duration::from_millis(200),
                None,
                None,
            )
            .unwrap_err();
            assert_eq!(err.code(), ExitCode::DeviceBusy);
        }

        #[test]
        fn none_or_ambiguous() {
            let err = select(Vec::<Device>::new(), None).unwrap_err();
            assert_eq!(err.code(), ExitCode::NoDeviceFound);

            let err = select([device(1, None)], Some("205F3382")).unwrap_err();
            assert_eq!(err.code(), ExitCode::NoDeviceFound);

            let err = select([device(1, None), device(2, None)], None).unwrap_err();
            assert_eq!(err.code(), ExitCode::IncompatibleArguments);
        }
    }
}

#[cfg(feature = "dfu")]
pub use hardware::Target;
#[cfg(feature = "dfu")]
pub(crate) use hardware::{find, open};
