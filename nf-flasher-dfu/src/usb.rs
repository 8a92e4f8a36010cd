//! [`DfuTransport`] over libusb, and discovery of DFU devices.

use std::{collections::HashSet, time::Duration};

use nf_helper::retry::retry;
use rusb::{Direction, Recipient, RequestType, UsbContext};
use tracing::{debug, warn};

use crate::{
    DfuStatus, DfuTransport, Error, Result, UsbIdentity, helpers::is_dfu_device,
    transport::Request,
};

const TIMEOUT: Duration = Duration::from_secs(1);
const DELAY: Duration = Duration::from_secs(1);
const RETRY: usize = 10;

/// A DFU capable USB device.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Device {
    pub bus_num: u8,
    pub port_num: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
    pub serial: Option<String>,
}

impl Device {
    /// Stable key for locking this device.
    pub fn identity(&self) -> String {
        format!(
            "usb-{:04x}-{:04x}-{}-{}",
            self.vendor_id, self.product_id, self.bus_num, self.port_num
        )
    }
}

/// All connected devices with a DFU interface.
pub fn devices() -> HashSet<Device> {
    let list = match rusb::devices() {
        Ok(x) => x,
        Err(e) => {
            warn!("Failed to list USB devices: {e}");
            return HashSet::new();
        }
    };

    list.iter()
        .filter(is_dfu_device)
        .flat_map(|x| match (x.device_descriptor(), x.open()) {
            (Ok(desc), Ok(dev)) => {
                let name = format!(
                    "{}, {}",
                    dev.read_manufacturer_string_ascii(&desc)
                        .unwrap_or_default(),
                    dev.read_product_string_ascii(&desc).unwrap_or_default()
                );
                Some(Device {
                    bus_num: x.bus_number(),
                    port_num: x.port_number(),
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    name,
                    serial: dev.read_serial_number_string_ascii(&desc).ok(),
                })
            }
            _ => None,
        })
        .collect()
}

pub struct UsbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    interface: u8,
    identity: UsbIdentity,
}

impl UsbTransport {
    fn out_request(&self, request: Request, value: u16, data: &[u8]) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
        self.handle.write_control(
            request_type,
            request as u8,
            value,
            u16::from(self.interface),
            data,
            TIMEOUT,
        )?;

        Ok(())
    }

    fn in_request(&self, request: Request, value: u16, len: usize) -> Result<Vec<u8>> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface);
        let mut buf = vec![0u8; len];
        let count = self.handle.read_control(
            request_type,
            request as u8,
            value,
            u16::from(self.interface),
            &mut buf,
            TIMEOUT,
        )?;
        buf.truncate(count);

        Ok(buf)
    }
}

impl DfuTransport for UsbTransport {
    fn identity(&self) -> UsbIdentity {
        self.identity
    }

    fn alt_settings(&mut self) -> Result<Vec<(u8, String)>> {
        let langs = self.handle.read_languages(TIMEOUT)?;
        let lang = langs
            .first()
            .copied()
            .ok_or(Error::MalformedResponse("device has no string languages"))?;
        let config = self.handle.device().active_config_descriptor()?;

        let mut temp = Vec::new();
        for intf in config.interfaces() {
            for desc in intf.descriptors() {
                if desc.interface_number() != self.interface {
                    continue;
                }

                match self.handle.read_interface_string(lang, &desc, TIMEOUT) {
                    Ok(s) => temp.push((desc.setting_number(), s)),
                    Err(e) => debug!("No string for alt setting {}: {e}", desc.setting_number()),
                }
            }
        }

        Ok(temp)
    }

    fn select_configuration(&mut self, alt_setting: u8) -> Result<()> {
        self.handle
            .set_alternate_setting(self.interface, alt_setting)
            .map_err(Into::into)
    }

    fn download(&mut self, block: u16, data: &[u8]) -> Result<()> {
        self.out_request(Request::Download, block, data)
    }

    fn upload(&mut self, block: u16, len: usize) -> Result<Vec<u8>> {
        self.in_request(Request::Upload, block, len)
    }

    fn get_status(&mut self) -> Result<DfuStatus> {
        let buf = self.in_request(Request::GetStatus, 0, DfuStatus::LEN)?;
        DfuStatus::from_bytes(&buf)
    }

    fn clear_status(&mut self) -> Result<()> {
        self.out_request(Request::ClearStatus, 0, &[])
    }

    fn abort(&mut self) -> Result<()> {
        self.out_request(Request::Abort, 0, &[])
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.handle.release_interface(self.interface);
    }
}

/// `bcdDevice` back from the decoded version.
fn version_to_bcd(v: rusb::Version) -> u16 {
    let major = u16::from(v.major());
    ((major / 10) << 12) | ((major % 10) << 8) | (u16::from(v.minor()) << 4) | u16::from(v.sub_minor())
}

fn open_usb_dev(device: &Device) -> Result<rusb::DeviceHandle<rusb::Context>> {
    // Due to some sort of internal caching, creating a new context each time is the most reliable.
    let ctx = rusb::Context::new()?;

    for dev in ctx.devices()?.iter() {
        if dev.bus_number() != device.bus_num || dev.port_number() != device.port_num {
            continue;
        }

        let desc = dev.device_descriptor()?;
        if desc.vendor_id() == device.vendor_id && desc.product_id() == device.product_id {
            return dev.open().map_err(Into::into);
        }
    }

    Err(Error::DeviceNotFound)
}

fn open_dfu_dev(device: &Device) -> Result<UsbTransport> {
    let handle = open_usb_dev(device)?;
    let dev = handle.device();
    let desc = dev.device_descriptor()?;
    let config = dev.active_config_descriptor()?;

    let interface = config
        .interfaces()
        .flat_map(|x| x.descriptors())
        .find(|x| x.class_code() == 0xfe && x.sub_class_code() == 1)
        .map(|x| x.interface_number())
        .ok_or(Error::DeviceNotFound)?;

    // Not supported on every platform
    let _ = handle.set_auto_detach_kernel_driver(true);
    handle.claim_interface(interface)?;

    Ok(UsbTransport {
        handle,
        interface,
        identity: UsbIdentity {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            protocol_version: version_to_bcd(desc.device_version()),
        },
    })
}

/// Open a device for flashing. The device may still be re-enumerating after a reset into the
/// bootloader, so this retries for a while.
pub fn open(device: &Device) -> Result<UsbTransport> {
    retry(RETRY, DELAY, || open_dfu_dev(device))
}
