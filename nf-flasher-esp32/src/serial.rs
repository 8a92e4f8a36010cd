//! Byte stream to the bootloader.

use std::{
    io::{Read, Write},
    time::Duration,
};

/// What a [`crate::Connection`] needs from a serial port.
///
/// DTR and RTS are wired to the chip's IO0 and EN pins on most development boards, which is how
/// the chip is reset into the bootloader without user interaction.
pub trait SerialTransport: Read + Write {
    fn name(&self) -> Option<String>;

    fn set_baud_rate(&mut self, baud: u32) -> std::io::Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()>;

    fn write_data_terminal_ready(&mut self, level: bool) -> std::io::Result<()>;

    fn write_request_to_send(&mut self, level: bool) -> std::io::Result<()>;

    /// Drop everything received but not read yet.
    fn clear_input(&mut self) -> std::io::Result<()>;
}

impl<T: SerialTransport + ?Sized> SerialTransport for &mut T {
    fn name(&self) -> Option<String> {
        (**self).name()
    }

    fn set_baud_rate(&mut self, baud: u32) -> std::io::Result<()> {
        (**self).set_baud_rate(baud)
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        (**self).set_timeout(timeout)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> std::io::Result<()> {
        (**self).write_data_terminal_ready(level)
    }

    fn write_request_to_send(&mut self, level: bool) -> std::io::Result<()> {
        (**self).write_request_to_send(level)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        (**self).clear_input()
    }
}

#[cfg(feature = "serial")]
mod native {
    use std::time::Duration;

    use serialport::{ClearBuffer, SerialPort};

    use super::SerialTransport;

    impl SerialTransport for Box<dyn SerialPort> {
        fn name(&self) -> Option<String> {
            SerialPort::name(self.as_ref())
        }

        fn set_baud_rate(&mut self, baud: u32) -> std::io::Result<()> {
            SerialPort::set_baud_rate(self.as_mut(), baud).map_err(Into::into)
        }

        fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
            SerialPort::set_timeout(self.as_mut(), timeout).map_err(Into::into)
        }

        fn write_data_terminal_ready(&mut self, level: bool) -> std::io::Result<()> {
            SerialPort::write_data_terminal_ready(self.as_mut(), level).map_err(Into::into)
        }

        fn write_request_to_send(&mut self, level: bool) -> std::io::Result<()> {
            SerialPort::write_request_to_send(self.as_mut(), level).map_err(Into::into)
        }

        fn clear_input(&mut self) -> std::io::Result<()> {
            self.clear(ClearBuffer::Input).map_err(Into::into)
        }
    }
}

/// Open `port` for talking to the ROM loader.
#[cfg(feature = "serial")]
pub fn open(port: &str, baud: u32) -> crate::Result<Box<dyn serialport::SerialPort>> {
    serialport::new(port, baud)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(Into::into)
}

/// Returns all serial ports that could have an ESP32 attached. USB bridges only.
#[cfg(feature = "serial")]
pub fn ports() -> std::collections::HashSet<String> {
    let list = match serialport::available_ports() {
        Ok(x) => x,
        Err(e) => {
            tracing::warn!("Failed to list serial ports: {e}");
            return Default::default();
        }
    };

    list.into_iter()
        .filter(|x| matches!(x.port_type, serialport::SerialPortType::UsbPort(_)))
        .map(|x| x.port_name)
        .collect()
}
