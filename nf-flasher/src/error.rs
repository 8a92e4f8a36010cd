//! Exit codes and the outcome of a flashing invocation.
//!
//! Every failure maps to one entry of [`ExitCode`]. The numbers are stable: applications return
//! them as process exit status.

use std::{fmt, io};

use serde::Serialize;

/// Closed set of outcomes exposed to applications.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExitCode {
    Ok = 0,

    MissingArgument = 10,
    IncompatibleArguments = 11,
    InvalidAddress = 12,
    AddressCountMismatch = 13,
    UnsupportedFlashSize = 14,
    UnsupportedPlatform = 15,

    NoDeviceFound = 20,
    DeviceConnectFailure = 21,
    DeviceBusy = 22,

    FileNotFound = 30,
    FileFormatInvalid = 31,
    ChecksumMismatch = 32,
    PartitionTableMismatch = 33,

    EraseFailure = 40,
    WriteFailure = 41,
    BackupFailure = 42,
    ProtocolFailure = 43,
    ResetFailure = 44,

    VerifyFailure = 50,

    Aborted = 60,
    Timeout = 61,
}

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    /// Bad, missing or contradictory arguments. Found before any device I/O.
    Configuration,
    Connection,
    FileFormat,
    Protocol,
    Verification,
    UserAbort,
}

impl ExitCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// `None` only for [`ExitCode::Ok`].
    pub const fn kind(self) -> Option<FailureKind> {
        match self {
            Self::Ok => None,
            Self::MissingArgument
            | Self::IncompatibleArguments
            | Self::InvalidAddress
            | Self::AddressCountMismatch
            | Self::UnsupportedFlashSize
            | Self::UnsupportedPlatform => Some(FailureKind::Configuration),
            Self::NoDeviceFound | Self::DeviceConnectFailure | Self::DeviceBusy | Self::Timeout => {
                Some(FailureKind::Connection)
            }
            Self::FileNotFound
            | Self::FileFormatInvalid
            | Self::ChecksumMismatch
            | Self::PartitionTableMismatch => Some(FailureKind::FileFormat),
            Self::EraseFailure
            | Self::WriteFailure
            | Self::BackupFailure
            | Self::ProtocolFailure
            | Self::ResetFailure => Some(FailureKind::Protocol),
            Self::VerifyFailure => Some(FailureKind::Verification),
            Self::Aborted => Some(FailureKind::UserAbort),
        }
    }

    /// Human readable message for the code.
    pub const fn template(self) -> &'static str {
        match self {
            Self::Ok => "Operation completed successfully",
            Self::MissingArgument => "A required argument is missing",
            Self::IncompatibleArguments => "Incompatible arguments",
            Self::InvalidAddress => "Invalid flash address",
            Self::AddressCountMismatch => "Number of addresses does not match the number of files",
            Self::UnsupportedFlashSize => "Unsupported flash size",
            Self::UnsupportedPlatform => "Unsupported platform",
            Self::NoDeviceFound => "No device found",
            Self::DeviceConnectFailure => "Failed to connect to the device",
            Self::DeviceBusy => "Device is in use by another session",
            Self::FileNotFound => "File not found",
            Self::FileFormatInvalid => "Invalid file format",
            Self::ChecksumMismatch => "File checksum mismatch",
            Self::PartitionTableMismatch => "Partition table does not match the flash size",
            Self::EraseFailure => "Erase failed",
            Self::WriteFailure => "Write failed",
            Self::BackupFailure => "Flash backup failed",
            Self::ProtocolFailure => "Device protocol error",
            Self::ResetFailure => "Failed to reset the device",
            Self::VerifyFailure => "Verification failed",
            Self::Aborted => "Aborted",
            Self::Timeout => "Timed out waiting for the device",
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (E{})", self.template(), self.code())
    }
}

fn diagnostic_suffix(diagnostic: &Option<String>) -> String {
    diagnostic
        .as_ref()
        .map(|d| format!(" [{d}]"))
        .unwrap_or_default()
}

/// A failed flashing step.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}{}", .code.template(), diagnostic_suffix(.diagnostic))]
pub struct FlashError {
    code: ExitCode,
    message: String,
    /// Raw text from the lowest layer that saw the failure.
    diagnostic: Option<String>,
}

impl FlashError {
    pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }

    pub const fn code(&self) -> ExitCode {
        self.code
    }

    pub fn kind(&self) -> FailureKind {
        // Ok is never stored in a FlashError
        self.code.kind().unwrap_or(FailureKind::Protocol)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub(crate) fn missing(what: &str) -> Self {
        Self::new(ExitCode::MissingArgument, format!("{what} is required"))
    }

    pub(crate) fn incompatible(message: impl Into<String>) -> Self {
        Self::new(ExitCode::IncompatibleArguments, message)
    }

    pub(crate) fn aborted() -> Self {
        Self::new(ExitCode::Aborted, "cancelled by the user")
    }

    /// Failure to read a firmware or stub file.
    pub(crate) fn file(path: &std::path::Path, e: io::Error) -> Self {
        Self::new(ExitCode::FileNotFound, path.display().to_string()).with_diagnostic(e.to_string())
    }

    /// Failure to acquire the device lock.
    pub(crate) fn lock(identity: &str, e: io::Error) -> Self {
        let code = if e.kind() == io::ErrorKind::WouldBlock {
            ExitCode::DeviceBusy
        } else {
            ExitCode::DeviceConnectFailure
        };
        Self::new(code, identity).with_diagnostic(e.to_string())
    }

    /// Narrow a generic protocol failure to the step it happened in.
    pub(crate) fn during(mut self, step: ExitCode) -> Self {
        if self.code == ExitCode::ProtocolFailure {
            self.code = step;
        }
        self
    }
}

impl From<nf_flasher_dfu::Error> for FlashError {
    fn from(value: nf_flasher_dfu::Error) -> Self {
        use nf_flasher_dfu::{Error as E, ParseError};

        let code = match &value {
            E::File(ParseError::ChecksumMismatch { .. }) => ExitCode::ChecksumMismatch,
            E::File(ParseError::FormatInvalid { .. }) | E::InvalidImage(_) => {
                ExitCode::FileFormatInvalid
            }
            E::Protocol { .. } | E::MalformedResponse(_) | E::SectorMap(_) => {
                ExitCode::ProtocolFailure
            }
            E::AddressNotMapped(_) => ExitCode::WriteFailure,
            E::VerifyFailed(_) => ExitCode::VerifyFailure,
            E::Timeout(_) => ExitCode::Timeout,
            E::DeviceNotFound => ExitCode::NoDeviceFound,
            E::Aborted => ExitCode::Aborted,
            _ => ExitCode::DeviceConnectFailure,
        };

        let diagnostic = match &value {
            E::Protocol { status, .. } => Some(status.to_string()),
            _ => None,
        };

        let err = Self::new(code, value.to_string());
        match diagnostic {
            Some(d) => err.with_diagnostic(d),
            None => err,
        }
    }
}

impl From<nf_flasher_esp32::Error> for FlashError {
    fn from(value: nf_flasher_esp32::Error) -> Self {
        use nf_flasher_esp32::Error as E;

        let code = match &value {
            E::ConnectTimeout(_) => ExitCode::Timeout,
            E::NoResponse(_) | E::InvalidResponse(_) | E::Rom { .. } => ExitCode::ProtocolFailure,
            E::UnknownChip(_) => ExitCode::DeviceConnectFailure,
            E::UnsupportedFlashSize(_) => ExitCode::UnsupportedFlashSize,
            E::PartitionTableMismatch { .. } => ExitCode::PartitionTableMismatch,
            E::StubRequired(_) => ExitCode::IncompatibleArguments,
            E::InvalidStub(_) => ExitCode::FileFormatInvalid,
            E::ShortRead { .. } => ExitCode::BackupFailure,
            E::Aborted => ExitCode::Aborted,
            _ => ExitCode::DeviceConnectFailure,
        };

        let diagnostic = match &value {
            E::Rom { error, .. } => Some(error.to_string()),
            _ => None,
        };

        let err = Self::new(code, value.to_string());
        match diagnostic {
            Some(d) => err.with_diagnostic(d),
            None => err,
        }
    }
}

/// Non-fatal finding. Logged and returned with the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Warning {
    /// Target name assumes something the connected device does not have.
    FitCheck(String),
    /// DFU file was made for another USB device.
    DeviceIdentity(String),
    /// Verification was requested but the device cannot read its flash back.
    VerifySkipped(String),
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FitCheck(x) | Self::DeviceIdentity(x) | Self::VerifySkipped(x) => f.write_str(x),
        }
    }
}

/// Result of one flashing invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Success { warnings: Vec<Warning> },
    Failed(FlashError),
}

impl FlashOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::Success { .. } => ExitCode::Ok,
            Self::Failed(e) => e.code(),
        }
    }

    pub fn error(&self) -> Option<&FlashError> {
        match self {
            Self::Success { .. } => None,
            Self::Failed(e) => Some(e),
        }
    }
}

impl From<Result<Vec<Warning>, FlashError>> for FlashOutcome {
    fn from(value: Result<Vec<Warning>, FlashError>) -> Self {
        match value {
            Ok(warnings) => Self::Success { warnings },
            Err(e) => Self::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{ExitCode, FailureKind, FlashError, FlashOutcome};

    #[test]
    fn stable_codes() {
        assert_eq!(ExitCode::Ok.code(), 0);
        assert_eq!(ExitCode::MissingArgument.code(), 10);
        assert_eq!(ExitCode::UnsupportedFlashSize.code(), 14);
        assert_eq!(ExitCode::DeviceBusy.code(), 22);
        assert_eq!(ExitCode::ChecksumMismatch.code(), 32);
        assert_eq!(ExitCode::ResetFailure.code(), 44);
        assert_eq!(ExitCode::VerifyFailure.code(), 50);
        assert_eq!(ExitCode::Timeout.code(), 61);

        assert_eq!(ExitCode::Ok.kind(), None);
        assert_eq!(ExitCode::Timeout.kind(), Some(FailureKind::Connection));
        assert_eq!(ExitCode::Aborted.kind(), Some(FailureKind::UserAbort));
    }

    #[test]
    fn display_keeps_diagnostic() {
        let e = FlashError::new(ExitCode::WriteFailure, "block 3")
            .with_diagnostic("errPROG (0x06)");
        assert_eq!(e.to_string(), "Write failed: block 3 [errPROG (0x06)]");
        assert_eq!(e.kind(), FailureKind::Protocol);
    }

    #[test]
    fn dfu_errors() {
        let e: FlashError = nf_flasher_dfu::Error::from(nf_flasher_dfu::ParseError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        })
        .into();
        assert_eq!(e.code(), ExitCode::ChecksumMismatch);

        let e: FlashError = nf_flasher_dfu::Error::Protocol {
            status: nf_flasher_dfu::StatusCode(0x04),
            state: nf_flasher_dfu::DfuState::DfuError,
        }
        .into();
        assert_eq!(e.code(), ExitCode::ProtocolFailure);
        assert_eq!(e.diagnostic(), Some("errERASE (0x04)"));
        assert_eq!(e.during(ExitCode::EraseFailure).code(), ExitCode::EraseFailure);
    }

    #[test]
    fn esp32_errors() {
        let e: FlashError = nf_flasher_esp32::Error::UnsupportedFlashSize(6).into();
        assert_eq!(e.code(), ExitCode::UnsupportedFlashSize);

        // Only generic protocol failures are narrowed
        let e = e.during(ExitCode::WriteFailure);
        assert_eq!(e.code(), ExitCode::UnsupportedFlashSize);
    }

    #[test]
    fn busy_lock() {
        let e = FlashError::lock("serial-COM3", io::ErrorKind::WouldBlock.into());
        assert_eq!(e.code(), ExitCode::DeviceBusy);

        let e = FlashError::lock("serial-COM3", io::ErrorKind::PermissionDenied.into());
        assert_eq!(e.code(), ExitCode::DeviceConnectFailure);
    }

    #[test]
    fn outcome_exit_code() {
        let ok = FlashOutcome::from(Ok(Vec::new()));
        assert!(ok.is_success());
        assert_eq!(ok.exit_code().code(), 0);

        let failed = FlashOutcome::from(Err(FlashError::aborted()));
        assert_eq!(failed.exit_code(), ExitCode::Aborted);
        assert_eq!(failed.error().map(|x| x.code().code()), Some(60));
    }
}
