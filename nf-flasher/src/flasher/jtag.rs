//! Flashing through vendor JTAG/SWD command line tools.
//!
//! The tools themselves are opaque. Only their arguments and the text they print are modelled:
//! progress fragments become [`FlashingStatus`] updates and the first error line becomes the
//! failure diagnostic.

use std::{fmt, io::Write, path::Path};

use futures::channel::mpsc;
use nf_flasher_dfu::Firmware;
use nf_helper::console::{ConsoleEvent, ProgressDecoder};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    ExitCode, FlashError, FlashingStatus,
    orchestrator::{DeviceDescription, PlatformDriver},
};

/// SEGGER device name of the supported Gecko boards.
const JLINK_DEVICE: &str = "EFM32GG11B820F2048";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JtagTool {
    StCubeProgrammer,
    Uniflash,
    JLink,
}

impl fmt::Display for JtagTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dialect().name)
    }
}

/// What a tool is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum ToolOp<'a> {
    Erase,
    Write {
        file: &'a Path,
        address: u32,
        verify: bool,
    },
    Reset,
}

/// Arguments for one tool run. J-Link takes its commands from a script file, which is
/// staged and appended to `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub args: Vec<String>,
    pub script: Option<String>,
}

/// How to talk to one tool.
#[derive(Debug)]
pub struct ToolDialect {
    pub tool: JtagTool,
    pub name: &'static str,
    pub program: &'static str,
    /// Character the tool rewinds its progress line with.
    pub progress_control: u8,
    pub success_markers: &'static [&'static str],
    pub error_markers: &'static [&'static str],
}

pub const DIALECTS: &[ToolDialect] = &[
    ToolDialect {
        tool: JtagTool::StCubeProgrammer,
        name: "STM32CubeProgrammer",
        program: "STM32_Programmer_CLI",
        progress_control: b'\r',
        success_markers: &[
            "File download complete",
            "Mass erase successfully achieved",
            "MCU Reset",
        ],
        error_markers: &["Error:"],
    },
    ToolDialect {
        tool: JtagTool::Uniflash,
        name: "TI Uniflash",
        program: "dslite",
        progress_control: b'\r',
        success_markers: &["Success"],
        error_markers: &["Error", "Failed"],
    },
    ToolDialect {
        tool: JtagTool::JLink,
        name: "SEGGER J-Link",
        program: if cfg!(windows) { "JLink" } else { "JLinkExe" },
        progress_control: b'\r',
        success_markers: &["O.K."],
        error_markers: &["ERROR", "Cannot connect", "Failed to"],
    },
];

impl ToolDialect {
    pub fn is_error(&self, line: &str) -> bool {
        self.error_markers.iter().any(|x| line.contains(x))
    }

    pub fn is_success(&self, line: &str) -> bool {
        self.success_markers.iter().any(|x| line.contains(x))
    }
}

impl JtagTool {
    pub fn dialect(self) -> &'static ToolDialect {
        DIALECTS
            .iter()
            .find(|x| x.tool == self)
            .unwrap_or(&DIALECTS[0])
    }

    /// Arguments for `op`. `id` is the adapter serial number, or the target configuration file for
    /// Uniflash.
    pub fn command(self, op: ToolOp<'_>, id: Option<&str>) -> ToolCommand {
        match self {
            Self::StCubeProgrammer => {
                let mut args = vec!["-c".to_string(), "port=SWD".to_string()];
                if let Some(id) = id {
                    args.push(format!("sn={id}"));
                }

                match op {
                    ToolOp::Erase => args.extend(["-e".to_string(), "all".to_string()]),
                    ToolOp::Write {
                        file,
                        address,
                        verify,
                    } => {
                        args.extend([
                            "-w".to_string(),
                            file.display().to_string(),
                            format!("{address:#010x}"),
                        ]);
                        if verify {
                            args.push("-v".to_string());
                        }
                    }
                    ToolOp::Reset => args.push("-rst".to_string()),
                }

                ToolCommand { args, script: None }
            }
            Self::Uniflash => {
                let mut args = vec!["--mode".to_string(), "flash".to_string()];
                if let Some(config) = id {
                    args.push(format!("--config={config}"));
                }

                match op {
                    ToolOp::Erase => args.push("-e".to_string()),
                    ToolOp::Write {
                        file,
                        address,
                        verify,
                    } => {
                        if verify {
                            args.push("-v".to_string());
                        }
                        args.extend([
                            "-f".to_string(),
                            format!("{},{address:#x}", file.display()),
                        ]);
                    }
                    ToolOp::Reset => args.extend([
                        "--post-flash-device-cmd".to_string(),
                        "PinReset".to_string(),
                    ]),
                }

                ToolCommand { args, script: None }
            }
            Self::JLink => {
                let mut args: Vec<String> = [
                    "-device",
                    JLINK_DEVICE,
                    "-if",
                    "SWD",
                    "-speed",
                    "4000",
                    "-autoconnect",
                    "1",
                    "-ExitOnError",
                    "1",
                ]
                .into_iter()
                .map(String::from)
                .collect();
                if let Some(id) = id {
                    args.extend(["-USB".to_string(), id.to_string()]);
                }
                args.push("-CommanderScript".to_string());

                let script = match op {
                    ToolOp::Erase => "r\nerase\nexit\n".to_string(),
                    ToolOp::Write {
                        file,
                        address,
                        verify,
                    } => {
                        let mut s = format!("r\nh\nloadbin {},{address:#x}\n", file.display());
                        if verify {
                            s.push_str(&format!("verifybin {},{address:#x}\n", file.display()));
                        }
                        s.push_str("exit\n");
                        s
                    }
                    ToolOp::Reset => "r\ng\nexit\n".to_string(),
                };

                ToolCommand {
                    args,
                    script: Some(script),
                }
            }
        }
    }
}

/// Launches an external tool.
pub trait ToolRunner {
    /// Run `program` to completion, passing output chunks to `output` as they arrive. Returns the
    /// exit code.
    fn run(
        &mut self,
        program: &str,
        args: &[String],
        output: &mut dyn FnMut(&[u8]),
    ) -> anyhow::Result<i32>;
}

impl<T: ToolRunner + ?Sized> ToolRunner for &mut T {
    fn run(
        &mut self,
        program: &str,
        args: &[String],
        output: &mut dyn FnMut(&[u8]),
    ) -> anyhow::Result<i32> {
        (**self).run(program, args, output)
    }
}

/// Runs tools as child processes.
#[cfg(feature = "jtag")]
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    dir: Option<std::path::PathBuf>,
}

#[cfg(feature = "jtag")]
impl ProcessRunner {
    /// `dir` holds the tool executables. `None` searches `PATH`.
    pub const fn new(dir: Option<std::path::PathBuf>) -> Self {
        Self { dir }
    }
}

#[cfg(feature = "jtag")]
impl ToolRunner for ProcessRunner {
    fn run(
        &mut self,
        program: &str,
        args: &[String],
        output: &mut dyn FnMut(&[u8]),
    ) -> anyhow::Result<i32> {
        use std::{
            io::Read,
            process::{Command, Stdio},
        };

        use anyhow::Context;

        let exe = match &self.dir {
            Some(d) => d.join(program),
            None => std::path::PathBuf::from(program),
        };

        debug!("Running {} {}", exe.display(), args.join(" "));
        let mut child = Command::new(&exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", exe.display()))?;

        let mut stderr = child.stderr.take().context("Missing stderr pipe")?;
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });

        let mut stdout = child.stdout.take().context("Missing stdout pipe")?;
        let mut buf = [0u8; 512];
        loop {
            let n = stdout.read(&mut buf).context("Failed to read tool output")?;
            if n == 0 {
                break;
            }
            output(&buf[..n]);
        }

        let err = stderr_thread
            .join()
            .map_err(|_| anyhow::anyhow!("stderr reader panicked"))?;
        if !err.is_empty() {
            output(&err);
        }

        let status = child.wait().context("Failed to wait for tool")?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Percentage in a progress fragment such as `" 45%"`, as a fraction.
fn percent(fragment: &str) -> Option<f32> {
    let end = fragment.find('%')?;
    let start = fragment[..end]
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map_or(0, |i| i + 1);

    fragment[start..end]
        .parse::<f32>()
        .ok()
        .map(|x| (x / 100.0).clamp(0.0, 1.0))
}

fn stage(data: &[u8], suffix: &str) -> Result<NamedTempFile, FlashError> {
    let failed = |e: std::io::Error| {
        FlashError::new(ExitCode::WriteFailure, "Failed to stage file for the tool")
            .with_diagnostic(e.to_string())
    };

    let mut file = tempfile::Builder::new()
        .prefix("nf-flasher-")
        .suffix(suffix)
        .tempfile()
        .map_err(failed)?;
    file.write_all(data).map_err(failed)?;
    file.flush().map_err(failed)?;

    Ok(file)
}

/// A device behind an external tool.
pub struct JtagDriver<R: ToolRunner> {
    runner: R,
    tool: JtagTool,
    id: Option<String>,
    verify: bool,
    chan: Option<mpsc::Sender<FlashingStatus>>,
    cancel: Option<CancellationToken>,
}

impl<R: ToolRunner> JtagDriver<R> {
    pub const fn new(runner: R, tool: JtagTool, id: Option<String>, verify: bool) -> Self {
        Self {
            runner,
            tool,
            id,
            verify,
            chan: None,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, chan: Option<mpsc::Sender<FlashingStatus>>) -> Self {
        self.chan = chan;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    fn invoke(
        &mut self,
        op: ToolOp<'_>,
        failure: ExitCode,
        progress: fn(f32) -> FlashingStatus,
    ) -> Result<(), FlashError> {
        if self.cancel.as_ref().is_some_and(|x| x.is_cancelled()) {
            return Err(FlashError::aborted());
        }

        let dialect = self.tool.dialect();
        let ToolCommand { mut args, script } = self.tool.command(op, self.id.as_deref());

        // Kept alive until the tool exits
        let script = script.map(|s| stage(s.as_bytes(), ".jlink")).transpose()?;
        if let Some(f) = &script {
            args.push(f.path().display().to_string());
        }

        let Self { runner, chan, .. } = self;
        let mut decoder = ProgressDecoder::new(dialect.progress_control, 1);
        let mut first_error: Option<String> = None;
        let mut succeeded = false;

        let mut handle = |events: Vec<ConsoleEvent>| {
            for ev in events {
                match ev {
                    ConsoleEvent::Line(line) => {
                        debug!("{}: {line}", dialect.name);
                        if first_error.is_none() && dialect.is_error(&line) {
                            first_error = Some(line);
                        } else if dialect.is_success(&line) {
                            succeeded = true;
                        }
                    }
                    ConsoleEvent::Progress(fragment) => {
                        trace!("{}: {fragment}", dialect.name);
                        if let (Some(p), Some(chan)) = (percent(&fragment), chan.as_mut()) {
                            let _ = chan.try_send(progress(p));
                        }
                    }
                }
            }
        };

        let code = runner
            .run(dialect.program, &args, &mut |chunk| handle(decoder.feed(chunk)))
            .map_err(|e| {
                FlashError::new(
                    ExitCode::DeviceConnectFailure,
                    format!("{} could not be run", dialect.name),
                )
                .with_diagnostic(format!("{e:#}"))
            })?;
        handle(decoder.finish());

        if code != 0 || first_error.is_some() {
            let err = FlashError::new(failure, format!("{} exited with {code}", dialect.name));
            return Err(match first_error {
                Some(line) => err.with_diagnostic(line),
                None => err,
            });
        }

        if !succeeded {
            warn!("{} finished without reporting success", dialect.name);
        }

        Ok(())
    }
}

impl<R: ToolRunner> PlatformDriver for JtagDriver<R> {
    fn device(&self) -> DeviceDescription {
        DeviceDescription::Tool {
            tool: self.tool,
            id: self.id.clone(),
        }
    }

    fn backup(&mut self) -> Result<Vec<u8>, FlashError> {
        Err(FlashError::incompatible(format!(
            "backup is not supported with {}",
            self.tool
        )))
    }

    fn erase(&mut self, firmware: Option<&Firmware>) -> Result<(), FlashError> {
        if firmware.is_some() {
            debug!("{} erases while programming", self.tool);
            return Ok(());
        }

        info!("Mass erase with {}", self.tool);
        self.invoke(ToolOp::Erase, ExitCode::EraseFailure, FlashingStatus::Erasing)
    }

    fn write(&mut self, firmware: &Firmware) -> Result<(), FlashError> {
        let Firmware::Raw(map) = firmware else {
            return Err(FlashError::incompatible(
                "DFU files can only be flashed over DFU",
            ));
        };

        for (address, image) in map.ascending() {
            let staged = stage(image.data(), ".bin")?;
            info!(
                "Writing {} ({} bytes) at {address:#010x} with {}",
                image.name(),
                image.len(),
                self.tool
            );

            self.invoke(
                ToolOp::Write {
                    file: staged.path(),
                    address,
                    verify: self.verify,
                },
                ExitCode::WriteFailure,
                FlashingStatus::Flashing,
            )?;
        }

        Ok(())
    }

    fn verify(&mut self, _: &Firmware) -> Result<(), FlashError> {
        // Requested from the tool as part of the write
        debug!("{} verified while programming", self.tool);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), FlashError> {
        self.invoke(ToolOp::Reset, ExitCode::ResetFailure, |_| {
            FlashingStatus::Resetting
        })
    }
}
