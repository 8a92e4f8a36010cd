//! Stuff common to all the flashers

use std::{borrow::Cow, collections::HashSet, path::Path};

use futures::{StreamExt, channel::mpsc};
use nf_flasher_dfu::{DfuFile, Firmware, image};
use nf_flasher_esp32::StubImage;
use nf_helper::{
    PartitionImage, PartitionMap,
    resolvable::{LocalFile, Resolvable},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    ExitCode, FlashError, FlashOutcome, FlashPlan, FlashRequest,
    config::FirmwareSource,
    flasher::HardwareOpener,
    orchestrator::{self, DeviceOpener, Images},
    policy::Platform,
    session::DeviceSession,
};

/// Enum to denote the Flashing progress.
///
/// The progress is denoted by [f32] between 0 and 1
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum FlashingStatus {
    Preparing,
    Connecting,
    /// The device does not answer. The user should put it into its bootloader by hand.
    BootloaderPrompt,
    /// Reading flash back, for a backup or a verification.
    Reading(f32),
    Erasing(f32),
    Flashing(f32),
    Verifying(f32),
    Resetting,
}

impl From<nf_flasher_dfu::Status> for FlashingStatus {
    fn from(value: nf_flasher_dfu::Status) -> Self {
        use nf_flasher_dfu::Status;

        match value {
            Status::Erasing(x) => Self::Erasing(x),
            Status::Flashing(x) => Self::Flashing(x),
            Status::Verifying(x) => Self::Verifying(x),
        }
    }
}

impl From<nf_flasher_esp32::Status> for FlashingStatus {
    fn from(value: nf_flasher_esp32::Status) -> Self {
        use nf_flasher_esp32::Status;

        match value {
            Status::Preparing => Self::Preparing,
            Status::Connecting => Self::Connecting,
            Status::BootloaderPrompt => Self::BootloaderPrompt,
            Status::Erasing => Self::Erasing(0.0),
            Status::Flashing(x) => Self::Flashing(x),
            Status::Reading(x) => Self::Reading(x),
        }
    }
}

/// A trait for modeling flashers. Also provides optional live status using channels.
pub trait FirmwareFlasher {
    /// Start flashing. Loading the images is part of this, so file errors end up in the
    /// outcome as well.
    fn flash(
        self,
        chan: Option<mpsc::Sender<FlashingStatus>>,
    ) -> impl Future<Output = FlashOutcome>;
}

/// A trait for modeling flasher targets.
pub trait FlasherTarget
where
    Self: Sized,
{
    /// File types (extensions) supported by the flasher. Can be used for filtering local files in
    /// applications
    const FILE_TYPES: &[&str];

    /// A list of possible flasher targets
    fn destinations() -> impl Future<Output = HashSet<Self>>;

    /// Check if destination can be selected
    fn is_destination_selectable() -> bool;

    /// A sort of device ID (port name, USB serial number).
    fn identifier<'a>(&'a self) -> Cow<'a, str>;
}

/// Flasher for any supported platform. The interface and the steps are decided by the
/// [`FlashPlan`].
pub struct Flasher {
    plan: FlashPlan,
    opener: Option<Box<dyn DeviceOpener + Send>>,
    cancel: Option<CancellationToken>,
}

impl Flasher {
    /// Validate `request`. Fails without touching any device.
    pub fn new(request: &FlashRequest) -> Result<Self, FlashError> {
        request.resolve().map(Self::from_plan)
    }

    pub const fn from_plan(plan: FlashPlan) -> Self {
        Self {
            plan,
            opener: None,
            cancel: None,
        }
    }

    /// Connect devices through `opener` instead of the real hardware.
    pub fn with_opener(mut self, opener: impl DeviceOpener + Send + 'static) -> Self {
        self.opener = Some(Box::new(opener));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub const fn plan(&self) -> &FlashPlan {
        &self.plan
    }
}

impl FirmwareFlasher for Flasher {
    async fn flash(self, chan: Option<mpsc::Sender<FlashingStatus>>) -> FlashOutcome {
        let Self {
            plan,
            opener,
            cancel,
        } = self;

        let (images, stub) = match load_images(&plan).await {
            Ok(x) => x,
            Err(e) => return FlashOutcome::Failed(e),
        };
        let opener = opener.unwrap_or_else(|| Box::new(HardwareOpener::new(stub)));

        let flasher_task = if let Some(chan) = chan {
            let (tx, rx) = mpsc::channel(20);
            let flasher_task =
                tokio::task::spawn_blocking(move || run(plan, images, opener, Some(tx), cancel));

            // Runs until every sender is dropped, i.e. the flasher task is done.
            let _ = rx.map(Ok).forward(chan).await;

            flasher_task
        } else {
            tokio::task::spawn_blocking(move || run(plan, images, opener, None, cancel))
        };

        flasher_task.await.unwrap_or_else(|e| {
            FlashOutcome::Failed(
                FlashError::new(ExitCode::DeviceConnectFailure, "flashing task failed")
                    .with_diagnostic(e.to_string()),
            )
        })
    }
}

fn run(
    plan: FlashPlan,
    images: Images,
    mut opener: Box<dyn DeviceOpener + Send>,
    chan: Option<mpsc::Sender<FlashingStatus>>,
    cancel: Option<CancellationToken>,
) -> FlashOutcome {
    let identity = match opener.lock_key(&plan) {
        Ok(x) => x,
        Err(e) => return FlashOutcome::Failed(e),
    };

    match DeviceSession::open(&identity, plan.lock_wait, chan, cancel) {
        Ok(session) => orchestrator::run(&plan, &images, opener.as_mut(), session),
        Err(e) => FlashOutcome::Failed(e),
    }
}

async fn read(
    path: &Path,
    tasks: &mut JoinSet<std::io::Result<()>>,
) -> Result<PartitionImage, FlashError> {
    let img = LocalFile::new(path.into())
        .resolve(tasks)
        .await
        .map_err(|e| FlashError::file(path, e))?;
    debug!("Loaded {} ({} bytes)", img.name(), img.len());
    Ok(img)
}

fn place(map: &mut PartitionMap, address: u32, img: PartitionImage) -> Result<(), FlashError> {
    if let Some(old) = map.insert(address, img) {
        return Err(FlashError::incompatible(format!(
            "{} and another image both start at {address:#010x}",
            old.name()
        )));
    }
    Ok(())
}

/// Load every file `plan` names, plus the flasher stub.
pub(crate) async fn load_images(
    plan: &FlashPlan,
) -> Result<(Images, Option<StubImage>), FlashError> {
    let mut tasks = JoinSet::new();

    let firmware = match &plan.firmware {
        None => None,
        Some(FirmwareSource::DfuFile(path)) => {
            let img = read(path, &mut tasks).await?;
            let file = DfuFile::parse(img.data())
                .map_err(|e| FlashError::from(nf_flasher_dfu::Error::from(e)))?;
            info!("{} holds {} targets", img.name(), file.targets.len());
            Some(Firmware::Dfu(file))
        }
        Some(FirmwareSource::Files { bins, hex }) => {
            let mut map = PartitionMap::new();

            for (address, path) in bins {
                let img = read(path, &mut tasks).await?;
                place(&mut map, *address, img)?;
            }
            for path in hex {
                let img = read(path, &mut tasks).await?;
                for (address, part) in image::from_hex(img.name(), img.data())?.iter() {
                    place(&mut map, address, part.clone())?;
                }
            }

            if let Some((a, b)) = map.first_overlap() {
                return Err(FlashError::incompatible(format!(
                    "images at {a:#010x} and {b:#010x} overlap"
                )));
            }
            Some(Firmware::Raw(map))
        }
    };

    let deploy = match &plan.deploy {
        Some(d) => Some((d.address, read(&d.file, &mut tasks).await?)),
        None => None,
    };

    let stub = match &plan.stub {
        Some(path) if plan.platform == Platform::Esp32 => {
            let img = read(path, &mut tasks).await?;
            Some(StubImage::from_json(img.data())?)
        }
        _ => None,
    };

    while let Some(res) = tasks.join_next().await {
        res.map_err(std::io::Error::other)
            .and_then(|x| x)
            .map_err(|e| {
                FlashError::new(ExitCode::FileNotFound, "image").with_diagnostic(e.to_string())
            })?;
    }

    Ok((Images { firmware, deploy }, stub))
}
