//! State shared by every step of one flashing invocation.

use std::{path::Path, time::Duration};

use futures::{StreamExt, channel::mpsc};
use nf_helper::lock::DeviceLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{FlashError, FlashingStatus, Warning};

/// Exclusive use of one device, plus the progress sink, cancellation and collected warnings.
///
/// Dropping the session releases the device lock.
#[derive(Debug)]
pub struct DeviceSession {
    identity: String,
    _lock: DeviceLock,
    chan: Option<mpsc::Sender<FlashingStatus>>,
    cancel: Option<CancellationToken>,
    warnings: Vec<Warning>,
}

impl DeviceSession {
    /// Lock the device named `identity`, waiting at most `wait` for another session.
    pub fn open(
        identity: &str,
        wait: Duration,
        chan: Option<mpsc::Sender<FlashingStatus>>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, FlashError> {
        let lock = DeviceLock::acquire(identity, wait).map_err(|e| FlashError::lock(identity, e))?;
        Ok(Self::with_lock(identity, lock, chan, cancel))
    }

    /// Same as [`DeviceSession::open`] with the lock file in `dir`.
    pub fn open_in(
        dir: &Path,
        identity: &str,
        wait: Duration,
        chan: Option<mpsc::Sender<FlashingStatus>>,
        cancel: Option<CancellationToken>,
    ) -> Result<Self, FlashError> {
        let lock = DeviceLock::acquire_in(dir, identity, wait)
            .map_err(|e| FlashError::lock(identity, e))?;
        Ok(Self::with_lock(identity, lock, chan, cancel))
    }

    fn with_lock(
        identity: &str,
        lock: DeviceLock,
        chan: Option<mpsc::Sender<FlashingStatus>>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        Self {
            identity: identity.to_string(),
            _lock: lock,
            chan,
            cancel,
            warnings: Vec::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&mut self, status: FlashingStatus) {
        if let Some(chan) = self.chan.as_mut() {
            let _ = chan.try_send(status);
        }
    }

    /// Fails with [`crate::ExitCode::Aborted`] once cancelled.
    pub fn check_cancel(&self) -> Result<(), FlashError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(FlashError::aborted()),
            _ => Ok(()),
        }
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel.clone()
    }

    /// A progress sender for a driver with its own status type.
    ///
    /// Statuses are converted and forwarded on a helper thread until the driver drops the sender.
    pub fn bridge<S>(&self) -> Option<mpsc::Sender<S>>
    where
        S: Into<FlashingStatus> + Send + 'static,
    {
        let chan = self.chan.clone()?;
        let (tx, rx) = mpsc::channel::<S>(20);

        std::thread::spawn(move || {
            let _ = futures::executor::block_on(rx.map(Into::into).map(Ok).forward(chan));
        });

        Some(tx)
    }

    pub fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}
