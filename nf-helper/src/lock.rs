//! Advisory lock keyed by device identity.
//!
//! A serial port or USB device must only be driven by one session at a time. The lock is an OS
//! file lock on a file in a shared directory, so it also works across processes, and the kernel
//! releases it when the owning process dies. The lock file itself stays behind and is reused by
//! the next session.

use std::{
    fs::{File, OpenOptions, TryLockError},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for another session to release a device.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DeviceLock {
    path: PathBuf,
    file: File,
}

impl DeviceLock {
    /// Acquire the lock for `identity` in the system temp directory, waiting at most `wait`.
    pub fn acquire(identity: &str, wait: Duration) -> io::Result<Self> {
        Self::acquire_in(&std::env::temp_dir(), identity, wait)
    }

    /// Same as [`DeviceLock::acquire`] with an explicit lock directory.
    ///
    /// Fails with [`io::ErrorKind::WouldBlock`] if the device is still locked after `wait`.
    pub fn acquire_in(dir: &Path, identity: &str, wait: Duration) -> io::Result<Self> {
        let path = dir.join(lock_file_name(identity));
        // Never truncate here: the file may belong to a live session
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let start = Instant::now();

        loop {
            match file.try_lock() {
                Ok(()) => break,
                Err(TryLockError::WouldBlock) => {
                    if start.elapsed() >= wait {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            format!("{identity} is in use by another session"),
                        ));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(e),
            }
        }

        // Owner, for whoever inspects the file. Whatever a dead session left is overwritten.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!("Locked {identity} ({})", path.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        // The file is not removed. A waiter may already hold it open, and unlinking it would let
        // that waiter lock a file nobody else can see.
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

/// Alphanumerics are kept, every other byte becomes `_xx`, so distinct identities never share a
/// file.
fn lock_file_name(identity: &str) -> String {
    let mut key = String::with_capacity(identity.len());
    for b in identity.bytes() {
        if b.is_ascii_alphanumeric() {
            key.push(char::from(b));
        } else {
            key.push_str(&format!("_{b:02x}"));
        }
    }

    format!("nf-flasher-{key}.lock")
}
