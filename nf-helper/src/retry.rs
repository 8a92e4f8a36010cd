//! Retry and polling combinators.
//!
//! Several device protocols require polling a status until the device is ready, with no upper
//! bound defined by the protocol itself. Callers always go through [`poll_until`] so the wait is
//! bounded by a caller supplied timeout.

use std::time::{Duration, Instant};

use thiserror::Error;

/// Result of a single polling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    /// Not ready yet. Try again after the given delay.
    Pending(Duration),
}

#[derive(Error, Debug)]
pub enum PollError<E> {
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Failed(E),
}

/// Poll `attempt` until it is [`Attempt::Ready`], fails, or `timeout` elapses.
///
/// A `timeout` of `None` polls forever. This should only be used when the caller has some other
/// way of stopping, like a cancellation check inside `attempt`.
pub fn poll_until<T, E>(
    timeout: Option<Duration>,
    mut attempt: impl FnMut() -> Result<Attempt<T>, E>,
) -> Result<T, PollError<E>> {
    let start = Instant::now();

    loop {
        match attempt().map_err(PollError::Failed)? {
            Attempt::Ready(x) => return Ok(x),
            Attempt::Pending(wait) => match timeout {
                Some(t) => {
                    let elapsed = start.elapsed();
                    if elapsed >= t {
                        return Err(PollError::TimedOut(elapsed));
                    }
                    std::thread::sleep(wait.min(t - elapsed));
                }
                None => std::thread::sleep(wait),
            },
        }
    }
}

/// Call `f` up to `attempts` times, sleeping `delay` between failures. The error of the last
/// attempt is returned. `f` is always called at least once.
pub fn retry<T, E>(
    attempts: usize,
    delay: Duration,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    // Do attempts - 1 here so that we can return proper error
    for _ in 1..attempts {
        match f() {
            Ok(x) => return Ok(x),
            Err(_) => std::thread::sleep(delay),
        }
    }

    f()
}
