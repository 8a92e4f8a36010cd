use std::time::Duration;

use futures::channel::mpsc;

use crate::Status;

pub(crate) fn check_token(
    cancel: Option<&tokio_util::sync::CancellationToken>,
) -> crate::Result<()> {
    match cancel {
        Some(x) if x.is_cancelled() => Err(crate::Error::Aborted),
        _ => Ok(()),
    }
}

pub(crate) fn chan_send(chan: Option<&mut mpsc::Sender<Status>>, msg: Status) {
    if let Some(c) = chan {
        let _ = c.try_send(msg);
    }
}

pub(crate) fn progress(done: usize, total: usize) -> f32 {
    if total == 0 {
        1.0
    } else {
        done as f32 / total as f32
    }
}

/// Scale a per megabyte timeout to `size`, never going below `min`.
pub(crate) fn timeout_for_size(per_mb: Duration, size: u32, min: Duration) -> Duration {
    let scaled = per_mb.mul_f64(f64::from(size) / 1_000_000.0);
    scaled.max(min)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::timeout_for_size;

    #[test]
    fn size_scaled_timeout() {
        let per_mb = Duration::from_secs(30);
        let min = Duration::from_secs(3);

        assert_eq!(timeout_for_size(per_mb, 4_000_000, min), Duration::from_secs(120));
        assert_eq!(timeout_for_size(per_mb, 4096, min), min);
    }
}
