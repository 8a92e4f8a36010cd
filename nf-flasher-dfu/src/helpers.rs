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

#[cfg(feature = "usb")]
pub(crate) fn is_dfu_device<U: rusb::UsbContext>(x: &rusb::Device<U>) -> bool {
    if let Ok(cfg_desc) = x.active_config_descriptor() {
        for intf in cfg_desc.interfaces() {
            for desc in intf.descriptors() {
                if desc.class_code() == 0xfe && desc.sub_class_code() == 1 {
                    return true;
                }
            }
        }
    }

    false
}
