//! Board specific quirks, keyed by firmware target name.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Erratum {
    pub target: &'static str,
    /// Wait before erasing and before writing.
    pub settle: Duration,
    pub note: &'static str,
}

pub const ERRATA: &[Erratum] = &[Erratum {
    target: "KALUGA_1",
    settle: Duration::from_secs(15),
    note: "on-board debugger keeps the chip busy for a while after reset",
}];

pub fn lookup(target: &str) -> Option<&'static Erratum> {
    ERRATA.iter().find(|x| x.target.eq_ignore_ascii_case(target))
}

/// Settle delay for `target`, if it has one.
pub fn settle_delay(target: Option<&str>) -> Option<Duration> {
    target.and_then(lookup).map(|x| x.settle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::settle_delay;

    #[test]
    fn kaluga_needs_settle() {
        assert_eq!(settle_delay(Some("KALUGA_1")), Some(Duration::from_secs(15)));
        assert_eq!(settle_delay(Some("kaluga_1")), Some(Duration::from_secs(15)));
        assert_eq!(settle_delay(Some("ESP32_PSRAM_REV0")), None);
        assert_eq!(settle_delay(None), None);
    }
}
