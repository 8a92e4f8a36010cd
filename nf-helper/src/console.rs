//! Decoders for the text side of a flashing session.
//!
//! Bootloaders and external tools report two things as raw text that we care about:
//!
//! - While waiting for a target, a repeating retry pattern (`....____....`). If it goes on for
//!   too long the user probably needs to put the board in bootloader mode by hand.
//!   [`ConnectWatcher`] detects this and fires exactly once.
//! - Progress, drawn by overwriting the current line with a control character (carriage return
//!   for writes, backspace for reads). [`ProgressDecoder`] turns this into discrete
//!   [`ConsoleEvent::Progress`] events.

use std::time::{Duration, Instant};

/// Bytes making up the connect-retry pattern. `.` is an unanswered sync, `_` a reset pulse.
pub const CONNECT_PATTERN: &[u8] = b"._";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    PatternDetected(Instant),
    /// Terminal. The prompt is never shown twice in one session.
    Prompted,
}

#[derive(Debug, Clone)]
pub struct ConnectWatcher {
    state: ConnectState,
    threshold: Duration,
}

impl ConnectWatcher {
    pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);

    pub const fn new(threshold: Duration) -> Self {
        Self {
            state: ConnectState::Idle,
            threshold,
        }
    }

    pub const fn state(&self) -> ConnectState {
        self.state
    }

    pub const fn has_prompted(&self) -> bool {
        matches!(self.state, ConnectState::Prompted)
    }

    /// Feed the next chunk of output observed at `now`.
    ///
    /// Returns `true` exactly once: when the pattern has been continuous for at least the
    /// threshold. Empty chunks only advance time.
    pub fn observe(&mut self, chunk: &[u8], now: Instant) -> bool {
        if self.has_prompted() {
            return false;
        }

        let trailing = chunk
            .iter()
            .rev()
            .take_while(|b| CONNECT_PATTERN.contains(b))
            .count();

        if !chunk.is_empty() {
            if trailing == 0 {
                self.state = ConnectState::Idle;
                return false;
            }

            // Something else was printed before the pattern. Start counting afresh.
            if trailing < chunk.len() {
                self.state = ConnectState::PatternDetected(now);
            }
        }

        match self.state {
            ConnectState::Idle if !chunk.is_empty() => {
                self.state = ConnectState::PatternDetected(now);
                self.check(now)
            }
            ConnectState::PatternDetected(_) => self.check(now),
            _ => false,
        }
    }

    fn check(&mut self, now: Instant) -> bool {
        match self.state {
            ConnectState::PatternDetected(since)
                if now.saturating_duration_since(since) >= self.threshold =>
            {
                self.state = ConnectState::Prompted;
                true
            }
            _ => false,
        }
    }
}

impl Default for ConnectWatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A complete line, with control characters removed.
    Line(String),
    /// A progress fragment that was drawn and then overwritten.
    Progress(String),
}

/// Splits a console byte stream into lines and progress fragments.
#[derive(Debug, Clone)]
pub struct ProgressDecoder {
    control: u8,
    run: usize,
    pending: Vec<u8>,
    last_progress: Option<String>,
}

impl ProgressDecoder {
    /// `run` is the number of consecutive `control` bytes that complete a progress chunk.
    pub const fn new(control: u8, run: usize) -> Self {
        Self {
            control,
            run: if run == 0 { 1 } else { run },
            pending: Vec::new(),
            last_progress: None,
        }
    }

    /// Decoder for write progress, which rewinds with `\r`.
    pub const fn carriage_return() -> Self {
        Self::new(b'\r', 1)
    }

    /// Decoder for read/backup progress, which rewinds with a run of `\b`.
    pub const fn backspace() -> Self {
        Self::new(0x08, 4)
    }

    /// Feed the next chunk of output. Returns the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ConsoleEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self
            .pending
            .iter()
            .position(|b| *b == b'\n' || *b == self.control)
        {
            if self.pending[pos] == b'\n' {
                let line = self.clean(&self.pending[..pos]);
                self.pending.drain(..=pos);
                self.push_line(line, &mut events);
                continue;
            }

            let run = self.pending[pos..]
                .iter()
                .take_while(|b| **b == self.control)
                .count();

            // Cannot tell yet if the run is complete, or if `\r` is part of `\r\n`.
            let Some(next) = self.pending.get(pos + run).copied() else {
                break;
            };

            let fragment = self.clean(&self.pending[..pos]);
            if self.control == b'\r' && next == b'\n' {
                self.pending.drain(..=(pos + run));
                self.push_line(fragment, &mut events);
            } else if run >= self.run {
                self.pending.drain(..(pos + run));
                self.push_progress(fragment, &mut events);
            } else {
                // Short runs are in-line edits, not progress.
                self.pending.drain(pos..(pos + run));
            }
        }

        events
    }

    /// Flush whatever is left at the end of the stream.
    pub fn finish(&mut self) -> Vec<ConsoleEvent> {
        let mut events = Vec::new();
        let trailing = self
            .pending
            .iter()
            .rev()
            .take_while(|b| **b == self.control)
            .count();

        let text = self.clean(&self.pending);
        self.pending.clear();

        if trailing >= self.run {
            self.push_progress(text, &mut events);
        } else {
            self.push_line(text, &mut events);
        }

        events
    }

    fn clean(&self, raw: &[u8]) -> String {
        let temp: Vec<u8> = raw
            .iter()
            .copied()
            .filter(|b| *b != self.control && *b != b'\r' && *b != 0x08)
            .collect();

        String::from_utf8_lossy(&temp).trim().to_string()
    }

    fn push_line(&mut self, line: String, events: &mut Vec<ConsoleEvent>) {
        if !line.is_empty() {
            events.push(ConsoleEvent::Line(line));
        }
    }

    fn push_progress(&mut self, fragment: String, events: &mut Vec<ConsoleEvent>) {
        if fragment.is_empty() || self.last_progress.as_deref() == Some(fragment.as_str()) {
            return;
        }

        self.last_progress = Some(fragment.clone());
        events.push(ConsoleEvent::Progress(fragment));
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{ConnectState, ConnectWatcher, ConsoleEvent, ProgressDecoder};

    #[test]
    fn prompt_fires_once_after_threshold() {
        let start = Instant::now();
        let mut watcher = ConnectWatcher::default();
        let mut fired = Vec::new();

        // Pattern every 100 ms for 10 s
        for i in 0..=100u64 {
            let now = start + Duration::from_millis(i * 100);
            let chunk: &[u8] = if i % 2 == 0 { b"." } else { b"_" };
            if watcher.observe(chunk, now) {
                fired.push(now - start);
            }
        }

        assert_eq!(fired.len(), 1);
        assert!(fired[0] >= Duration::from_secs(5));
        assert!(fired[0] < Duration::from_millis(5100));
        assert_eq!(watcher.state(), ConnectState::Prompted);
    }

    #[test]
    fn other_output_resets_detection() {
        let start = Instant::now();
        let mut watcher = ConnectWatcher::new(Duration::from_secs(5));

        assert!(!watcher.observe(b"....", start));
        assert!(!watcher.observe(b"rst:0x1 (POWERON_RESET)", start + Duration::from_secs(4)));
        assert_eq!(watcher.state(), ConnectState::Idle);

        assert!(!watcher.observe(b"Connecting...", start + Duration::from_secs(6)));
        assert!(!watcher.observe(b"...", start + Duration::from_secs(10)));
        assert!(watcher.observe(b"...", start + Duration::from_secs(11)));
    }

    #[test]
    fn silence_advances_time() {
        let start = Instant::now();
        let mut watcher = ConnectWatcher::new(Duration::from_secs(1));

        assert!(!watcher.observe(b"_", start));
        assert!(watcher.observe(b"", start + Duration::from_secs(2)));
        assert!(!watcher.observe(b"", start + Duration::from_secs(3)));
    }

    #[test]
    fn carriage_return_progress() {
        let mut dec = ProgressDecoder::carriage_return();
        let mut events = dec.feed(b"Writing at 0x00001000... (10 %)\rWriting at 0x000");
        events.extend(dec.feed(b"02000... (20 %)\rWriting at 0x00002000... (20 %)\r"));
        events.extend(dec.feed(b"Wrote 8192 bytes\r\n"));
        events.extend(dec.finish());

        assert_eq!(
            events,
            [
                ConsoleEvent::Progress("Writing at 0x00001000... (10 %)".into()),
                ConsoleEvent::Progress("Writing at 0x00002000... (20 %)".into()),
                ConsoleEvent::Line("Wrote 8192 bytes".into()),
            ]
        );
    }

    #[test]
    fn crlf_split_across_chunks_is_a_line() {
        let mut dec = ProgressDecoder::carriage_return();
        let mut events = dec.feed(b"Hello\r");
        assert!(events.is_empty());
        events.extend(dec.feed(b"\nWorld\n"));

        assert_eq!(
            events,
            [
                ConsoleEvent::Line("Hello".into()),
                ConsoleEvent::Line("World".into())
            ]
        );
    }

    #[test]
    fn backspace_progress_never_leaks_control_bytes() {
        let mut dec = ProgressDecoder::backspace();
        let mut events = dec.feed(b"12 %\x08\x08\x08\x0813 %\x08\x08\x08");
        events.extend(dec.feed(b"\x08Read 4096 bytes\n"));

        assert_eq!(
            events,
            [
                ConsoleEvent::Progress("12 %".into()),
                ConsoleEvent::Progress("13 %".into()),
                ConsoleEvent::Line("Read 4096 bytes".into()),
            ]
        );

        for e in events {
            let (ConsoleEvent::Line(s) | ConsoleEvent::Progress(s)) = e;
            assert!(!s.contains('\x08'));
        }
    }
}
