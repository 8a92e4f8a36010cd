//! SLIP framing (RFC 1055) used by the ESP serial loader.

const END: u8 = 0xc0;
const ESC: u8 = 0xdb;
const ESC_END: u8 = 0xdc;
const ESC_ESC: u8 = 0xdd;

/// Wrap `data` in a frame.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut temp = Vec::with_capacity(data.len() + 2);

    temp.push(END);
    for b in data {
        match *b {
            END => temp.extend_from_slice(&[ESC, ESC_END]),
            ESC => temp.extend_from_slice(&[ESC, ESC_ESC]),
            x => temp.push(x),
        }
    }
    temp.push(END);

    temp
}

/// Incremental decoder. Bytes outside of frames (boot messages, the ROM banner) are collected
/// separately so they can be shown to the user.
#[derive(Debug, Default)]
pub struct Decoder {
    frame: Vec<u8>,
    in_frame: bool,
    escape: bool,
    noise: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns a complete frame once its closing delimiter is seen.
    pub fn push(&mut self, b: u8) -> Option<Vec<u8>> {
        if !self.in_frame {
            if b == END {
                self.in_frame = true;
                self.frame.clear();
            } else {
                self.noise.push(b);
            }
            return None;
        }

        if self.escape {
            self.escape = false;
            self.frame.push(match b {
                ESC_END => END,
                ESC_ESC => ESC,
                x => x,
            });
            return None;
        }

        match b {
            // Back to back delimiters, or a frame closing right after it opened
            END if self.frame.is_empty() => None,
            END => {
                self.in_frame = false;
                Some(std::mem::take(&mut self.frame))
            }
            ESC => {
                self.escape = true;
                None
            }
            x => {
                self.frame.push(x);
                None
            }
        }
    }

    /// Bytes seen outside of frames since the last call.
    pub fn take_noise(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.noise)
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.frame.clear();
        self.in_frame = false;
        self.escape = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{Decoder, encode};

    #[test]
    fn escapes_delimiters() {
        assert_eq!(
            encode(&[0x01, 0xc0, 0xdb, 0x02]),
            [0xc0, 0x01, 0xdb, 0xdc, 0xdb, 0xdd, 0x02, 0xc0]
        );
    }

    #[test]
    fn decodes_with_noise() {
        let mut dec = Decoder::new();
        let mut frames = Vec::new();

        let mut stream = b"ets Jun  8 2016\r\n".to_vec();
        stream.extend(encode(&[0x01, 0xc0, 0x08]));
        stream.extend(encode(&[0xdb]));

        for b in stream {
            frames.extend(dec.push(b));
        }

        assert_eq!(frames, [vec![0x01, 0xc0, 0x08], vec![0xdb]]);
        assert_eq!(dec.take_noise(), b"ets Jun  8 2016\r\n");
        assert!(dec.take_noise().is_empty());
    }
}
