//! RAM resident flasher stub.
//!
//! Stub images are distributed as JSON:
//!
//! ```json
//! {
//!   "entry": 1074521516,
//!   "text": "<hex>",
//!   "text_start": 1074520064,
//!   "data": "<hex>",
//!   "data_start": 1073605544
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Connection, Error, Result, command::Command, serial::SerialTransport};

/// Largest MEM_DATA payload the ROM accepts.
const RAM_BLOCK_SIZE: usize = 0x1800;
const GREETING: &[u8] = b"OHAI";
const GREETING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubImage {
    pub entry: u32,
    #[serde(with = "const_hex")]
    pub text: Vec<u8>,
    pub text_start: u32,
    #[serde(with = "const_hex", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub data_start: u32,
}

impl StubImage {
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let stub: Self =
            serde_json::from_slice(json).map_err(|e| Error::InvalidStub(e.to_string()))?;

        if stub.text.is_empty() {
            return Err(Error::InvalidStub("empty text segment".to_string()));
        }
        if stub.entry == 0 {
            return Err(Error::InvalidStub("missing entry point".to_string()));
        }

        Ok(stub)
    }

    fn segments(&self) -> impl Iterator<Item = (u32, &[u8])> {
        [
            (self.text_start, self.text.as_slice()),
            (self.data_start, self.data.as_slice()),
        ]
        .into_iter()
        .filter(|(_, data)| !data.is_empty())
    }

    /// Load the stub into RAM, start it and wait for its greeting.
    pub fn run<P: SerialTransport>(&self, conn: &mut Connection<P>) -> Result<()> {
        if conn.is_bootstrapped() {
            return Ok(());
        }

        info!("Uploading flasher stub");

        for (offset, data) in self.segments() {
            let blocks = data.len().div_ceil(RAM_BLOCK_SIZE);
            debug!("Stub segment at {offset:#010x}, {} bytes", data.len());

            conn.command(Command::MemBegin {
                size: data.len() as u32,
                blocks: blocks as u32,
                block_size: RAM_BLOCK_SIZE as u32,
                offset,
            })?;

            for (sequence, chunk) in data.chunks(RAM_BLOCK_SIZE).enumerate() {
                conn.command(Command::MemData {
                    data: chunk,
                    sequence: sequence as u32,
                })?;
            }
        }

        conn.command(Command::MemEnd { entry: self.entry })?;

        let frame = conn.read_frame(GREETING_TIMEOUT)?;
        if frame != GREETING {
            return Err(Error::InvalidResponse("stub did not greet"));
        }

        conn.set_bootstrapped();
        info!("Flasher stub running");
        Ok(())
    }
}
