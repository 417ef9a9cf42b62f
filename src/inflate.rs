//! zlib-stream transport decompression
//!
//! The gateway compresses a whole connection as one zlib stream. Binary
//! frames are buffered until a chunk ends with the sync-flush marker, at which
//! point the buffered bytes are inflated into exactly one JSON payload.

use crate::error::Error;
use crate::Result;

#[cfg(feature = "zlib")]
use flate2::{Decompress, FlushDecompress};

/// Whether this build can negotiate `compress=zlib-stream`.
pub const COMPRESSION_AVAILABLE: bool = cfg!(feature = "zlib");

/// Trailer of every complete zlib-stream message
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

#[cfg(feature = "zlib")]
const OUTPUT_CHUNK: usize = 16 * 1024;

/// Per-connection decompression context.
pub struct Inflater {
    #[cfg(feature = "zlib")]
    decompress: Decompress,
    buffer: Vec<u8>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "zlib")]
            decompress: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Feed one binary frame.
    ///
    /// Returns `Ok(None)` while the message is incomplete. On error the
    /// buffered partial message is discarded.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.buffer.extend_from_slice(data);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let frame = std::mem::take(&mut self.buffer);
        self.inflate(&frame).map(Some)
    }

    /// Bytes held for an incomplete message
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(feature = "zlib")]
    fn inflate(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(frame.len() * 4);
        let mut consumed = 0usize;

        loop {
            output.reserve(OUTPUT_CHUNK);
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();

            self.decompress
                .decompress_vec(&frame[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| Error::Decompress(e.to_string()))?;

            let read = (self.decompress.total_in() - in_before) as usize;
            let written = self.decompress.total_out() - out_before;
            consumed += read;

            if consumed >= frame.len() && (output.len() < output.capacity() || written == 0) {
                break;
            }
            if read == 0 && written == 0 {
                return Err(Error::Decompress("zlib stream stalled".to_string()));
            }
        }

        Ok(output)
    }

    #[cfg(not(feature = "zlib"))]
    fn inflate(&mut self, _frame: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Decompress(
            "zlib support is not compiled in".to_string(),
        ))
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}
