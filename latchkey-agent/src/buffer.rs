//! Per-connection frame reassembly.
//!
//! Socket reads arrive in arbitrary fragments; a [`ConnBuffer`] owns the
//! bytes for exactly one connection and yields complete frames as they
//! become available.  Nothing is shared between connections, so a slow peer
//! only ever stalls its own buffer.

use bytes::{Buf as _, BytesMut};

use crate::proto::{self, Decoded, ProtocolError};

/// Accumulates raw bytes from one connection and drains complete frames.
#[derive(Debug, Default)]
pub struct ConnBuffer {
    buf: BytesMut,
}

impl ConnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the accumulator.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one has fully arrived.
    ///
    /// Call in a loop after each [`extend`](Self::extend) until `Ok(None)`;
    /// a single read may complete several frames.  An oversized frame
    /// returns an error and the caller must drop the connection without
    /// answering.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        match proto::decode(&self.buf)? {
            Decoded::Frame { payload, consumed } => {
                self.buf.advance(consumed);
                Ok(Some(payload))
            }
            Decoded::Incomplete => Ok(None),
        }
    }

    /// Bytes currently held but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
