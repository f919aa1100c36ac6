//! Receive buffer with peek/consume semantics.
//!
//! Socket reads append raw bytes here; the framed codec then peeks at the
//! fixed-size header without consuming, and only once a complete frame is
//! present does it `advance` past it. Consumers drain the buffer in a loop
//! until the codec reports a partial frame or the buffer is empty.

use bytes::{Buf, BytesMut};

/// Growable byte buffer fed by socket reads and drained by the codec.
///
/// Built on `BytesMut` so that consuming a frame is a cheap cursor
/// advance rather than a copy.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: BytesMut,
}

impl RecvBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Appends bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Views the first `n` bytes without consuming them.
    ///
    /// Returns `None` when fewer than `n` bytes are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.buf.len() < n {
            return None;
        }
        Some(&self.buf[..n])
    }

    /// Consumes the first `n` bytes.
    ///
    /// Callers must only advance past bytes they have already peeked;
    /// advancing beyond the buffered length is a logic error upstream,
    /// so it is clamped rather than panicking.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// All currently buffered bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discards everything, e.g. when the connection is torn down.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
