//! Line framer for accumulating partial reads.
//!
//! Bytes arrive in arbitrary chunks from the socket. `LineBuffer` keeps
//! everything after the last `\n` and hands out complete lines one at a
//! time, with the delimiter stripped.
//!
//! ```text
//! push("hel")      -> no lines,   pending "hel"
//! push("lo\nwor")  -> "hello",    pending "wor"
//! push("ld\n\n")   -> "world", "" pending ""
//! ```

use bytes::{Buf, Bytes, BytesMut};

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

/// Initial capacity of a connection's pending buffer.
const INITIAL_CAPACITY: usize = 256;

/// Per-connection line assembly state.
///
/// No length cap is applied: a line grows until its delimiter arrives.
#[derive(Debug)]
pub struct LineBuffer {
    /// Bytes received but not yet returned as part of a line.
    buffer: BytesMut,
    /// Prefix of `buffer` already known to contain no delimiter.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            scanned: 0,
        }
    }

    /// Append a freshly read chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete line, if a delimiter has been seen.
    ///
    /// Lines come out in the order their delimiters arrived. The returned
    /// bytes never contain the delimiter and may be empty.
    pub fn next_line(&mut self) -> Option<Bytes> {
        match self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == DELIMITER)
        {
            Some(offset) => {
                let end = self.scanned + offset;
                let line = self.buffer.split_to(end).freeze();
                self.buffer.advance(1);
                self.scanned = 0;
                Some(line)
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    /// Bytes after the last delimiter seen so far.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
