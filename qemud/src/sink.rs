// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2026. Triad National Security, LLC.

use crate::snapshot::{read_u32, write_u32};
use std::io::{self, Read, Write};

/// Reads a fixed number of bytes off a byte stream into an owned buffer.
///
/// A sink doesn't know or care whether it's filling a packet header or a
/// payload; `SerialCodec` and `Client` just `reset` it to a new size between
/// reads.
#[derive(Debug, Default, Clone)]
pub struct Sink {
    buf: Vec<u8>,
    used: usize,
}

impl Sink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts filling a destination buffer of `size` bytes from scratch.
    pub fn reset(&mut self, size: usize) {
        self.buf = vec![0u8; size];
        self.used = 0;
    }

    /// Feeds as many bytes from `src` as fit, advancing `src` past what was
    /// consumed. Returns `true` once the destination buffer is full.
    pub fn fill(&mut self, src: &mut &[u8]) -> bool {
        let avail = self.buf.len() - self.used;
        if avail == 0 {
            return true;
        }

        let take = avail.min(src.len());
        self.buf[self.used..self.used + take].copy_from_slice(&src[..take]);
        self.used += take;
        *src = &src[take..];

        self.used == self.buf.len()
    }

    /// Bytes still needed to fill the destination buffer.
    pub fn needed(&self) -> usize {
        self.buf.len() - self.used
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf
    }

    /// The prefix of the destination buffer filled so far — meaningful
    /// while a fill is still in progress (used by mid-frame snapshots).
    pub fn used_slice(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn save<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_u32(w, self.used as u32)?;
        write_u32(w, self.buf.len() as u32)
    }

    /// Loads the `used`/`size` counters from a snapshot. The caller is
    /// responsible for re-`reset`ting (or otherwise re-populating) the
    /// backing buffer, since the original buffer is usually owned by the
    /// containing struct and saved separately.
    pub fn load<R: Read>(&mut self, r: &mut R) -> io::Result<()> {
        let used = read_u32(r)? as usize;
        let size = read_u32(r)? as usize;
        self.used = used;
        self.buf = vec![0u8; size];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_stops_at_capacity() {
        let mut sink = Sink::new();
        sink.reset(4);
        let mut src: &[u8] = b"abcdef";
        assert!(sink.fill(&mut src));
        assert_eq!(sink.filled(), b"abcd");
        assert_eq!(src, b"ef");
    }

    #[test]
    fn fill_across_calls() {
        let mut sink = Sink::new();
        sink.reset(4);
        let mut src: &[u8] = b"ab";
        assert!(!sink.fill(&mut src));
        assert_eq!(sink.needed(), 2);
        let mut src2: &[u8] = b"cd";
        assert!(sink.fill(&mut src2));
        assert_eq!(sink.filled(), b"abcd");
    }
}
