//! Reservoir (spec §4.11): bounded buffering in front of a byte stream.
//!
//! Grounded on the same "explicit capacity, overflow is an error" shape as
//! `registry::MAX_IO_BURST` elsewhere in this crate: `fill` pulls until the
//! source yields `EAGAIN`/EOF or the reservoir's own capacity is reached,
//! and an attempt to hold more than `capacity` bytes reports `ENOSPC`
//! rather than growing silently.

use std::collections::VecDeque;
use std::io;

use crate::action::Action;
use crate::error::{is_would_block, StreamError};
use crate::stream::ByteStream;

pub struct Reservoir {
    source: Box<dyn ByteStream>,
    capacity: usize,
    buffer: VecDeque<u8>,
    source_eof: bool,
}

impl Reservoir {
    pub fn new(source: Box<dyn ByteStream>, capacity: usize) -> Reservoir {
        Reservoir {
            source,
            capacity,
            buffer: VecDeque::with_capacity(capacity),
            source_eof: false,
        }
    }

    /// Pulls from the source until it reports `EAGAIN`, clean EOF, or this
    /// reservoir's capacity is exhausted. Returns the number of bytes
    /// buffered by this call. `ENOSPC` if the source had more to offer than
    /// `capacity` could hold.
    pub fn fill(&mut self) -> io::Result<usize> {
        if self.source_eof {
            return Ok(0);
        }
        let mut pulled = 0;
        let mut scratch = [0u8; 4096];
        loop {
            let room = self.capacity - self.buffer.len();
            if room == 0 {
                return Err(StreamError::overflow("reservoir capacity exhausted").into());
            }
            let want = std::cmp::min(room, scratch.len());
            match self.source.read(&mut scratch[..want]) {
                Ok(0) => {
                    self.source_eof = true;
                    return Ok(pulled);
                }
                Ok(n) => {
                    self.buffer.extend(&scratch[..n]);
                    pulled += n;
                }
                Err(e) if is_would_block(&e) => return Ok(pulled),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_source_exhausted(&self) -> bool {
        self.source_eof && self.buffer.is_empty()
    }
}

impl ByteStream for Reservoir {
    /// Drains the buffer, not the source: call `fill` first. `Ok(0)` only
    /// once the buffer is empty *and* the source has hit clean EOF;
    /// otherwise an empty buffer with the source still live is `EAGAIN`,
    /// matching the rest of this crate's "retry, don't spin" contract.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            return if self.source_eof { Ok(0) } else { Err(crate::error::would_block()) };
        }
        let n = std::cmp::min(buf.len(), self.buffer.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.buffer.pop_front().unwrap();
        }
        Ok(n)
    }

    fn register_callback(&mut self, action: Action) {
        self.source.register_callback(action);
    }

    fn close(self: Box<Self>) {
        self.source.close();
    }
}
