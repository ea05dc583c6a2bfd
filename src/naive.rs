//! Naive framer/decoder/encoder (spec §4.10): single-byte terminator
//! framing with an optional escape byte. Setting terminator == escape
//! disables escaping entirely, per spec: "the terminator and escape are
//! set to the same byte and escapes disabled."
//!
//! Grounded on the same state-machine style as `chunked`: an explicit
//! byte-at-a-time `State` rather than an ad-hoc scan, for the same
//! pause/resume-on-`EAGAIN` reason spec §9 gives for the chunk codec.

use std::collections::VecDeque;
use std::io;

use crate::action::Action;
use crate::error::{is_would_block, StreamError};
use crate::stream::{ByteStream, ByteStreamV2};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NaiveDecoderMode {
    /// `close()` does not close the underlying source; the caller (or a
    /// Deserializer sharing the source) keeps driving it.
    Detach,
    /// `close()` closes the underlying source too.
    Adopt,
}

#[derive(Clone, Debug)]
enum State {
    Reading,
    Escaped,
    Eof,
    Errored(StreamError),
}

pub struct NaiveDecoder {
    source: Box<dyn ByteStream>,
    terminator: u8,
    escape: u8,
    escaping_enabled: bool,
    mode: NaiveDecoderMode,
    state: State,
}

impl NaiveDecoder {
    pub fn new(source: Box<dyn ByteStream>, terminator: u8, escape: u8, mode: NaiveDecoderMode) -> NaiveDecoder {
        NaiveDecoder {
            source,
            terminator,
            escape,
            escaping_enabled: terminator != escape,
            mode,
            state: State::Reading,
        }
    }
}

impl ByteStream for NaiveDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.state {
            State::Eof => return Ok(0),
            State::Errored(e) => return Err(e.clone().into()),
            State::Reading | State::Escaped => {}
        }

        let mut out = 0;
        let mut one = [0u8; 1];
        while out < buf.len() {
            match self.source.read(&mut one) {
                Ok(0) => {
                    let err = StreamError::malformed("naive frame: source exhausted before terminator");
                    self.state = State::Errored(err.clone());
                    return if out > 0 { Ok(out) } else { Err(err.into()) };
                }
                Ok(_) => {
                    let b = one[0];
                    match self.state {
                        State::Escaped => {
                            buf[out] = b;
                            out += 1;
                            self.state = State::Reading;
                        }
                        State::Reading => {
                            if self.escaping_enabled && b == self.escape {
                                self.state = State::Escaped;
                            } else if b == self.terminator {
                                self.state = State::Eof;
                                return Ok(out);
                            } else {
                                buf[out] = b;
                                out += 1;
                            }
                        }
                        State::Eof | State::Errored(_) => unreachable!(),
                    }
                }
                Err(e) if is_would_block(&e) => {
                    return if out > 0 { Ok(out) } else { Err(e) };
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn register_callback(&mut self, action: Action) {
        self.source.register_callback(action);
    }

    fn close(self: Box<Self>) {
        if self.mode == NaiveDecoderMode::Adopt {
            self.source.close();
        }
    }
}

impl ByteStreamV2 for NaiveDecoder {
    fn remaining(&self) -> io::Result<usize> {
        Err(StreamError::unsupported("naive decoder has no known frame length").into())
    }

    // The decoder reads its source exactly one byte past the terminator
    // and no further: there is never anything left over to expose (spec
    // S5: "on decode the DETACH mode leaves no leftover").
    fn leftover_size(&self) -> usize {
        0
    }

    fn leftover_bytes(&self) -> &[u8] {
        &[]
    }

    fn as_v1(self: Box<Self>) -> Box<dyn ByteStream> {
        self
    }
}

/// Encodes a raw byte stream into naive-terminated, escaped wire form.
pub struct NaiveEncoder {
    source: Box<dyn ByteStream>,
    terminator: u8,
    escape: u8,
    escaping_enabled: bool,
    pending: VecDeque<u8>,
    source_eof: bool,
    done: bool,
}

impl NaiveEncoder {
    pub fn new(source: Box<dyn ByteStream>, terminator: u8, escape: u8) -> NaiveEncoder {
        NaiveEncoder {
            source,
            terminator,
            escape,
            escaping_enabled: terminator != escape,
            pending: VecDeque::new(),
            source_eof: false,
            done: false,
        }
    }
}

impl ByteStream for NaiveEncoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut out = 0;
        while out < buf.len() {
            if let Some(b) = self.pending.pop_front() {
                buf[out] = b;
                out += 1;
                continue;
            }
            if self.done {
                break;
            }
            if self.source_eof {
                self.pending.push_back(self.terminator);
                self.done = true;
                continue;
            }

            let mut one = [0u8; 1];
            match self.source.read(&mut one) {
                Ok(0) => {
                    self.source_eof = true;
                }
                Ok(_) => {
                    let b = one[0];
                    if self.escaping_enabled && (b == self.terminator || b == self.escape) {
                        self.pending.push_back(self.escape);
                        self.pending.push_back(b);
                    } else {
                        self.pending.push_back(b);
                    }
                }
                Err(e) if is_would_block(&e) => {
                    return if out > 0 { Ok(out) } else { Err(e) };
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn register_callback(&mut self, action: Action) {
        self.source.register_callback(action);
    }

    fn close(self: Box<Self>) {
        self.source.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::test_support::MemoryStream;

    fn decode_all(mut decoder: NaiveDecoder) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        out
    }

    #[test]
    fn round_trip_with_escaped_bytes() {
        // S5: B containing the terminator and escape bytes round-trips.
        let payload = vec![0x41, 0x00, 0x1b, 0x42];
        let source = MemoryStream::new(payload.clone());
        let encoder = NaiveEncoder::new(Box::new(source), 0x00, 0x1b);
        let mut buf = Vec::new();
        let mut enc = encoder;
        let mut chunk = [0u8; 64];
        loop {
            match enc.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(buf, vec![0x41, 0x1b, 0x00, 0x1b, 0x1b, 0x42, 0x00]);

        let decoder = NaiveDecoder::new(Box::new(MemoryStream::new(buf)), 0x00, 0x1b, NaiveDecoderMode::Detach);
        assert_eq!(decode_all(decoder), payload);
    }

    #[test]
    fn terminator_equal_to_escape_disables_escaping() {
        let source = MemoryStream::new(vec![b'a', b'b', 0x00]);
        let decoder = NaiveDecoder::new(Box::new(source), 0x00, 0x00, NaiveDecoderMode::Detach);
        assert_eq!(decode_all(decoder), b"ab");
    }

    #[test]
    fn adopt_mode_close_cascades_to_the_source() {
        let source = MemoryStream::new(vec![b'a', 0x00]);
        let closed = source.closed_flag();
        let decoder = NaiveDecoder::new(Box::new(source), 0x00, 0x1b, NaiveDecoderMode::Adopt);
        assert!(!*closed.borrow());
        Box::new(decoder).close();
        assert!(*closed.borrow());
    }

    #[test]
    fn detach_mode_close_leaves_the_source_open() {
        let source = MemoryStream::new(vec![b'a', 0x00]);
        let closed = source.closed_flag();
        let decoder = NaiveDecoder::new(Box::new(source), 0x00, 0x1b, NaiveDecoderMode::Detach);
        Box::new(decoder).close();
        assert!(!*closed.borrow());
    }
}
