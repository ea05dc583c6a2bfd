//! Chunked transfer decoder/encoder (spec §4.8/§4.9): an explicit
//! per-input-byte state machine, for the same pause/resume-on-`EAGAIN`
//! reason as `naive`'s framer.
//!
//! The spec's eleven named states collapse into this module's `Stage`:
//! `READING_TRAILER_SKIP` is just `ReadingExtensions { value: 0 }` reused,
//! and the `_CR` variants (`READING_CHUNK_TERMINATOR_CR`,
//! `READING_TRAILER_CR`) disappear entirely, since the spec's own open
//! question notes LF-only acceptance (no required preceding CR) is the
//! intended lenient behaviour on input — a dedicated CR sub-state adds
//! nothing once CR is just another byte to ignore while scanning for LF.

use std::collections::VecDeque;
use std::io;

use crate::action::Action;
use crate::error::{is_would_block, StreamError};
use crate::stream::{ByteStream, ByteStreamV2};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkDecoderMode {
    DetachAtTrailer,
    DetachAfterTrailer,
    AdoptInput,
    DetachAtFinalExtensions,
}

#[derive(Clone, Debug)]
enum Stage {
    ReadingLength { value: u64, any_digit: bool },
    /// Scans to LF discarding content; `value == 0` means this is the
    /// final chunk's line (covers extensions, the chunk-data terminator,
    /// and trailer-field skipping alike).
    ReadingExtensions { value: u64 },
    ReadingChunkData { remaining: u64 },
    /// The CRLF after a non-final chunk's data, before the next chunk's
    /// length line. Distinct from `ReadingExtensions { value: 0 }`, which
    /// is the *final* chunk's own length-line tail and has different
    /// continuations per mode.
    ReadingChunkTerminator,
    /// Start of a trailer line: `final_terminator_capture` distinguishes
    /// `DetachAtFinalExtensions`, which must stop before consuming this
    /// line's own CRLF rather than skip into the trailer.
    ReadingTrailer,
    /// `DetachAtFinalExtensions` only: the final chunk's CRLF is captured
    /// into `leftover` instead of discarded, since this mode's logical
    /// EOF sits exactly at the start of that CRLF.
    CapturingFinalTerminator,
    ReadingExhaustedCheckEof,
    Exhausted,
    Errored(StreamError),
}

pub struct ChunkDecoder {
    source: Box<dyn ByteStream>,
    mode: ChunkDecoderMode,
    stage: Stage,
    leftover: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new(source: Box<dyn ByteStream>, mode: ChunkDecoderMode) -> ChunkDecoder {
        ChunkDecoder {
            source,
            mode,
            stage: Stage::ReadingLength { value: 0, any_digit: false },
            leftover: Vec::new(),
        }
    }

    /// Applies one input byte, advancing `self.stage`.
    fn step(&mut self, b: u8) {
        self.stage = match std::mem::replace(&mut self.stage, Stage::Exhausted) {
            Stage::ReadingLength { value, any_digit } => match hex_value(b) {
                Some(d) => match value.checked_mul(16).and_then(|v| v.checked_add(d as u64)) {
                    Some(v) => Stage::ReadingLength { value: v, any_digit: true },
                    None => Stage::Errored(StreamError::malformed("chunk length overflow")),
                },
                None if !any_digit => Stage::Errored(StreamError::malformed("chunk line has no length digits")),
                None if b == b';' || b == b'\r' || b == b'\n' => self.extension_byte(value, b),
                None => Stage::Errored(StreamError::malformed("invalid chunk length digit")),
            },
            Stage::ReadingExtensions { value } => self.extension_byte(value, b),
            Stage::CapturingFinalTerminator => {
                self.leftover.push(b);
                if b == b'\n' {
                    Stage::Exhausted
                } else {
                    Stage::CapturingFinalTerminator
                }
            }
            Stage::ReadingChunkTerminator => {
                if b == b'\n' {
                    Stage::ReadingLength { value: 0, any_digit: false }
                } else {
                    Stage::ReadingChunkTerminator
                }
            }
            Stage::ReadingTrailer => {
                if b == b'\n' {
                    // Only ADOPT_INPUT needs to confirm the underlying
                    // stream ends where the chunked encoding does; every
                    // other mode detaches here without touching the
                    // source again.
                    if self.mode == ChunkDecoderMode::AdoptInput {
                        Stage::ReadingExhaustedCheckEof
                    } else {
                        Stage::Exhausted
                    }
                } else if b == b'\r' {
                    Stage::ReadingTrailer
                } else {
                    Stage::ReadingExtensions { value: 0 }
                }
            }
            other => other,
        };
    }

    /// Handles one byte once the line's length digits are behind us: either
    /// discards it while scanning for the line's `\n` (the ordinary case),
    /// or, for `DetachAtFinalExtensions` on the zero-length line, captures
    /// it into `leftover` instead, since this mode's logical EOF sits right
    /// after the length digits and everything past that point belongs to
    /// the caller, not to us.
    fn extension_byte(&mut self, value: u64, b: u8) -> Stage {
        if value == 0 && self.mode == ChunkDecoderMode::DetachAtFinalExtensions {
            self.leftover.push(b);
            if b == b'\n' {
                Stage::Exhausted
            } else {
                Stage::CapturingFinalTerminator
            }
        } else if b == b'\n' {
            self.line_ended(value)
        } else {
            Stage::ReadingExtensions { value }
        }
    }

    fn line_ended(&self, value: u64) -> Stage {
        if value > 0 {
            return Stage::ReadingChunkData { remaining: value };
        }
        match self.mode {
            ChunkDecoderMode::DetachAtTrailer => Stage::Exhausted,
            ChunkDecoderMode::DetachAfterTrailer | ChunkDecoderMode::AdoptInput => Stage::ReadingTrailer,
            ChunkDecoderMode::DetachAtFinalExtensions => {
                unreachable!("DetachAtFinalExtensions captures its terminator before this point")
            }
        }
    }
}

impl ByteStream for ChunkDecoder {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut out = 0;
        loop {
            match &self.stage {
                Stage::Exhausted => return Ok(out),
                Stage::Errored(e) => return if out > 0 { Ok(out) } else { Err(e.clone().into()) },
                _ => {}
            }
            if out == buf.len() {
                return Ok(out);
            }

            if let Stage::ReadingChunkData { remaining } = self.stage {
                if remaining == 0 {
                    self.stage = Stage::ReadingChunkTerminator;
                    continue;
                }
                let want = std::cmp::min(remaining, (buf.len() - out) as u64) as usize;
                match self.source.read(&mut buf[out..out + want]) {
                    Ok(0) => {
                        self.stage = Stage::Errored(StreamError::malformed("chunk data truncated"));
                        continue;
                    }
                    Ok(n) => {
                        out += n;
                        self.stage = Stage::ReadingChunkData { remaining: remaining - n as u64 };
                        continue;
                    }
                    Err(e) if is_would_block(&e) => return if out > 0 { Ok(out) } else { Err(e) },
                    Err(e) => return Err(e),
                }
            }

            if let Stage::ReadingExhaustedCheckEof = self.stage {
                let mut probe = [0u8; 1];
                match self.source.read(&mut probe) {
                    Ok(0) => {
                        self.stage = Stage::Exhausted;
                        continue;
                    }
                    Ok(_) => {
                        self.stage = if self.mode == ChunkDecoderMode::AdoptInput {
                            Stage::Errored(StreamError::malformed("trailing bytes after chunked body"))
                        } else {
                            Stage::Exhausted
                        };
                        continue;
                    }
                    Err(e) if is_would_block(&e) => return if out > 0 { Ok(out) } else { Err(e) },
                    Err(e) => return Err(e),
                }
            }

            let mut one = [0u8; 1];
            match self.source.read(&mut one) {
                Ok(0) => {
                    self.stage = Stage::Errored(StreamError::malformed("source ended mid chunk framing"));
                    continue;
                }
                Ok(_) => self.step(one[0]),
                Err(e) if is_would_block(&e) => return if out > 0 { Ok(out) } else { Err(e) },
                Err(e) => return Err(e),
            }
        }
    }

    fn register_callback(&mut self, action: Action) {
        self.source.register_callback(action);
    }

    fn close(self: Box<Self>) {
        if self.mode == ChunkDecoderMode::AdoptInput {
            self.source.close();
        }
    }
}

impl ByteStreamV2 for ChunkDecoder {
    fn remaining(&self) -> io::Result<usize> {
        match self.stage {
            Stage::ReadingChunkData { remaining } => Ok(remaining as usize),
            _ => Err(StreamError::unsupported("chunk length unknown outside a chunk").into()),
        }
    }

    fn leftover_size(&self) -> usize {
        self.leftover.len()
    }

    fn leftover_bytes(&self) -> &[u8] {
        &self.leftover
    }

    // Detaching modes stop interpreting chunk framing with the source's
    // remainder untouched; handing the caller `self.source` directly (not
    // `self`) is what lets it keep reading that remainder raw, since this
    // decoder's own `read` never leaves the Exhausted state once reached.
    fn as_v1(self: Box<Self>) -> Box<dyn ByteStream> {
        self.source
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

pub const MIN_CHUNK_SIZE: usize = 1;
pub const MAX_CHUNK_SIZE: usize = 8192;
const MAX_LENGTH_LENGTH: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChunkTermination {
    Simple,
    StopAtTrailer,
    StopAtFinalExtensions,
}

/// Encodes a raw byte stream as RFC 7230 chunked transfer encoding.
pub struct ChunkEncoder {
    source: Box<dyn ByteStream>,
    chunk_size: usize,
    termination: ChunkTermination,
    pending: VecDeque<u8>,
    source_eof: bool,
    done: bool,
}

impl ChunkEncoder {
    pub fn new(source: Box<dyn ByteStream>, chunk_size: usize, termination: ChunkTermination) -> ChunkEncoder {
        ChunkEncoder {
            source,
            chunk_size: chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE),
            termination,
            pending: VecDeque::new(),
            source_eof: false,
            done: false,
        }
    }
}

impl ByteStream for ChunkEncoder {
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
                let tail: &[u8] = match self.termination {
                    ChunkTermination::Simple => b"0\r\n\r\n",
                    ChunkTermination::StopAtTrailer => b"0\r\n",
                    ChunkTermination::StopAtFinalExtensions => b"0",
                };
                self.pending.extend(tail.iter().copied());
                self.done = true;
                continue;
            }

            let mut scratch = vec![0u8; self.chunk_size];
            match self.source.read(&mut scratch) {
                Ok(0) => self.source_eof = true,
                Ok(n) => {
                    scratch.truncate(n);
                    self.pending.extend(format_chunk(&scratch));
                }
                Err(e) if is_would_block(&e) => return if out > 0 { Ok(out) } else { Err(e) },
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

/// Formats one `hex-length CRLF data CRLF` chunk. The length is written
/// backwards into a fixed-size prefix so the common case (one bulk copy of
/// `data`, no intermediate `Vec` for the digits) never reallocates.
fn format_chunk(data: &[u8]) -> Vec<u8> {
    let mut prefix = [0u8; MAX_LENGTH_LENGTH];
    let mut pos = MAX_LENGTH_LENGTH;
    let mut n = data.len() as u64;
    if n == 0 {
        pos -= 1;
        prefix[pos] = b'0';
    } else {
        while n > 0 {
            pos -= 1;
            prefix[pos] = hex_digit((n & 0xf) as u8);
            n >>= 4;
        }
    }

    let mut out = Vec::with_capacity((MAX_LENGTH_LENGTH - pos) + 2 + data.len() + 2);
    out.extend_from_slice(&prefix[pos..]);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn hex_digit(v: u8) -> u8 {
    match v {
        0..=9 => b'0' + v,
        _ => b'a' + (v - 10),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::test_support::MemoryStream;

    fn read_all(mut s: Box<dyn ByteStream>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match s.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        out
    }

    #[test]
    fn round_trip_with_adopt_input() {
        // S3: encode with chunk_size=30/SIMPLE, decode with ADOPT_INPUT,
        // recover the exact input followed by EOF.
        let payload = b"SMS Prinzregent Luitpold was a German Navy battleship.".to_vec();
        let encoder = ChunkEncoder::new(Box::new(MemoryStream::new(payload.clone())), 30, ChunkTermination::Simple);
        let wire = read_all(Box::new(encoder));
        assert!(wire.windows(2).any(|w| w == b"\r\n"));

        let decoder = ChunkDecoder::new(Box::new(MemoryStream::new(wire)), ChunkDecoderMode::AdoptInput);
        assert_eq!(read_all(Box::new(decoder)), payload);
    }

    #[test]
    fn detach_at_trailer_exposes_the_trailer_as_leftover_prefix() {
        // S4: encode with STOP_AT_TRAILER, append a trailer, decode with
        // DETACH_AT_TRAILER; leftover_bytes() + remaining source == trailer.
        let payload = b"abc".to_vec();
        let encoder = ChunkEncoder::new(Box::new(MemoryStream::new(payload)), 30, ChunkTermination::StopAtTrailer);
        let mut wire = read_all(Box::new(encoder));
        let trailer = b"One: one\r\nTwo: one \r\n\ttwo\r\nThree: three\r\n\r\n".to_vec();
        wire.extend_from_slice(&trailer);

        let mut decoder = ChunkDecoder::new(Box::new(MemoryStream::new(wire)), ChunkDecoderMode::DetachAtTrailer);
        let mut buf = [0u8; 64];
        let n = decoder.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(decoder.read(&mut buf).unwrap(), 0);

        let mut reproduced = decoder.leftover_bytes().to_vec();
        let boxed: Box<dyn ByteStreamV2> = Box::new(decoder);
        reproduced.extend_from_slice(&read_all(boxed.as_v1()));
        assert_eq!(reproduced, trailer);
    }

    #[test]
    fn detach_after_trailer_consumes_the_trailer_and_leaves_what_follows_untouched() {
        // DETACH_AFTER_TRAILER must read out the trailer itself (unlike
        // DETACH_AT_TRAILER) but stop dead at its final CRLF: nothing past
        // that point should ever be pulled from the source.
        let payload = b"xyz".to_vec();
        let encoder = ChunkEncoder::new(Box::new(MemoryStream::new(payload.clone())), 30, ChunkTermination::StopAtTrailer);
        let mut wire = read_all(Box::new(encoder));
        wire.extend_from_slice(b"One: one\r\n\r\n");
        let next_message = b"next pipelined request".to_vec();
        wire.extend_from_slice(&next_message);

        let mut decoder = ChunkDecoder::new(Box::new(MemoryStream::new(wire)), ChunkDecoderMode::DetachAfterTrailer);
        let mut buf = [0u8; 64];
        let n = decoder.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyz");
        assert_eq!(decoder.read(&mut buf).unwrap(), 0);
        assert_eq!(decoder.leftover_bytes(), b"" as &[u8]);

        let boxed: Box<dyn ByteStreamV2> = Box::new(decoder);
        assert_eq!(read_all(boxed.as_v1()), next_message);
    }

    #[test]
    fn detach_at_final_extensions_captures_everything_after_the_zero_digit_as_leftover() {
        // DETACH_AT_FINAL_EXTENSIONS terminates right after the final
        // chunk's length digits; the extensions and CRLF that follow are
        // exposed as leftover, and bare "0\n" with no extensions (the
        // lenient no-CR case) must not panic.
        let payload = b"hey".to_vec();
        let encoder = ChunkEncoder::new(Box::new(MemoryStream::new(payload.clone())), 30, ChunkTermination::StopAtFinalExtensions);
        let mut wire = read_all(Box::new(encoder));
        assert_eq!(wire.last(), Some(&b'0'));
        let tail = b";ext=1\r\n".to_vec();
        wire.extend_from_slice(&tail);
        let after = b"whatever follows is untouched".to_vec();
        wire.extend_from_slice(&after);

        let mut decoder = ChunkDecoder::new(Box::new(MemoryStream::new(wire)), ChunkDecoderMode::DetachAtFinalExtensions);
        let mut buf = [0u8; 64];
        let n = decoder.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hey");
        assert_eq!(decoder.read(&mut buf).unwrap(), 0);
        assert_eq!(decoder.leftover_bytes(), tail.as_slice());

        let boxed: Box<dyn ByteStreamV2> = Box::new(decoder);
        assert_eq!(read_all(boxed.as_v1()), after);
    }

    #[test]
    fn detach_at_final_extensions_accepts_bare_lf_with_no_extensions() {
        // Lenient input: "0\n" with neither a preceding CR nor any
        // extensions must decode without panicking, leaving just the LF
        // itself as leftover.
        let src = MemoryStream::new(b"3\r\nhey\r\n0\n".to_vec());
        let mut decoder = ChunkDecoder::new(Box::new(src), ChunkDecoderMode::DetachAtFinalExtensions);
        let mut buf = [0u8; 64];
        let n = decoder.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hey");
        assert_eq!(decoder.read(&mut buf).unwrap(), 0);
        assert_eq!(decoder.leftover_bytes(), b"\n" as &[u8]);
    }

    #[test]
    fn overflowing_chunk_length_errors() {
        let src = MemoryStream::new(b"ffffffffffffffffff\r\n".to_vec());
        let mut decoder = ChunkDecoder::new(Box::new(src), ChunkDecoderMode::AdoptInput);
        let mut buf = [0u8; 8];
        let err = decoder.read(&mut buf).unwrap_err();
        assert_eq!(crate::error::downcast_stream_error(&err), Some(StreamError::malformed("chunk length overflow")));
    }
}
