//! The protocol-level error taxonomy (spec §7).
//!
//! `EAGAIN` and clean exhaustion are never represented here: they stay
//! in-band as `io::ErrorKind::WouldBlock` and `Ok(0)`/`Readiness::Done`.
//! `StreamError` only covers the terminal, latchable conditions a decoder
//! or framer can run into.

use std::io;

use thiserror::Error;

/// Terminal error conditions raised by the codec and buffering layers.
///
/// These convert into `io::Error` at the `ByteStream` boundary so that
/// every stream in a pipeline can be driven through the same
/// `io::Result<usize>` surface regardless of which layer failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Upstream violated the encoding this layer is decoding.
    #[error("malformed input: {0}")]
    Malformed(&'static str),

    /// A frame or chunk length exceeded what the consumer is willing to
    /// buffer, or arithmetic used to parse a length overflowed.
    #[error("frame too large: {0}")]
    Overflow(&'static str),

    /// The capability was requested on a stream that cannot provide it
    /// (e.g. `remaining()` on a stream with no known length).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl StreamError {
    pub fn malformed(msg: &'static str) -> StreamError {
        StreamError::Malformed(msg)
    }

    pub fn overflow(msg: &'static str) -> StreamError {
        StreamError::Overflow(msg)
    }

    pub fn unsupported(msg: &'static str) -> StreamError {
        StreamError::Unsupported(msg)
    }

    /// The errno-style code this variant corresponds to, per spec §7's
    /// taxonomy table. Exposed for callers bridging to C-like error
    /// reporting; Rust code should match on the enum itself.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            StreamError::Malformed(_) => libc::EPROTO,
            StreamError::Overflow(_) => libc::EMSGSIZE,
            StreamError::Unsupported(_) => libc::ENOTSUP,
        }
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> io::Error {
        let code = err.raw_os_error();
        io::Error::new(io::ErrorKind::Other, IoTaggedError { code, err })
    }
}

/// Wraps a `StreamError` inside an `io::Error` while preserving the errno
/// that a caller inspecting `raw_os_error()`-like context would expect.
#[derive(Debug)]
struct IoTaggedError {
    code: i32,
    err: StreamError,
}

impl std::fmt::Display for IoTaggedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (errno {})", self.err, self.code)
    }
}

impl std::error::Error for IoTaggedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

/// Build an `io::Error` carrying `EAGAIN`/`WouldBlock`, the in-band
/// "not ready, retry after the next callback" signal used throughout the
/// stream contract (spec §4.5).
pub fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

pub fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Recovers the `StreamError` behind an `io::Error` produced by `From<StreamError>`,
/// for call sites (mostly tests) that want to assert on the specific variant
/// rather than just the message.
pub fn downcast_stream_error(err: &io::Error) -> Option<StreamError> {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<IoTaggedError>())
        .map(|tagged| tagged.err.clone())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_error_maps_to_expected_errno() {
        assert_eq!(StreamError::malformed("x").raw_os_error(), libc::EPROTO);
        assert_eq!(StreamError::overflow("x").raw_os_error(), libc::EMSGSIZE);
        assert_eq!(StreamError::unsupported("x").raw_os_error(), libc::ENOTSUP);
    }

    #[test]
    fn would_block_round_trips() {
        let err = would_block();
        assert!(is_would_block(&err));
        assert!(!is_would_block(&io::Error::new(io::ErrorKind::Other, "x")));
    }
}
