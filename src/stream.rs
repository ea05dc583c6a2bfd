//! The `ByteStream`/`ByteStreamV2`/`Yield` capability objects (spec §3,
//! §4.1, §4.5): "object with a vtable and an opaque receiver" translated
//! as Rust trait objects.
//!
//! The v2-is-a-v1 subtyping the spec describes as "the v1 method table is
//! an initial prefix of v2's" is expressed here the idiomatic way: a
//! supertrait bound (`ByteStreamV2: ByteStream`) plus an explicit
//! `as_v1()` narrowing method, rather than relying on trait-object
//! upcasting coercion — this crate's MSRV predates that language feature,
//! and an explicit method documents the narrowing at every call site
//! instead of it happening implicitly.
//!
//! `Yield::receive` reuses the same `io::Result<Option<T>>` shape as
//! `ByteStream::read`'s `io::Result<usize>`: "not ready" is
//! `Err(WouldBlock)`, not a third enum variant, so every layer in this
//! crate distinguishes retry-later from clean-exhaustion from hard-error
//! through one consistent vocabulary (see DESIGN.md).

use std::io;

use crate::action::Action;

/// Every stream's readiness callback is a *hint*: registering one does not
/// guarantee delivery of data, only that progress might now be possible
/// (spec §4.5). The no-op action is always the implicit default; there is
/// no "no callback registered" state distinct from a no-op callback.
pub trait ByteStream {
    /// Nonblocking read. `Ok(0)` means clean EOF; `Err` with
    /// `ErrorKind::WouldBlock` means retry after the callback fires.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Replace the registered callback. Registering a new action discards
    /// the previous one; this is how composed wrappers propagate their own
    /// registration down to an underlying stream (spec §4.5 "Composition
    /// rule").
    fn register_callback(&mut self, action: Action);

    fn unregister_callback(&mut self) {
        self.register_callback(Action::noop());
    }

    /// Consumes the stream. Must not be called twice on the same
    /// instance; idempotent only from the caller's standpoint in the sense
    /// that it can't be observed failing.
    fn close(self: Box<Self>);
}

/// Adds the leftover-bytes protocol used by decoders that may read past
/// their own logical EOF into a shared upstream buffer (chunked, naive).
pub trait ByteStreamV2: ByteStream {
    /// `Err` with `StreamError::Unsupported` if this stream has no way to
    /// know its remaining length.
    fn remaining(&self) -> io::Result<usize>;

    /// Bytes consumed from the underlying source past this stream's
    /// logical EOF. Only meaningful after `read` has returned `Ok(0)`.
    fn leftover_size(&self) -> usize {
        0
    }

    fn leftover_bytes(&self) -> &[u8] {
        &[]
    }

    /// Narrow to the v1 view. For an implementor with no separate notion
    /// of "the rest of the stream" (it owns everything it reads), this is
    /// just the same trait object re-packaged behind the narrower vtable.
    /// A detaching decoder that stops reading before its source is
    /// exhausted instead returns that untouched source directly, since the
    /// decoder's own `read` has nothing left to report once it reaches its
    /// logical EOF.
    fn as_v1(self: Box<Self>) -> Box<dyn ByteStream>;
}

/// A lazily-produced sequence, used for the Deserializer's sub-stream feed
/// (spec §3 "Yield"). Restartability is not guaranteed: once a `Yield`
/// returns `Ok(None)` or an error, further calls may do anything short of
/// violating memory safety.
pub trait Yield<T> {
    fn receive(&mut self) -> io::Result<Option<T>>;

    fn register_callback(&mut self, action: Action);

    fn unregister_callback(&mut self) {
        self.register_callback(Action::noop());
    }

    fn close(self: Box<Self>);
}


#[cfg(test)]
mod test {
    use super::test_support::MemoryStream;
    use super::*;

    #[test]
    fn memory_stream_reads_then_eof() {
        let mut s = MemoryStream::new(b"hi".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn close_sets_the_flag_exactly_once() {
        let s = MemoryStream::new(Vec::new());
        let flag = s.closed_flag();
        let boxed: Box<dyn ByteStream> = Box::new(s);
        assert!(!*flag.borrow());
        boxed.close();
        assert!(*flag.borrow());
    }
}
