//! Deserializer (spec §4.7): adapts one underlying byte stream into a
//! `Yield` of sub-streams, each produced by a user-supplied decoder
//! factory. Grounded on `QueueStream` for the leftover-bytes pushback:
//! the source is wrapped in a `QueueStream` so a frame's over-read bytes
//! can be prepended back onto it atomically via `push_bytes`.
//!
//! ```text
//!  CLEAN_BREAK ──peek 1 byte──► open decoder ──► FRAME_OPEN
//!     │                                              │
//!     └─EOF──► EOF                    user close, reached EOF: AFTER_FRAME
//!                                      user close, not yet EOF: SKIPPING_FRAME
//!                                              │
//!                                  (push leftover back, close decoder)
//!                                              ▼
//!                                         CLEAN_BREAK
//! ```
//!
//! The spec's CLEAN_BREAK/READING_FRAME/AFTER_FRAME/SKIPPING_FRAME states
//! are collapsed here to `CleanBreak`/`FrameOpen`/`Eof` on the
//! `Deserializer` itself: AFTER_FRAME and SKIPPING_FRAME are transient,
//! handled entirely inside the `close()` codepath rather than persisted,
//! since ownership of the live decoder moves to the caller's `Frame`
//! handle the moment `receive()` returns it.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::action::Action;
use crate::error::{is_would_block, would_block, StreamError};
use crate::queue_stream::QueueStream;
use crate::reactor::Loop;
use crate::stream::{ByteStream, ByteStreamV2, Yield};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    CleanBreak,
    FrameOpen,
    Eof,
}

struct Inner {
    loop_: Loop,
    source: QueueStream,
    factory: Box<dyn Fn(QueueStream) -> Box<dyn ByteStreamV2>>,
    state: State,
    callback: Action,
}

type Shared = Rc<RefCell<Inner>>;

pub struct Deserializer(Shared);

impl Deserializer {
    pub fn new<F>(lp: &Loop, source: Box<dyn ByteStream>, factory: F) -> Deserializer
    where
        F: Fn(QueueStream) -> Box<dyn ByteStreamV2> + 'static,
    {
        let queue = QueueStream::new(lp);
        queue.enqueue(source);
        queue.terminate();
        Deserializer(Rc::new(RefCell::new(Inner {
            loop_: lp.clone(),
            source: queue,
            factory: Box::new(factory),
            state: State::CleanBreak,
            callback: Action::noop(),
        })))
    }
}

impl Yield<Box<dyn ByteStreamV2>> for Deserializer {
    fn receive(&mut self) -> io::Result<Option<Box<dyn ByteStreamV2>>> {
        receive_impl(&self.0)
    }

    fn register_callback(&mut self, action: Action) {
        let mut inner = self.0.borrow_mut();
        inner.source.register_callback(action.clone());
        inner.callback = action;
    }

    fn close(self: Box<Self>) {
        let mut inner = self.0.borrow_mut();
        inner.state = State::Eof;
        let source = inner.source.clone();
        drop(inner);
        Box::new(source).close();
    }
}

fn receive_impl(this: &Shared) -> io::Result<Option<Box<dyn ByteStreamV2>>> {
    let mut inner = this.borrow_mut();
    match inner.state {
        State::Eof => return Ok(None),
        State::FrameOpen => return Err(would_block()),
        State::CleanBreak => {}
    }

    let mut peek = [0u8; 1];
    match inner.source.read(&mut peek) {
        Ok(0) => {
            inner.state = State::Eof;
            Ok(None)
        }
        Ok(_) => {
            inner.source.push_bytes(peek.to_vec());
            let decoder = (inner.factory)(inner.source.clone());
            inner.state = State::FrameOpen;
            Ok(Some(Box::new(Frame {
                decoder: Some(decoder),
                reached_eof: false,
                parent: this.clone(),
            }) as Box<dyn ByteStreamV2>))
        }
        Err(e) => Err(e),
    }
}

/// The live sub-stream handed out by `receive()`. Owns the decoder;
/// reports back to the Deserializer only on `close()`, which is when the
/// spec's AFTER_FRAME/SKIPPING_FRAME housekeeping happens.
struct Frame {
    decoder: Option<Box<dyn ByteStreamV2>>,
    reached_eof: bool,
    parent: Shared,
}

impl ByteStream for Frame {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let decoder = self
            .decoder
            .as_mut()
            .expect("Frame::read called after the frame was closed");
        let n = decoder.read(buf)?;
        if n == 0 {
            self.reached_eof = true;
        }
        Ok(n)
    }

    fn register_callback(&mut self, action: Action) {
        if let Some(decoder) = &mut self.decoder {
            decoder.register_callback(action);
        }
    }

    fn close(self: Box<Self>) {
        let Frame {
            decoder,
            reached_eof,
            parent,
        } = *self;
        let decoder = decoder.expect("Frame::close called twice");
        if reached_eof {
            finish_frame(&parent, decoder);
        } else {
            drive_skip(parent, Rc::new(RefCell::new(Some(decoder))));
        }
    }
}

impl ByteStreamV2 for Frame {
    fn remaining(&self) -> io::Result<usize> {
        match &self.decoder {
            Some(d) => d.remaining(),
            None => Err(StreamError::unsupported("frame already closed").into()),
        }
    }

    fn leftover_size(&self) -> usize {
        self.decoder.as_ref().map_or(0, |d| d.leftover_size())
    }

    fn leftover_bytes(&self) -> &[u8] {
        self.decoder.as_ref().map_or(&[], |d| d.leftover_bytes())
    }

    fn as_v1(self: Box<Self>) -> Box<dyn ByteStream> {
        self
    }
}

/// Drain `decoder` to EOF, discarding bytes, resuming via its own
/// callback across `EAGAIN`s (the Deserializer's SKIPPING_FRAME state).
fn drive_skip(parent: Shared, cell: Rc<RefCell<Option<Box<dyn ByteStreamV2>>>>) {
    let mut scratch = [0u8; 4096];
    loop {
        let mut guard = cell.borrow_mut();
        let decoder = guard.as_mut().expect("drive_skip reentered after completion");
        match decoder.read(&mut scratch) {
            Ok(0) => {
                drop(guard);
                let decoder = cell.borrow_mut().take().unwrap();
                finish_frame(&parent, decoder);
                return;
            }
            Ok(_) => continue,
            Err(e) if is_would_block(&e) => {
                let parent2 = parent.clone();
                let cell2 = cell.clone();
                decoder.register_callback(Action::new(move || drive_skip(parent2.clone(), cell2.clone())));
                return;
            }
            Err(_) => {
                drop(guard);
                *cell.borrow_mut() = None;
                back_to_clean_break(&parent);
                return;
            }
        }
    }
}

fn finish_frame(parent: &Shared, decoder: Box<dyn ByteStreamV2>) {
    let leftover = decoder.leftover_bytes().to_vec();
    decoder.close();
    let mut inner = parent.borrow_mut();
    if !leftover.is_empty() {
        inner.source.push_bytes(leftover);
    }
    inner.state = State::CleanBreak;
    let callback = inner.callback.clone();
    let loop_ = inner.loop_.clone();
    drop(inner);
    loop_.execute(callback);
}

fn back_to_clean_break(parent: &Shared) {
    let mut inner = parent.borrow_mut();
    inner.state = State::CleanBreak;
    let callback = inner.callback.clone();
    let loop_ = inner.loop_.clone();
    drop(inner);
    loop_.execute(callback);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::naive::{NaiveDecoder, NaiveDecoderMode};
    use crate::stream::test_support::MemoryStream;

    fn naive_factory(terminator: u8, escape: u8) -> impl Fn(QueueStream) -> Box<dyn ByteStreamV2> {
        move |source| Box::new(NaiveDecoder::new(Box::new(source), terminator, escape, NaiveDecoderMode::Detach))
    }

    #[test]
    fn yields_one_frame_per_terminator() {
        let lp = Loop::new().unwrap();
        let source = MemoryStream::new(b"abc\x00def\x00".to_vec());
        let mut deser = Deserializer::new(&lp, Box::new(source), naive_factory(0x00, 0x1b));

        let mut frame = deser.receive().unwrap().expect("first frame");
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            match frame.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(out, b"abc");
        frame.close();

        let mut frame2 = deser.receive().unwrap().expect("second frame");
        out = Vec::new();
        loop {
            match frame2.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(out, b"def");
        frame2.close();

        assert!(deser.receive().unwrap().is_none());
    }

    #[test]
    fn second_receive_before_close_is_would_block() {
        let lp = Loop::new().unwrap();
        let source = MemoryStream::new(b"abc\x00".to_vec());
        let mut deser = Deserializer::new(&lp, Box::new(source), naive_factory(0x00, 0x1b));
        let _frame = deser.receive().unwrap().unwrap();
        let err = match deser.receive() {
            Err(e) => e,
            Ok(_) => panic!("expected Err(WouldBlock)"),
        };
        assert!(is_would_block(&err));
    }
}
