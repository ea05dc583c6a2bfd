//! `QueueStream` (spec §4.6): a FIFO of byte streams read out as one
//! concatenated stream, plus a termination flag.
//!
//! Grounded on the same `Rc<RefCell<Inner>>` shared-state shape as
//! `coalesce::EventTable`: the tight variant is a single owning handle,
//! the relaxed variant splits consumer and producer into two handles over
//! the same `Inner` so each side can independently signal "I'm done with
//! this" without one outliving what the other still needs.

use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::cell::RefCell;

use crate::action::Action;
use crate::error::is_would_block;
use crate::reactor::Loop;
use crate::stream::ByteStream;

struct Inner {
    loop_: Loop,
    queue: VecDeque<Box<dyn ByteStream>>,
    terminated: bool,
    consumer_closed: bool,
    producer_released: bool,
    /// Set on an `EAGAIN` read, cleared (and the owner's callback posted)
    /// the moment the head stream's own callback fires. Keeps constituent
    /// callbacks from amplifying into more than one QueueStream callback
    /// per dispatch (spec §4.6 "This dedup is mandatory").
    notification_expected: bool,
    latched_error: Option<(io::ErrorKind, String)>,
    callback: Action,
}

type Shared = Rc<RefCell<Inner>>;

/// The consumer-side handle: reads, enqueues, and (for the tight variant)
/// the sole owner. Cheap to clone: every clone shares the same underlying
/// queue and closed-ness, which the Deserializer relies on to hand a
/// decoder a read handle onto the same source it reads from itself.
#[derive(Clone)]
pub struct QueueStream(Shared);

/// The producer-side handle for a relaxed queuestream. Dropping it without
/// calling `release` leaks nothing (Rust reclaims `Inner` normally once
/// both handles are gone) but does delay the queue's drain-on-close until
/// a `release` call actually happens, matching the spec's two-party
/// contract.
pub struct Producer(Shared);

impl QueueStream {
    /// Tight variant: drops (drains and closes every queued stream) as
    /// soon as the consumer closes.
    pub fn new(lp: &Loop) -> QueueStream {
        QueueStream(Self::make(lp, false))
    }

    /// Relaxed variant: draining waits for both the consumer's `close` and
    /// the returned `Producer`'s `release`.
    pub fn new_relaxed(lp: &Loop) -> (QueueStream, Producer) {
        let inner = Self::make(lp, true);
        (QueueStream(inner.clone()), Producer(inner))
    }

    fn make(lp: &Loop, relaxed: bool) -> Shared {
        Rc::new(RefCell::new(Inner {
            loop_: lp.clone(),
            queue: VecDeque::new(),
            terminated: false,
            consumer_closed: false,
            producer_released: !relaxed,
            notification_expected: false,
            latched_error: None,
            callback: Action::noop(),
        }))
    }

    pub fn enqueue(&self, stream: Box<dyn ByteStream>) {
        enqueue(&self.0, stream, false);
    }

    pub fn push(&self, stream: Box<dyn ByteStream>) {
        enqueue(&self.0, stream, true);
    }

    pub fn enqueue_bytes(&self, blob: Vec<u8>) {
        self.enqueue(Box::new(SliceStream::new(blob)));
    }

    pub fn push_bytes(&self, blob: Vec<u8>) {
        self.push(Box::new(SliceStream::new(blob)));
    }

    /// No further streams will be enqueued; a subsequent read of the
    /// exhausted queue returns `0` instead of `EAGAIN`.
    pub fn terminate(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.consumer_closed {
            return;
        }
        inner.terminated = true;
        notify_if_armed(&mut inner, &self.0);
    }

    pub fn closed(&self) -> bool {
        self.0.borrow().consumer_closed
    }

    /// Number of streams currently enqueued (not yet exhausted and popped).
    pub fn len(&self) -> usize {
        self.0.borrow().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and drains all enqueued streams. For the tight variant this
    /// is exactly what `close()` (from `ByteStream`) does; kept as a named
    /// method so owners that never boxed the stream as `dyn ByteStream`
    /// can still close it.
    pub fn queuestream_close(&self) {
        close_consumer(&self.0);
    }
}

impl Producer {
    pub fn release(self) {
        release_producer(&self.0);
    }
}

impl ByteStream for QueueStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_impl(&self.0, buf)
    }

    fn register_callback(&mut self, action: Action) {
        self.0.borrow_mut().callback = action;
    }

    fn close(self: Box<Self>) {
        close_consumer(&self.0);
    }
}

fn enqueue(this: &Shared, stream: Box<dyn ByteStream>, front: bool) {
    let mut inner = this.borrow_mut();
    if inner.consumer_closed {
        drop(inner);
        stream.close();
        return;
    }
    if front {
        inner.queue.push_front(stream);
    } else {
        inner.queue.push_back(stream);
    }
    notify_if_armed(&mut inner, this);
}

fn notify_if_armed(inner: &mut Inner, this: &Shared) {
    if !inner.notification_expected {
        return;
    }
    inner.notification_expected = false;
    let action = inner.callback.clone();
    inner.loop_.execute(action);
    let _ = this;
}

fn read_impl(this: &Shared, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut inner = this.borrow_mut();

        // A straggler reader on a handle that shares this `Inner` with one
        // that already closed it (e.g. a Deserializer's in-flight frame
        // decoder after the Deserializer itself closes) sees clean EOF.
        if inner.consumer_closed {
            return Ok(0);
        }

        if let Some((kind, msg)) = inner.latched_error.clone() {
            return Err(io::Error::new(kind, msg));
        }

        if inner.queue.is_empty() {
            return if inner.terminated {
                Ok(0)
            } else {
                Err(crate::error::would_block())
            };
        }

        match inner.queue.front_mut().unwrap().read(buf) {
            Ok(0) => {
                let done = inner.queue.pop_front().unwrap();
                drop(inner);
                done.close();
                continue;
            }
            Ok(n) => return Ok(n),
            Err(e) if is_would_block(&e) => {
                inner.notification_expected = true;
                let this2 = this.clone();
                inner
                    .queue
                    .front_mut()
                    .unwrap()
                    .register_callback(Action::new(move || notify_if_armed(&mut this2.borrow_mut(), &this2)));
                return Err(e);
            }
            Err(e) => {
                let kind = e.kind();
                let msg = e.to_string();
                inner.latched_error = Some((kind, msg.clone()));
                return Err(io::Error::new(kind, msg));
            }
        }
    }
}

fn close_consumer(this: &Shared) {
    let mut inner = this.borrow_mut();
    if inner.consumer_closed {
        return;
    }
    inner.consumer_closed = true;
    maybe_finalize(&mut inner);
}

fn release_producer(this: &Shared) {
    let mut inner = this.borrow_mut();
    if inner.producer_released {
        return;
    }
    inner.producer_released = true;
    maybe_finalize(&mut inner);
}

fn maybe_finalize(inner: &mut Inner) {
    if inner.consumer_closed && inner.producer_released {
        let drained: Vec<_> = inner.queue.drain(..).collect();
        for s in drained {
            s.close();
        }
    }
}

/// A throwaway stream over an owned blob, used by `enqueue_bytes`/
/// `push_bytes`. Deliberately not exported: the only way to get one is
/// through a `QueueStream`.
struct SliceStream {
    data: io::Cursor<Vec<u8>>,
}

impl SliceStream {
    fn new(data: Vec<u8>) -> SliceStream {
        SliceStream { data: io::Cursor::new(data) }
    }
}

impl ByteStream for SliceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        self.data.read(buf)
    }

    fn register_callback(&mut self, _action: Action) {
        // A blob stream never transitions from not-ready to ready; its
        // entire contents are always immediately available.
    }

    fn close(self: Box<Self>) {}
}
