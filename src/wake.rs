//! The wake-up device (spec §4.2 "Wake-up device").
//!
//! The spec lists three semantically equivalent backends (Linux timerfd,
//! BSD kqueue `EVFILT_TIMER`, pipe fallback). This crate targets Linux only
//! (matching the teacher, whose `sys::epoll`/`sys::eventfd` are themselves
//! Linux-specific), and implements the device with `eventfd(2)` rather than
//! a pipe: a `write` of any nonzero value unblocks the loop's `epoll_wait`
//! exactly like a pipe byte would, with one fd instead of two and without
//! the drain-until-EAGAIN two-sided bookkeeping a pipe needs. See
//! DESIGN.md for the Open Question this resolves.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use log::warn;

use crate::sys::eventfd::EventFd;

/// A thread-safe, signal-handler-safe handle used to interrupt a loop's
/// blocking wait from outside the loop thread.
///
/// `Waker` is `Send + Sync`: its only operations are `eventfd` reads and
/// writes, which the kernel serializes internally, so no user-level lock is
/// needed to share one across threads. This backs both `Loop::wake_up` and
/// `Loop::quit_loop` (spec §5: "the only thread-safe entry points are
/// `quit_loop()`, `wake_up()`, and `issue_notification()`").
#[derive(Clone)]
pub struct Waker {
    fd: Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            fd: Arc::new(EventFd::new()?),
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Cause the loop's blocking wait to return promptly. Spurious
    /// wake-ups are legal and cheap: callers never need to coordinate to
    /// avoid double-waking.
    pub fn wake(&self) {
        let _ = self.fd.write(1);
    }

    /// Drain the counter after epoll reports the waker fd readable. Called
    /// by the loop itself, not by external wakers.
    pub fn drain(&self) {
        // The fd is level-triggered, so another drain (e.g. a concurrent
        // `wake()`/drain race across threads) can beat us to it; that's a
        // spurious wake-up, not an error.
        if let Err(e) = self.fd.read() {
            if e.kind() != io::ErrorKind::WouldBlock {
                warn!("waker drain failed: {e}");
            } else {
                warn!("spurious wake-up: waker fd was readable but already drained");
            }
        }
    }
}
