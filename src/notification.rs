//! Cross-thread signal (spec §4.14): the only other thread-safe entry
//! point besides `Loop::quit_loop`/`Loop::wake_up`, for code that wants its
//! own action invoked on the loop thread rather than just waking it.
//!
//! Grounded on the same `eventfd` pattern as `wake::Waker`. Unlike the
//! waker, a notification's fd is registered directly with the loop's own
//! fd registry, so a write from another thread both carries the signal and
//! wakes the loop's `epoll_wait` in one step: no separate wake-up call is
//! needed.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use crate::action::Action;
use crate::reactor::Loop;
use crate::registry::Ready;
use crate::sys::eventfd::EventFd;

/// Owns the registration on the loop thread. Dropping it unregisters the
/// underlying fd. Not `Send`: it holds a `Loop` handle, which is
/// single-threaded by design. To signal from another thread, clone an
/// [`Issuer`] with [`Notification::issuer`].
pub struct Notification {
    lp: Loop,
    fd: Arc<EventFd>,
}

impl Notification {
    pub fn new(lp: &Loop, action: Action) -> io::Result<Notification> {
        let fd = Arc::new(EventFd::new()?);
        let reader = fd.clone();
        lp.register_level(
            fd.as_raw_fd(),
            Action::new(move || {
                let _ = reader.read();
                action.invoke();
            }),
            Ready::readable(),
        )?;
        Ok(Notification { lp: lp.clone(), fd })
    }

    /// A cheap, `Send + Sync` handle that can issue this notification from
    /// any thread, including a signal handler.
    pub fn issuer(&self) -> Issuer {
        Issuer { fd: self.fd.clone() }
    }
}

impl Drop for Notification {
    fn drop(&mut self) {
        let _ = self.lp.unregister(self.fd.as_raw_fd());
    }
}

/// `Arc<EventFd>` only: safe to hand to another thread because `EventFd`'s
/// read/write take `&self` and the kernel serializes the counter, exactly
/// like `wake::Waker`.
#[derive(Clone)]
pub struct Issuer {
    fd: Arc<EventFd>,
}

impl Issuer {
    /// Safe from any thread or a signal handler. Multiple issues between
    /// dispatches coalesce into a single invocation of the registered
    /// action, since they all add to the same eventfd counter and the loop
    /// only sees one readability edge per drain.
    pub fn issue(&self) {
        let _ = self.fd.write(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn issue_from_another_thread_runs_action_on_loop_thread() {
        let lp = Loop::new().unwrap();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let notice = Notification::new(&lp, Action::new(move || count2.set(count2.get() + 1))).unwrap();

        let remote = notice.issuer();
        let handle = std::thread::spawn(move || remote.issue());
        handle.join().unwrap();

        let lp2 = lp.clone();
        lp.timer_start(lp.now() + 50 * crate::clock::MS as u64, Action::new(move || lp2.quit_loop()));
        lp.run().unwrap();

        assert_eq!(count.get(), 1);
    }
}
