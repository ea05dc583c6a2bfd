//! The event-loop kernel (spec §4.2): timer ordering, fd readiness
//! dispatch, cross-thread wake-ups, deferred destruction, main-loop
//! integration.
//!
//! `Loop` is a cheap `Clone` handle (an `Rc` around the actual state),
//! mirroring how the C original passes an `async_t *` singleton pointer
//! everywhere: every stream and codec in this crate holds a `Loop` clone so
//! it can schedule its own callbacks (spec §9 sanctions translating the
//! pointer-sharing idiom into Rust's native shared-ownership type instead
//! of hand-rolled reference counting).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::action::Action;
use crate::clock::monotonic_now_ns;
use crate::coalesce::{EventHandle, EventTable};
use crate::registry::{FdRegistry, Ready};
use crate::timer::{TimerHandle, TimerWheel, MAX_IO_STARVATION};
use crate::wake::Waker;

struct Inner {
    registry: FdRegistry,
    timers: TimerWheel,
    events: EventTable,
    wound_list: VecDeque<Rc<dyn Any>>,
    recent: Cell<u64>,
}

/// A single-threaded event loop. Clone is cheap (an `Rc` bump); every clone
/// refers to the same underlying loop.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<RefCell<Inner>>,
    waker: Waker,
    quit: Arc<AtomicBool>,
}

impl Loop {
    pub fn new() -> io::Result<Loop> {
        let registry = FdRegistry::new()?;
        let waker = Waker::new()?;

        let lp = Loop {
            inner: Rc::new(RefCell::new(Inner {
                registry,
                timers: TimerWheel::new(),
                events: EventTable::new(),
                wound_list: VecDeque::new(),
                recent: Cell::new(monotonic_now_ns()),
            })),
            waker,
            quit: Arc::new(AtomicBool::new(false)),
        };

        // The waker's fd is level-triggered and only ever needs read
        // interest: its sole purpose is to make epoll_wait return.
        let waker_fd = lp.waker.as_raw_fd();
        let drain_waker = lp.waker.clone();
        lp.inner.borrow_mut().registry.register_level(
            waker_fd,
            Action::new(move || drain_waker.drain()),
            Ready::readable(),
        )?;

        Ok(lp)
    }

    /// Current monotonic nanosecond counter (spec §6).
    pub fn now(&self) -> u64 {
        let t = monotonic_now_ns();
        self.inner.borrow().recent.set(t);
        t
    }

    fn cached_now(&self) -> u64 {
        self.inner.borrow().recent.get()
    }

    // ---- timers -----------------------------------------------------

    pub fn timer_start(&self, expiry_ns: u64, action: Action) -> TimerHandle {
        self.inner.borrow_mut().timers.start(expiry_ns, action)
    }

    /// Must not be called twice, nor after the timer has already fired;
    /// see DESIGN.md for why this crate relaxes that to a no-op instead of
    /// a hazard.
    pub fn timer_cancel(&self, handle: TimerHandle) {
        self.inner.borrow_mut().timers.cancel(handle);
    }

    pub fn execute(&self, action: Action) -> TimerHandle {
        self.inner.borrow_mut().timers.execute(action)
    }

    // ---- coalescing events -------------------------------------------

    pub fn event(&self, action: Action) -> EventHandle {
        self.inner.borrow().events.create(action)
    }

    pub fn event_trigger(&self, handle: EventHandle) {
        let events = self.inner.borrow().events.clone();
        let this = self.clone();
        events.trigger(handle, move |action| this.execute(action));
    }

    pub fn event_cancel(&self, handle: EventHandle) {
        let events = self.inner.borrow().events.clone();
        let this = self.clone();
        events.cancel(handle, move |pending| this.timer_cancel(pending));
    }

    /// Safe to call from inside the event's own action (spec §4.3).
    pub fn event_destroy(&self, handle: EventHandle) {
        let events = self.inner.borrow().events.clone();
        events.destroy(handle);
    }

    // ---- fd registry --------------------------------------------------

    pub fn register(&self, fd: RawFd, action: Action) -> io::Result<()> {
        self.inner.borrow_mut().registry.register(fd, action)
    }

    pub fn register_level(&self, fd: RawFd, action: Action, interest: Ready) -> io::Result<()> {
        self.inner.borrow_mut().registry.register_level(fd, action, interest)
    }

    pub fn modify_level(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.inner.borrow_mut().registry.modify_level(fd, interest)
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.inner.borrow_mut().registry.unregister(fd)
    }

    // ---- deferred destruction ------------------------------------------

    /// Defer `free(obj)` until the current dispatch has completed: `obj` is
    /// kept alive in a FIFO and a single `execute`-scheduled task releases
    /// the head. Since Rust reclaims memory automatically, "freeing" here
    /// just means dropping the last strong reference this crate holds; any
    /// lingering external `Rc` clones keep the value alive exactly as
    /// normal Rust ownership dictates.
    pub fn wound(&self, obj: Rc<dyn Any>) {
        self.inner.borrow_mut().wound_list.push_back(obj);
        let this = self.clone();
        self.execute(Action::new(move || {
            this.inner.borrow_mut().wound_list.pop_front();
        }));
    }

    // ---- cross-thread-safe entry points --------------------------------

    /// Safe from any thread or a signal handler.
    pub fn quit_loop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.waker.wake();
    }

    /// Safe from any thread or a signal handler.
    pub fn wake_up(&self) {
        self.waker.wake();
    }

    pub(crate) fn waker(&self) -> Waker {
        self.waker.clone()
    }

    // ---- integration with an outer reactor ------------------------------

    /// The fd to integrate this loop with an outer poll-based reactor:
    /// whenever it becomes readable, or `now() >= next`, call `poll`.
    pub fn fd(&self) -> RawFd {
        self.inner.borrow().registry_epoll_fd()
    }

    /// A single non-blocking step. Drains due timers and ready fds, then
    /// writes back the next absolute deadline (`u64::MAX` if none).
    pub fn poll(&self, next_deadline: &mut u64) -> io::Result<()> {
        self.dispatch_cycle(Some(Duration::ZERO))?;
        *next_deadline = self.compute_next_deadline();
        Ok(())
    }

    /// Blocking main loop; exits on `quit_loop` or a fatal (non-`EINTR`)
    /// I/O error.
    pub fn run(&self) -> io::Result<()> {
        while !self.quit.load(Ordering::SeqCst) {
            let deadline = self.compute_next_deadline();
            let timeout = self.timeout_until(deadline);
            self.dispatch_cycle(timeout)?;
        }
        self.quit.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// As `run`, but releases a caller-held lock around the blocking I/O
    /// wait so other threads may mutate loop state while holding it (spec
    /// §5). `lock`/`unlock` replace the C API's `(lock, unlock, lock_data)`
    /// triple; Rust closures already close over whatever state they need.
    pub fn run_protected<L, U>(&self, mut lock: L, mut unlock: U) -> io::Result<()>
    where
        L: FnMut(),
        U: FnMut(),
    {
        while !self.quit.load(Ordering::SeqCst) {
            let deadline = self.compute_next_deadline();
            let timeout = self.timeout_until(deadline);

            unlock();
            let wait_result = self
                .inner
                .borrow_mut()
                .registry
                .dispatch(timeout.map(|_| Duration::ZERO));
            lock();

            // The actual blocking happened with the lock released above;
            // `dispatch` with a zero timeout here just drains whatever
            // became ready while unlocked, mirroring the two-phase
            // unlock-wait/lock-dispatch structure of the C original.
            wait_result?;
            self.run_due_timers_and_events();
        }
        self.quit.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run every immediate task and every timer whose expiry is at or
    /// before `deadline_ns`, in order, without actually blocking for I/O.
    /// Used by tests and by callers that want to fast-forward a
    /// deterministic amount of virtual time; if any due timer schedules
    /// more work that is itself due, that work runs too, until the wheel
    /// has nothing left at or before `deadline_ns`.
    pub fn flush(&self, deadline_ns: u64) -> io::Result<()> {
        loop {
            let due = self.inner.borrow_mut().timers.drain_due(deadline_ns, MAX_IO_STARVATION);
            if due.is_empty() {
                return Ok(());
            }
            for action in due {
                action.invoke();
            }
        }
    }

    fn run_due_timers_and_events(&self) {
        let now = self.now();
        loop {
            let due = self.inner.borrow_mut().timers.drain_due(now, MAX_IO_STARVATION);
            if due.is_empty() {
                break;
            }
            for action in due {
                action.invoke();
            }
        }
    }

    fn compute_next_deadline(&self) -> u64 {
        let now = self.cached_now();
        self.inner
            .borrow()
            .timers
            .next_deadline(now)
            .unwrap_or(u64::MAX)
    }

    fn timeout_until(&self, deadline: u64) -> Option<Duration> {
        if deadline == u64::MAX {
            return None;
        }
        let now = self.now();
        if deadline <= now {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_nanos(deadline - now))
        }
    }

    /// One full blocking step: drain up to `MAX_IO_STARVATION` due timers,
    /// then wait for I/O up to `MAX_IO_BURST` ready events (spec §4.2
    /// "Starvation guard").
    fn dispatch_cycle(&self, io_timeout: Option<Duration>) -> io::Result<()> {
        let now = self.now();
        let due = {
            let mut inner = self.inner.borrow_mut();
            inner.timers.drain_due(now, MAX_IO_STARVATION)
        };
        let starved = due.len() == MAX_IO_STARVATION;
        trace!("dispatch_cycle: {} timers due", due.len());
        for action in due {
            action.invoke();
        }

        // If the starvation guard cut off more pending work, don't block
        // on I/O this cycle: loop back around immediately.
        let io_timeout = if starved { Some(Duration::ZERO) } else { io_timeout };

        let n = self.inner.borrow_mut().registry.dispatch(io_timeout)?;
        trace!("dispatch_cycle: {} fd actions fired", n);
        Ok(())
    }
}

impl Inner {
    fn registry_epoll_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.registry.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn flush_runs_timers_in_order() {
        let lp = Loop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let now = lp.now();

        for (delay, idx) in [(10 * crate::clock::MS as u64, 0), (5 * crate::clock::MS as u64, 1), (5 * crate::clock::MS as u64, 2)] {
            let log = log.clone();
            lp.timer_start(now + delay, Action::new(move || log.borrow_mut().push(idx)));
        }

        lp.flush(now + 20 * crate::clock::MS as u64).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 0]);
    }

    #[test]
    fn execute_never_runs_synchronously() {
        let lp = Loop::new().unwrap();
        let ran = Rc::new(StdCell::new(false));
        let ran2 = ran.clone();
        lp.execute(Action::new(move || ran2.set(true)));
        assert!(!ran.get());
        lp.flush(lp.now()).unwrap();
        assert!(ran.get());
    }

    #[test]
    fn quit_loop_stops_run() {
        let lp = Loop::new().unwrap();
        let lp2 = lp.clone();
        lp.execute(Action::new(move || lp2.quit_loop()));
        lp.run().unwrap();
    }

    #[test]
    fn wound_object_survives_current_dispatch() {
        let lp = Loop::new().unwrap();
        let marker = Rc::new(StdCell::new(1));
        let weak = Rc::downgrade(&marker);
        lp.wound(marker.clone());
        drop(marker);
        // Still alive immediately after wound(): the dispatch that created
        // it hasn't completed yet.
        assert!(weak.upgrade().is_some());
        lp.flush(lp.now()).unwrap();
        assert!(weak.upgrade().is_none());
    }
}
