//! The coalescing `Event` API (spec §4.2 `event`/`event_trigger`/
//! `event_cancel`/`event_destroy`, state machine in §4.3).
//!
//! ```text
//!   IDLE ──trigger──► TRIGGERED ──dispatch──► IDLE
//!    │                  │
//!    │                  └─cancel──► CANCELED ──dispatch──► IDLE
//!    │                                  │
//!    │                                  └─trigger──► TRIGGERED
//!    └─destroy──► (freed)   TRIGGERED/CANCELED ─destroy──► ZOMBIE ─dispatch──► (freed)
//! ```
//!
//! Multiple triggers between dispatches coalesce into a single invocation,
//! which is why this needs its own small state machine rather than just
//! posting a fresh `Action` through `TimerWheel::execute` on every trigger.

use slab::Slab;
use std::cell::RefCell;
use std::rc::Rc;

use crate::action::Action;
use crate::timer::TimerHandle;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Triggered,
    Canceled,
    Zombie,
}

struct Cell {
    action: Action,
    state: State,
    /// The pending `TimerWheel::execute` handle backing a TRIGGERED state,
    /// so a `cancel` that arrives before dispatch can withdraw it.
    pending: Option<TimerHandle>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(usize);

/// Owns the slab of coalescing events for one `Loop`. Lives behind an `Rc`
/// so the `Action` posted into the timer wheel on `trigger()` can reach
/// back in to flip the slot's state to IDLE/freed on dispatch without the
/// event objects themselves needing a reference to the whole `Loop`.
#[derive(Clone)]
pub struct EventTable(Rc<RefCell<Slab<Cell>>>);

impl EventTable {
    pub fn new() -> EventTable {
        EventTable(Rc::new(RefCell::new(Slab::new())))
    }

    pub fn create(&self, action: Action) -> EventHandle {
        let key = self.0.borrow_mut().insert(Cell {
            action,
            state: State::Idle,
            pending: None,
        });
        EventHandle(key)
    }

    /// Trigger the event. If it was already TRIGGERED, this is a no-op
    /// (coalescing); if CANCELED, re-arms it for dispatch. `schedule`
    /// posts the dispatch action through the owning loop's `execute`.
    pub fn trigger(&self, handle: EventHandle, schedule: impl FnOnce(Action) -> TimerHandle) {
        let mut table = self.0.borrow_mut();
        let Some(cell) = table.get_mut(handle.0) else {
            return;
        };
        match cell.state {
            State::Triggered => {}
            State::Idle | State::Canceled => {
                cell.state = State::Triggered;
                drop(table);
                let this = self.clone();
                let pending = schedule(Action::new(move || this.dispatch(handle)));
                if let Some(cell) = self.0.borrow_mut().get_mut(handle.0) {
                    cell.pending = Some(pending);
                }
            }
            State::Zombie => {}
        }
    }

    /// Withdraw a pending invocation without running it.
    pub fn cancel(&self, handle: EventHandle, unschedule: impl FnOnce(TimerHandle)) {
        let mut table = self.0.borrow_mut();
        let Some(cell) = table.get_mut(handle.0) else {
            return;
        };
        if cell.state == State::Triggered {
            cell.state = State::Canceled;
            if let Some(pending) = cell.pending.take() {
                drop(table);
                unschedule(pending);
            }
        }
    }

    /// Destroy the event. Safe to call from inside the event's own action:
    /// if a dispatch for this handle is in flight, the slot becomes ZOMBIE
    /// and is reclaimed when that dispatch runs instead of being removed
    /// out from under it.
    pub fn destroy(&self, handle: EventHandle) {
        let mut table = self.0.borrow_mut();
        let Some(cell) = table.get_mut(handle.0) else {
            return;
        };
        match cell.state {
            State::Idle => {
                table.remove(handle.0);
            }
            State::Triggered | State::Canceled => {
                cell.state = State::Zombie;
            }
            State::Zombie => {}
        }
    }

    fn dispatch(&self, handle: EventHandle) {
        let (action, zombie) = {
            let mut table = self.0.borrow_mut();
            let Some(cell) = table.get_mut(handle.0) else {
                return;
            };
            cell.pending = None;
            match cell.state {
                State::Triggered => {
                    cell.state = State::Idle;
                    (Some(cell.action.clone()), false)
                }
                State::Canceled => {
                    cell.state = State::Idle;
                    (None, false)
                }
                State::Zombie => (None, true),
                State::Idle => (None, false),
            }
        };

        if zombie {
            self.0.borrow_mut().remove(handle.0);
        }
        if let Some(action) = action {
            action.invoke();
        }
    }
}

impl Default for EventTable {
    fn default() -> EventTable {
        EventTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::Cell as StdCell;

    struct FakeScheduler {
        wheel: RefCell<crate::timer::TimerWheel>,
    }

    impl FakeScheduler {
        fn new() -> FakeScheduler {
            FakeScheduler {
                wheel: RefCell::new(crate::timer::TimerWheel::new()),
            }
        }

        fn flush(&self) {
            loop {
                let due = self.wheel.borrow_mut().drain_due(u64::MAX, usize::MAX);
                if due.is_empty() {
                    break;
                }
                for a in due {
                    a.invoke();
                }
            }
        }
    }

    #[test]
    fn five_triggers_coalesce_to_one_dispatch() {
        // S2: trigger five times synchronously, then flush; fires once.
        let sched = Rc::new(FakeScheduler::new());
        let table = EventTable::new();
        let count = Rc::new(StdCell::new(0));
        let count2 = count.clone();
        let handle = table.create(Action::new(move || count2.set(count2.get() + 1)));

        for _ in 0..5 {
            let sched = sched.clone();
            table.trigger(handle, move |a| sched.wheel.borrow_mut().execute(a));
        }
        sched.flush();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn destroy_from_within_own_action_is_safe() {
        let sched = Rc::new(FakeScheduler::new());
        let table = EventTable::new();
        let table2 = table.clone();
        let ran = Rc::new(StdCell::new(false));
        let ran2 = ran.clone();

        // The handle is filled in after creation since the closure needs
        // to refer to its own event.
        let handle_cell: Rc<RefCell<Option<EventHandle>>> = Rc::new(RefCell::new(None));
        let handle_cell2 = handle_cell.clone();
        let handle = table.create(Action::new(move || {
            ran2.set(true);
            let h = handle_cell2.borrow().unwrap();
            table2.destroy(h);
        }));
        *handle_cell.borrow_mut() = Some(handle);

        let sched2 = sched.clone();
        table.trigger(handle, move |a| sched2.wheel.borrow_mut().execute(a));
        sched.flush();
        assert!(ran.get());
    }
}
