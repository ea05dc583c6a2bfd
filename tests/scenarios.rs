//! Integration-level coverage for the two end-to-end scenarios that need a
//! real `Loop` rather than a single module's unit tests: Pacer rate timing
//! (needs a real clock, not `flush`'s virtual-time fast-forward) and the
//! posthumous-callback destruction contract (needs `Loop::event`'s actual
//! dispatch machinery, not just `EventTable` in isolation).
//!
//! The other scenarios (S1-S5) are covered where they're easiest to get
//! right: as unit tests alongside the module whose state machine they
//! exercise (`timer.rs`, `coalesce.rs`, `chunked.rs`, `naive.rs`).

use std::cell::{Cell, RefCell};
use std::io::{Cursor, Read};
use std::rc::{Rc, Weak};
use std::time::Instant;

use loomio::coalesce::EventHandle;
use loomio::pacer::PacerStream;
use loomio::{Action, ByteStream, Loop};

struct FixedStream {
    data: Cursor<Vec<u8>>,
}

impl ByteStream for FixedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }

    fn register_callback(&mut self, _action: Action) {}

    fn close(self: Box<Self>) {}
}

fn drive(lp: &Loop, stream: &Rc<RefCell<PacerStream>>, total: &Rc<Cell<usize>>) {
    let mut buf = [0u8; 256];
    loop {
        let mut s = stream.borrow_mut();
        match s.read(&mut buf) {
            Ok(0) => {
                drop(s);
                lp.quit_loop();
                return;
            }
            Ok(n) => total.set(total.get() + n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn s6_pacer_stream_completes_within_ten_percent_of_the_target_rate() {
    let lp = Loop::new().unwrap();
    let byte_rate = 2_000.0;
    let n = 800usize;
    let source = FixedStream {
        data: Cursor::new(vec![9u8; n]),
    };
    let stream = Rc::new(RefCell::new(PacerStream::new(
        &lp,
        Box::new(source),
        byte_rate,
        1.0,
        10.0 * byte_rate,
    )));
    let total = Rc::new(Cell::new(0usize));

    let lp2 = lp.clone();
    let stream2 = stream.clone();
    let total2 = total.clone();
    stream.borrow_mut().register_callback(Action::new(move || drive(&lp2, &stream2, &total2)));

    let start = Instant::now();
    drive(&lp, &stream, &total);
    lp.run().unwrap();
    let elapsed = start.elapsed().as_secs_f64();

    assert_eq!(total.get(), n);
    let expected = n as f64 / byte_rate;
    assert!(elapsed >= 0.9 * expected, "completed too fast: {elapsed}s, expected ~{expected}s");
    assert!(elapsed <= 1.1 * expected, "completed too slowly: {elapsed}s, expected ~{expected}s");
}

struct Marker(Rc<Cell<u32>>);

impl Drop for Marker {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[test]
fn s7_posthumous_destroy_frees_the_backing_object_exactly_once() {
    let lp = Loop::new().unwrap();
    let drops = Rc::new(Cell::new(0u32));
    let marker = Rc::new(Marker(drops.clone()));
    let weak: Weak<Marker> = Rc::downgrade(&marker);

    let handle_cell: Rc<RefCell<Option<EventHandle>>> = Rc::new(RefCell::new(None));
    let handle_cell2 = handle_cell.clone();
    let lp2 = lp.clone();
    let handle = lp.event(Action::new(move || {
        let _keep_alive = &marker;
        let h = handle_cell2.borrow().expect("handle filled in before trigger");
        lp2.event_destroy(h);
        lp2.quit_loop();
    }));
    *handle_cell.borrow_mut() = Some(handle);

    lp.event_trigger(handle);
    lp.run().unwrap();

    assert_eq!(drops.get(), 1, "backing object must be freed exactly once");
    assert!(weak.upgrade().is_none());

    // The destroyed event is now a no-op: triggering it again neither
    // panics nor refires the (already-gone) action.
    lp.event_trigger(handle);
    lp.flush(lp.now()).unwrap();
    assert_eq!(drops.get(), 1);
}
