//! NiceStream (spec §4.13): a burst-yielding wrapper. After relaying
//! `max_burst` bytes within a single read chain, the next read returns
//! `EAGAIN` and posts an immediate `execute` to resume, so a fast producer
//! never monopolises the loop across one dispatch.
//!
//! Grounded on `reactor::Loop::execute`'s own FIFO-after-timers ordering:
//! posting through `execute` (rather than calling the callback directly)
//! is what actually yields back to the loop, exactly like `Notification`'s
//! "never wake synchronously" discipline.

use std::io;

use crate::action::Action;
use crate::error::is_would_block;
use crate::reactor::Loop;
use crate::stream::ByteStream;

pub struct NiceStream {
    source: Box<dyn ByteStream>,
    loop_: Loop,
    max_burst: usize,
    relayed_this_burst: usize,
    callback: Action,
}

impl NiceStream {
    pub fn new(lp: &Loop, source: Box<dyn ByteStream>, max_burst: usize) -> NiceStream {
        NiceStream {
            source,
            loop_: lp.clone(),
            max_burst,
            relayed_this_burst: 0,
            callback: Action::noop(),
        }
    }
}

impl ByteStream for NiceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.relayed_this_burst >= self.max_burst {
            self.relayed_this_burst = 0;
            let cb = self.callback.clone();
            self.loop_.execute(cb);
            return Err(crate::error::would_block());
        }

        let cap = self.max_burst - self.relayed_this_burst;
        let want = std::cmp::min(cap, buf.len());
        match self.source.read(&mut buf[..want]) {
            Ok(n) => {
                self.relayed_this_burst += n;
                Ok(n)
            }
            Err(e) if is_would_block(&e) => Err(e),
            Err(e) => Err(e),
        }
    }

    fn register_callback(&mut self, action: Action) {
        self.source.register_callback(action.clone());
        self.callback = action;
    }

    fn close(self: Box<Self>) {
        self.source.close();
    }
}
