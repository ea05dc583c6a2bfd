//! Raw epoll(7) wrapper, ported from the teacher's `sys::epoll::Epoll` and
//! generalized to also carry the level/edge bookkeeping the fd registry
//! needs (spec §4.4).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, i32};

use libc::{c_int, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};
use log::warn;

use super::syscall;

/// Readiness bits reported by a readiness event (spec §3 "Event" — the
/// kernel-facing half, not the user-facing coalescing `Event` of §4.3).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READABLE: Interest = Interest {
        read: true,
        write: false,
    };
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

pub struct RawEpoll {
    epfd: RawFd,
}

impl RawEpoll {
    pub fn new() -> io::Result<RawEpoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(RawEpoll { epfd })
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Interest, trigger: Trigger) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: encode(interest, trigger),
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Interest, trigger: Trigger) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: encode(interest, trigger),
            u64: token,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }

    /// Block for at most `timeout` (`None` = forever, `Some(ZERO)` = a pure
    /// non-blocking poll) and append ready (token, readiness) pairs to
    /// `out`. Returns the number appended.
    pub fn wait(
        &self,
        out: &mut Vec<(u64, Readiness)>,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let mut raw: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];

        let n = match syscall!(epoll_wait(self.epfd, raw.as_mut_ptr(), capacity as c_int, timeout_ms)) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                warn!("epoll_wait interrupted, retrying next cycle");
                0
            }
            Err(e) => return Err(e),
        };

        for ev in raw.iter().take(n as usize) {
            out.push((ev.u64, decode(ev.events as c_int)));
        }

        Ok(n as usize)
    }
}

fn encode(interest: Interest, trigger: Trigger) -> u32 {
    let mut bits = 0;
    if interest.read {
        bits |= EPOLLIN;
    }
    if interest.write {
        bits |= EPOLLOUT;
    }
    bits |= EPOLLRDHUP;
    if trigger == Trigger::Edge {
        bits |= EPOLLET;
    }
    bits as u32
}

fn decode(bits: c_int) -> Readiness {
    Readiness {
        readable: bits & (EPOLLIN | EPOLLPRI) != 0,
        writable: bits & EPOLLOUT != 0,
        error: bits & EPOLLERR != 0,
        hup: bits & (EPOLLHUP | EPOLLRDHUP) != 0,
    }
}

impl AsRawFd for RawEpoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for RawEpoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}
