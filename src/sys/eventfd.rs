//! `eventfd(2)` wrapper, adapted from the teacher's `sys::eventfd::EventFd`.
//! Used as the wake-up device's and `Notification`'s Linux backend (spec
//! §4.2 "Wake-up device", §4.14).

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::fd::FileDesc;
use super::syscall;

#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// Create an eventfd with initval 0 and `EFD_CLOEXEC | EFD_NONBLOCK`.
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    /// Drain the counter. Returns the accumulated value, or `WouldBlock`
    /// if nothing had been signalled.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Add `val` to the counter, unblocking anyone polling the fd for
    /// readability.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf = val.to_ne_bytes();
        match (&self.inner).write_all(&buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl FromRawFd for EventFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        EventFd {
            inner: FileDesc::from_raw_fd(fd),
        }
    }
}

impl IntoRawFd for EventFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::EventFd;

    #[test]
    fn write_and_read() {
        let eventfd = EventFd::new().unwrap();
        eventfd.write(123).unwrap();
        assert_eq!(123, eventfd.read().unwrap());
    }

    #[test]
    fn read_without_write_blocks() {
        let eventfd = EventFd::new().unwrap();
        let err = eventfd.read().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }
}
