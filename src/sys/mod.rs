//! Linux syscall glue. Everything above this module talks `io::Result`;
//! nothing above this module calls `libc` directly.

pub mod eventfd;
pub mod fd;
pub mod raw_epoll;

/// Run a libc call, mapping a `-1` return into `io::Error::last_os_error()`.
///
/// Ported from the pattern used throughout the teacher's `sys::epoll`,
/// `sys::eventfd` and `sys::timerfd` modules (`syscall!(epoll_create1(..))`),
/// whose macro definition is not itself present in the retrieved sources;
/// reconstructed here from its call sites.
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;
