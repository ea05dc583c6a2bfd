//! Monotonic clock and time-unit constants (spec §6).
//!
//! On Linux this reads `CLOCK_MONOTONIC` directly via `libc::clock_gettime`.
//! The absolute time base is unspecified and not comparable across
//! processes or hosts, matching spec §6's "Monotonic clock" paragraph.

/// A nanosecond.
pub const NS: i64 = 1;
/// A microsecond, in nanoseconds.
pub const US: i64 = 1_000 * NS;
/// A millisecond, in nanoseconds.
pub const MS: i64 = 1_000 * US;
/// A second, in nanoseconds.
pub const S: i64 = 1_000 * MS;
/// A minute, in nanoseconds.
pub const MINUTE: i64 = 60 * S;
/// An hour, in nanoseconds.
pub const HOUR: i64 = 60 * MINUTE;
/// A day, in nanoseconds.
pub const DAY: i64 = 24 * HOUR;
/// A week, in nanoseconds.
pub const WEEK: i64 = 7 * DAY;

/// Read the current monotonic nanosecond counter.
///
/// Never wraps (for any realistic uptime) and never goes backwards.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for clock_gettime, and
    // CLOCK_MONOTONIC is available on every Linux this crate targets.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = monotonic_now_ns();
        let b = monotonic_now_ns();
        assert!(b >= a);
    }

    #[test]
    fn unit_constants_compose() {
        assert_eq!(S, 1_000 * MS);
        assert_eq!(WEEK, 7 * DAY);
    }
}
