//! Monotonic nanosecond clock shared by writer and reader processes.
//!
//! `Instant` isn't a stable, cross-process-comparable value, so timestamps
//! stored in the control block are raw nanosecond counts off
//! `CLOCK_MONOTONIC`, read the same way the reference design reads them.

/// Current monotonic time in nanoseconds.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, exclusively-owned out-parameter.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
