//! Concurrent TCP benchmarking harness.
//!
//! Opens N connections to a target and pairs every connection with a sender
//! thread (zero-copy file-to-socket transfer of a fixed request payload) and
//! a receiver thread (drains the socket to EOF, optionally persisting the
//! response stream). All 2N workers start simultaneously behind a launch
//! barrier, every phase boundary is stamped with a monotonic nanosecond
//! clock, and each connection reports either its timings and byte counts or
//! a diagnostic string. One connection failing never aborts the rest.

pub mod connect;
pub mod fleet;
pub mod sync;
pub mod xfer;

pub use connect::{connect_tcp, AddrFamily, ConnectOpts};
pub use fleet::{run_fleet, ConnStats, Fleet, FleetConfig, MAX_CONNECTIONS};

/// Current monotonic time in nanoseconds, on the same arbitrary epoch as the
/// timestamps in [`ConnStats`].
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC with a valid timespec cannot fail on supported platforms
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::monotonic_ns;

    #[test]
    fn monotonic_ns_is_monotonic() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
