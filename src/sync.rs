//! Synchronization primitives for the connection fleet: a one-shot handoff
//! gate between a sender/receiver pair and the launch barrier that releases
//! all workers at once.

use std::sync::{Condvar, Mutex, PoisonError};

/// One-shot gate between exactly two threads.
///
/// Created closed. The sender opens it once its socket is connected (or the
/// connect has definitively failed); the receiver blocks in [`Gate::wait`]
/// until then. This is the only signal the receiver has that the shared
/// socket slot is ready to read.
pub struct Gate {
    opened: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Gate {
            opened: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn open(&self) {
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        *opened = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut opened = self.opened.lock().unwrap_or_else(PoisonError::into_inner);
        while !*opened {
            opened = self
                .cv
                .wait(opened)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Counting rendezvous for the whole fleet: 2N workers plus the
/// orchestrator. Nobody passes until everybody has arrived, so timed work
/// starts simultaneously across all connections.
///
/// Unlike [`std::sync::Barrier`] this one can be cancelled: when fleet
/// setup fails halfway, workers already parked here are woken with an error
/// instead of staying blocked on a rendezvous that can never complete.
pub struct LaunchBarrier {
    participants: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    released: bool,
    cancelled: bool,
}

/// The barrier was cancelled before all participants arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

impl LaunchBarrier {
    pub fn new(participants: usize) -> Self {
        LaunchBarrier {
            participants,
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
        }
    }

    /// Block until all participants have arrived, or until the barrier is
    /// cancelled.
    pub fn wait(&self) -> Result<(), Cancelled> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.cancelled {
            return Err(Cancelled);
        }
        st.arrived += 1;
        if st.arrived >= self.participants {
            st.released = true;
            self.cv.notify_all();
            return Ok(());
        }
        while !st.released && !st.cancelled {
            st = self.cv.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
        if st.released {
            Ok(())
        } else {
            Err(Cancelled)
        }
    }

    /// Wake every current and future waiter with [`Cancelled`]. Has no
    /// effect on participants that already passed the rendezvous.
    pub fn cancel(&self) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.cancelled = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_releases_parked_waiter() {
        let gate = Arc::new(Gate::new());
        let passed = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let gate = gate.clone();
            let passed = passed.clone();
            thread::spawn(move || {
                gate.wait();
                passed.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        gate.open();
        waiter.join().unwrap();
        assert_eq!(passed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_open_before_wait_does_not_block() {
        let gate = Gate::new();
        gate.open();
        gate.wait();
    }

    #[test]
    fn barrier_releases_everyone_together() {
        let barrier = Arc::new(LaunchBarrier::new(4));
        let passed = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                let passed = passed.clone();
                thread::spawn(move || {
                    barrier.wait().unwrap();
                    passed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(passed.load(Ordering::SeqCst), 0);
        barrier.wait().unwrap();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancel_unblocks_parked_waiters() {
        let barrier = Arc::new(LaunchBarrier::new(3));
        let waiter = {
            let barrier = barrier.clone();
            thread::spawn(move || barrier.wait())
        };

        thread::sleep(Duration::from_millis(20));
        barrier.cancel();
        assert_eq!(waiter.join().unwrap(), Err(Cancelled));
    }

    #[test]
    fn wait_after_cancel_fails_immediately() {
        let barrier = LaunchBarrier::new(2);
        barrier.cancel();
        assert_eq!(barrier.wait(), Err(Cancelled));
    }
}
