//! Cross-thread wake-up state.
//!
//! The loop parks inside `io_uring_enter`; the only way another thread can
//! unblock it is a write to the loop's eventfd, whose blocking READ is
//! permanently posted as an SQE. A single atomic word coalesces those
//! writes: it holds `AWAKE` while the loop is running, `NONE` while it is
//! parked with no deadline, or the armed deadline in nanoseconds.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::metrics;
use crate::sys;

/// The loop is awake (or a wake-up write is already on its way).
pub(crate) const AWAKE: i64 = -1;
/// The loop is parked with no scheduled deadline.
pub(crate) const NONE: i64 = i64::MAX;

pub(crate) struct WakeupState {
    next_wakeup_nanos: AtomicI64,
    eventfd: RawFd,
}

impl WakeupState {
    pub(crate) fn new(eventfd: RawFd) -> Self {
        WakeupState {
            next_wakeup_nanos: AtomicI64::new(AWAKE),
            eventfd,
        }
    }

    /// Wake the loop. Writes the eventfd only when the previous state was
    /// not already `AWAKE`, so at most one write lands per idle epoch.
    pub(crate) fn wake(&self, in_event_loop: bool) {
        if !in_event_loop && self.next_wakeup_nanos.swap(AWAKE, Ordering::SeqCst) != AWAKE {
            sys::eventfd_write(self.eventfd, 1);
            metrics::WAKEUP_WRITES.increment();
        }
    }

    /// Publish the deadline the loop is about to park with (`NONE` when
    /// there is none).
    pub(crate) fn set(&self, nanos: i64) {
        self.next_wakeup_nanos.store(nanos, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> i64 {
        self.next_wakeup_nanos.load(Ordering::SeqCst)
    }

    /// Collapse back to `AWAKE`, returning the prior state.
    pub(crate) fn swap_awake(&self) -> i64 {
        self.next_wakeup_nanos.swap(AWAKE, Ordering::SeqCst)
    }
}
