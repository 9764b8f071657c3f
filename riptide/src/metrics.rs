//! Event-loop metrics.
//!
//! Counters for ring traffic, wake-ups, task execution and loop errors.
//! Registered with metriken so an embedding process can expose them.

use metriken::{Gauge, metric};

use crate::counter::{Counter, CounterGroup};

static RING: CounterGroup = CounterGroup::new();
static LOOP: CounterGroup = CounterGroup::new();
static CHANNELS: CounterGroup = CounterGroup::new();

/// Counter slot indices for ring traffic.
mod ring_slots {
    pub const SQES_SUBMITTED: usize = 0;
    pub const SUBMIT_FAILURES: usize = 1;
    pub const PARTIAL_SUBMITS: usize = 2;
    pub const CQES_PROCESSED: usize = 3;
}

/// Counter slot indices for loop activity.
mod loop_slots {
    pub const TASKS_RUN: usize = 0;
    pub const WAKEUP_WRITES: usize = 1;
    pub const TIMER_EXPIRIES: usize = 2;
    pub const LOOP_ERRORS: usize = 3;
}

/// Counter slot indices for channel lifecycle.
mod channel_slots {
    pub const REGISTERED: usize = 0;
    pub const REMOVED: usize = 1;
}

#[metric(name = "riptide/sqes/submitted", description = "SQEs consumed by the kernel")]
pub static SQES_SUBMITTED: Counter = Counter::new(&RING, ring_slots::SQES_SUBMITTED);

#[metric(
    name = "riptide/sqes/submit_failures",
    description = "io_uring_enter calls that returned an error"
)]
pub static SUBMIT_FAILURES: Counter = Counter::new(&RING, ring_slots::SUBMIT_FAILURES);

#[metric(
    name = "riptide/sqes/partial_submits",
    description = "Submissions where the kernel consumed fewer SQEs than offered"
)]
pub static PARTIAL_SUBMITS: Counter = Counter::new(&RING, ring_slots::PARTIAL_SUBMITS);

#[metric(name = "riptide/cqes/processed", description = "CQEs drained and dispatched")]
pub static CQES_PROCESSED: Counter = Counter::new(&RING, ring_slots::CQES_PROCESSED);

#[metric(name = "riptide/tasks/run", description = "Tasks executed on the loop thread")]
pub static TASKS_RUN: Counter = Counter::new(&LOOP, loop_slots::TASKS_RUN);

#[metric(
    name = "riptide/wakeups/writes",
    description = "Cross-thread eventfd wake-up writes"
)]
pub static WAKEUP_WRITES: Counter = Counter::new(&LOOP, loop_slots::WAKEUP_WRITES);

#[metric(
    name = "riptide/timer/expiries",
    description = "Kernel timeouts that fired (-ETIME)"
)]
pub static TIMER_EXPIRIES: Counter = Counter::new(&LOOP, loop_slots::TIMER_EXPIRIES);

#[metric(
    name = "riptide/loop/errors",
    description = "Unexpected errors absorbed by the event loop"
)]
pub static LOOP_ERRORS: Counter = Counter::new(&LOOP, loop_slots::LOOP_ERRORS);

#[metric(
    name = "riptide/channels/registered",
    description = "Channels added to the registry"
)]
pub static CHANNELS_REGISTERED: Counter = Counter::new(&CHANNELS, channel_slots::REGISTERED);

#[metric(
    name = "riptide/channels/removed",
    description = "Channels removed from the registry"
)]
pub static CHANNELS_REMOVED: Counter = Counter::new(&CHANNELS, channel_slots::REMOVED);

#[metric(
    name = "riptide/channels/active",
    description = "Channels currently registered"
)]
pub static CHANNELS_ACTIVE: Gauge = Gauge::new();
