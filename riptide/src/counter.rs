//! Sharded counters for hot-path metrics.
//!
//! A [`CounterGroup`] packs 16 counter slots into per-thread shards so
//! loop threads incrementing different counters never contend on a cache
//! line. [`Counter`] references one slot and implements
//! [`metriken::Metric`] for exposition.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SLOTS: usize = 16;
const SHARDS: usize = 32;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Assigned round-robin the first time a thread touches any counter.
    static SHARD: Cell<usize> = Cell::new(usize::MAX);
}

#[inline]
fn shard_index() -> usize {
    let cached = SHARD.get();
    if cached != usize::MAX {
        return cached;
    }
    let assigned = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
    SHARD.set(assigned);
    assigned
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to 16 counters.
pub struct CounterGroup {
    shards: [Shard; SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const EMPTY: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        CounterGroup {
            shards: [EMPTY; SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        debug_assert!(slot < SLOTS);
        self.shards
            .iter()
            .map(|shard| shard.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter backed by one slot of a [`CounterGroup`].
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Counter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Current value, aggregated across shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_aggregate_across_slots() {
        static GROUP: CounterGroup = CounterGroup::new();
        let a = Counter::new(&GROUP, 0);
        let b = Counter::new(&GROUP, 1);

        a.increment();
        a.add(4);
        b.increment();

        assert_eq!(a.value(), 5);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;
        use std::thread;

        static GROUP: CounterGroup = CounterGroup::new();
        let counter = Arc::new(Counter::new(&GROUP, 2));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        c.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value(), 4000);
    }
}
