//! Channel capability trait and the fd → channel registry.
//!
//! The loop does not own channels; it routes completions to them through
//! the [`Channel`] capability set and keeps a relation from file descriptor
//! to handle. Because fds are reused by the kernel the moment they close,
//! removal has to reconcile: an entry may already belong to a newer channel
//! by the time the older one retires.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use ahash::AHashMap;
use tracing::trace;

use crate::event_loop::LoopCtx;
use crate::metrics;

/// Shared handle to a channel. Channels live on the event-loop thread only.
pub type ChannelRef = Rc<RefCell<dyn Channel>>;

/// Capability set the event loop dispatches completions through.
///
/// Implementations hold the per-socket state machines (out of scope here);
/// the loop only needs these entry points plus the lifecycle predicates the
/// retirement logic consults.
pub trait Channel {
    /// A READ or ACCEPT completed with `res` (negative = errno).
    fn read_complete(&mut self, ctx: &mut LoopCtx<'_>, res: i32);

    /// A WRITE (including WRITEV / WRITE_FIXED) completed.
    fn write_complete(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}

    /// A CONNECT completed.
    fn connect_complete(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}

    /// POLL_ADD fired with POLLIN set.
    fn poll_in(&mut self, ctx: &mut LoopCtx<'_>, res: i32);

    /// POLL_ADD fired with POLLOUT set.
    fn poll_out(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}

    /// POLL_ADD fired with POLLRDHUP set.
    fn poll_rdhup(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}

    /// Called after completion dispatch so a channel can finalize a close
    /// it had to defer while I/O was outstanding.
    fn process_delayed_close(&mut self, _ctx: &mut LoopCtx<'_>) {}

    /// Enqueue POLL_REMOVE for every poll this channel has armed.
    fn remove_polls(&mut self, ctx: &mut LoopCtx<'_>);

    /// Close the channel, cancelling outstanding polls.
    fn close(&mut self, ctx: &mut LoopCtx<'_>);

    /// Whether the channel is still actively processing I/O.
    fn is_active(&self) -> bool;

    /// Whether the channel still exists at all (an inactive channel stays
    /// open until its outstanding operations retire).
    fn is_open(&self) -> bool;

    /// Whether read/write/connect operations are outstanding.
    fn io_scheduled(&self) -> bool;

    /// Whether any POLL_ADD is outstanding.
    fn poll_scheduled(&self) -> bool;
}

/// Relation from file descriptor to channel handle. Mutated only on the
/// event-loop thread.
pub struct ChannelMap {
    map: AHashMap<RawFd, ChannelRef>,
}

impl ChannelMap {
    pub fn new() -> Self {
        ChannelMap {
            map: AHashMap::new(),
        }
    }

    pub fn insert(&mut self, fd: RawFd, channel: ChannelRef) {
        trace!(fd, "register channel");
        metrics::CHANNELS_REGISTERED.increment();
        metrics::CHANNELS_ACTIVE.increment();
        self.map.insert(fd, channel);
    }

    /// Remove `channel`'s mapping for `fd`. If the slot already holds a
    /// different channel the fd was reused after close: the newer mapping
    /// is restored untouched and the outgoing channel must already be
    /// closed.
    pub fn remove(&mut self, fd: RawFd, channel: &ChannelRef) {
        trace!(fd, "remove channel");
        match self.map.remove(&fd) {
            Some(current) if !Rc::ptr_eq(&current, channel) => {
                debug_assert!(!channel.borrow().is_open());
                self.map.insert(fd, current);
            }
            Some(_) => {
                metrics::CHANNELS_REMOVED.increment();
                metrics::CHANNELS_ACTIVE.decrement();
            }
            None => {}
        }
    }

    /// Remove whatever handle `fd` maps to. Used when the loop retires a
    /// channel after its last poll completed.
    pub fn take(&mut self, fd: RawFd) -> Option<ChannelRef> {
        let removed = self.map.remove(&fd);
        if removed.is_some() {
            metrics::CHANNELS_REMOVED.increment();
            metrics::CHANNELS_ACTIVE.decrement();
        }
        removed
    }

    pub fn get(&self, fd: RawFd) -> Option<ChannelRef> {
        self.map.get(&fd).cloned()
    }

    /// Snapshot of all entries, for iteration that mutates the map.
    pub fn snapshot(&self) -> Vec<(RawFd, ChannelRef)> {
        self.map.iter().map(|(fd, ch)| (*fd, ch.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubChannel {
        open: bool,
    }

    impl Channel for StubChannel {
        fn read_complete(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}
        fn poll_in(&mut self, _ctx: &mut LoopCtx<'_>, _res: i32) {}
        fn remove_polls(&mut self, _ctx: &mut LoopCtx<'_>) {}
        fn close(&mut self, _ctx: &mut LoopCtx<'_>) {
            self.open = false;
        }
        fn is_active(&self) -> bool {
            self.open
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn io_scheduled(&self) -> bool {
            false
        }
        fn poll_scheduled(&self) -> bool {
            false
        }
    }

    fn stub(open: bool) -> ChannelRef {
        Rc::new(RefCell::new(StubChannel { open }))
    }

    #[test]
    fn remove_drops_matching_entry() {
        let mut map = ChannelMap::new();
        let ch = stub(true);
        map.insert(7, ch.clone());
        map.remove(7, &ch);
        assert!(map.get(7).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn remove_restores_newer_mapping_on_fd_reuse() {
        let mut map = ChannelMap::new();
        let old = stub(false);
        let newer = stub(true);

        // fd 7 was closed and reused: the registry already holds the newer
        // channel when the old one's removal finally runs.
        map.insert(7, newer.clone());
        map.remove(7, &old);

        let current = map.get(7).expect("newer mapping must survive");
        assert!(Rc::ptr_eq(&current, &newer));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn take_removes_unconditionally() {
        let mut map = ChannelMap::new();
        let ch = stub(true);
        map.insert(3, ch);
        assert!(map.take(3).is_some());
        assert!(map.take(3).is_none());
    }
}
