//! The single-threaded event loop.
//!
//! One thread owns the ring and everything reachable from it. Each
//! iteration drains completions and runs tasks until both report idle,
//! reconciles fixed buffers if needed, publishes the next deadline, and
//! parks inside `io_uring_enter` waiting for at least one completion.
//! External threads reach the loop only through the task queue and the
//! eventfd wake-up; they never touch ring memory.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{trace, warn};

use crate::channel::{ChannelMap, ChannelRef};
use crate::config::Config;
use crate::error::Error;
use crate::fixed::FixedBufferTable;
use crate::metrics;
use crate::ring::RingBuffer;
use crate::submission::SubmissionQueue;
use crate::sys;
use crate::tasks::{ScheduledTasks, Task};
use crate::wakeup::{AWAKE, NONE, WakeupState};

/// The io_uring event loop. Construct it on (or move it to) the thread
/// that will call [`run`](Self::run); it never migrates afterwards.
pub struct EventLoop {
    ring: RingBuffer,
    channels: ChannelMap,
    scheduled: ScheduledTasks,
    task_rx: Receiver<Task>,
    task_tx: Sender<Task>,
    wakeup: Arc<WakeupState>,
    shutdown: Arc<AtomicBool>,
    eventfd: RawFd,
    // Scratch memory for the blocking eventfd read; address must stay
    // stable while the read is in flight.
    eventfd_buf: Box<[u8; 8]>,
    fixed: FixedBufferTable,
    prev_deadline_nanos: i64,
    pending_wakeup: bool,
    start: Instant,
    error_cooldown: Duration,
}

impl EventLoop {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        let eventfd = sys::eventfd().map_err(Error::Io)?;
        let wakeup = Arc::new(WakeupState::new(eventfd));
        let shutdown = Arc::new(AtomicBool::new(false));
        match Self::with_parts(config, eventfd, task_tx, task_rx, wakeup, shutdown) {
            Ok(event_loop) => Ok(event_loop),
            Err(e) => {
                unsafe {
                    libc::close(eventfd);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn with_parts(
        config: &Config,
        eventfd: RawFd,
        task_tx: Sender<Task>,
        task_rx: Receiver<Task>,
        wakeup: Arc<WakeupState>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let mut ring = RingBuffer::new(config.ring_entries)?;
        ring.sq_mut().set_sqe_async(config.sqe_async);
        Ok(EventLoop {
            ring,
            channels: ChannelMap::new(),
            scheduled: ScheduledTasks::new(),
            task_rx,
            task_tx,
            wakeup,
            shutdown,
            eventfd,
            eventfd_buf: Box::new([0u8; 8]),
            fixed: FixedBufferTable::new(),
            prev_deadline_nanos: NONE,
            pending_wakeup: false,
            start: Instant::now(),
            error_cooldown: config.error_cooldown,
        })
    }

    /// Handle for other threads to reach this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            task_tx: self.task_tx.clone(),
            wakeup: self.wakeup.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Nanoseconds since this loop was created; the time base for
    /// scheduled-task deadlines.
    pub fn now_nanos(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    /// Drive the loop until shutdown is confirmed.
    pub fn run(&mut self) -> Result<(), Error> {
        let eventfd_buf_addr = self.eventfd_buf.as_ptr() as u64;
        // The wake-up read goes in before any real work so a producer can
        // always unblock the first park.
        unsafe {
            self.ring
                .sq_mut()
                .add_read(self.eventfd, eventfd_buf_addr, 0, 8, -1, true)?;
        }
        if self.fixed.is_dirty() {
            // Nothing is in flight yet.
            self.fixed.reconcile(self.ring.ring_fd())?;
        }

        loop {
            // Busy phase: completion dispatch can enqueue tasks and tasks
            // can enqueue SQEs, so run both until neither makes progress.
            let mut maybe_more_work = true;
            while maybe_more_work {
                let processed = self.process_completions();
                let ran = self.run_all_tasks();
                maybe_more_work = processed != 0 || ran;

                if self.shutting_down() {
                    self.close_all();
                    if self.confirm_shutdown() {
                        self.cleanup();
                        return Ok(());
                    }
                    if !maybe_more_work {
                        maybe_more_work =
                            !self.task_rx.is_empty() || self.ring.cq().has_completions();
                    }
                }
            }

            // Fixed buffers can only be (re)registered on a quiet ring.
            if self.fixed.is_dirty() && !self.ring.sq().has_io_in_flight() {
                let result = self
                    .pause_long_io()
                    .and_then(|()| self.fixed.reconcile(self.ring.ring_fd()));
                if let Err(e) = result {
                    self.absorb_error(e);
                }
                continue;
            }

            // Publish the deadline we are about to park with, then arm the
            // kernel timeout if it changed.
            let cur_deadline = self
                .scheduled
                .next_deadline_nanos()
                .unwrap_or(NONE);
            self.wakeup.set(cur_deadline);

            let blocked = self.arm_and_block(cur_deadline);

            // Back awake: collapse the wake-up word. If a producer already
            // wrote AWAKE, its eventfd write is in flight and the read will
            // need re-arming when it completes.
            if self.wakeup.get() == AWAKE || self.wakeup.swap_awake() == AWAKE {
                self.pending_wakeup = true;
            }
            if let Err(e) = blocked {
                self.absorb_error(e);
            }
        }
    }

    fn arm_and_block(&mut self, cur_deadline: i64) -> Result<(), Error> {
        // Only block when there is nothing to run.
        if !self.task_rx.is_empty() {
            return Ok(());
        }
        if cur_deadline != self.prev_deadline_nanos {
            let now = self.now_nanos();
            let sq = self.ring.sq_mut();
            if self.prev_deadline_nanos != NONE {
                sq.add_timeout_remove()?;
            }
            if cur_deadline != NONE {
                sq.add_timeout(cur_deadline.saturating_sub(now).max(0) as u64)?;
            }
            self.prev_deadline_nanos = cur_deadline;
        }
        if !self.ring.cq().has_completions() {
            trace!("parking in submit_and_wait");
            self.ring.sq_mut().submit_and_wait()?;
        }
        Ok(())
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shutdown completes once every channel has retired from the registry
    /// and no tasks remain queued.
    fn confirm_shutdown(&self) -> bool {
        self.channels.is_empty() && self.task_rx.is_empty()
    }

    /// Close every registered channel. Channels with outstanding polls
    /// retire asynchronously through the POLL_REMOVE completion path;
    /// channels with nothing in flight are removed here.
    fn close_all(&mut self) {
        for (fd, channel) in self.channels.snapshot() {
            self.with_ctx(|ctx| channel.borrow_mut().close(ctx));
            let quiesced = {
                let ch = channel.borrow();
                !ch.is_open() && !ch.io_scheduled() && !ch.poll_scheduled()
            };
            if quiesced {
                self.channels.remove(fd, &channel);
            }
        }
    }

    fn cleanup(&mut self) {
        if self.eventfd >= 0 {
            unsafe {
                libc::close(self.eventfd);
            }
            self.eventfd = -1;
        }
        trace!("event loop terminated");
    }

    /// Quiesce long-running operations before fixed-buffer registration:
    /// cancel every channel poll, the eventfd read (unless its completion
    /// is already on the way), and the armed timeout.
    fn pause_long_io(&mut self) -> Result<(), Error> {
        let snapshot = self.channels.snapshot();
        let EventLoop {
            ring,
            channels,
            scheduled,
            fixed,
            wakeup,
            task_tx,
            shutdown,
            eventfd,
            prev_deadline_nanos,
            pending_wakeup,
            start,
            ..
        } = self;
        let (sq, _) = ring.split();
        let mut ctx = LoopCtx {
            sq,
            channels,
            scheduled,
            fixed,
            wakeup,
            task_tx,
            shutdown,
            start: *start,
        };
        for (_, channel) in &snapshot {
            channel.borrow_mut().remove_polls(&mut ctx);
        }
        let sq = ctx.sq;
        if !*pending_wakeup {
            sq.add_read_cancel(*eventfd)?;
        }
        if *prev_deadline_nanos != NONE {
            sq.add_timeout_remove()?;
            *prev_deadline_nanos = NONE;
        }
        sq.submit()?;
        Ok(())
    }

    fn process_completions(&mut self) -> u32 {
        let EventLoop {
            ring,
            channels,
            scheduled,
            fixed,
            wakeup,
            task_tx,
            shutdown,
            eventfd,
            eventfd_buf,
            prev_deadline_nanos,
            pending_wakeup,
            start,
            ..
        } = self;
        let eventfd_buf_addr = eventfd_buf.as_ptr() as u64;
        let (sq, cq) = ring.split();
        cq.process(|fd, res, flags, op, mask| {
            dispatch(
                sq,
                channels,
                scheduled,
                fixed,
                wakeup,
                task_tx,
                shutdown,
                *start,
                *eventfd,
                eventfd_buf_addr,
                prev_deadline_nanos,
                pending_wakeup,
                fd,
                res,
                flags,
                op,
                mask,
            );
            true
        })
    }

    fn run_all_tasks(&mut self) -> bool {
        let mut ran = false;
        let now = self.now_nanos();
        while let Some(task) = self.scheduled.pop_due(now) {
            self.run_task(task);
            ran = true;
        }
        while let Ok(task) = self.task_rx.try_recv() {
            self.run_task(task);
            ran = true;
        }
        ran
    }

    fn run_task(&mut self, task: Task) {
        self.with_ctx(|ctx| task(ctx));
        metrics::TASKS_RUN.increment();
    }

    /// Borrow-split the loop into a dispatch context.
    fn with_ctx<R>(&mut self, f: impl FnOnce(&mut LoopCtx<'_>) -> R) -> R {
        let EventLoop {
            ring,
            channels,
            scheduled,
            fixed,
            wakeup,
            task_tx,
            shutdown,
            start,
            ..
        } = self;
        let (sq, _) = ring.split();
        let mut ctx = LoopCtx {
            sq,
            channels,
            scheduled,
            fixed,
            wakeup,
            task_tx,
            shutdown,
            start: *start,
        };
        f(&mut ctx)
    }

    fn absorb_error(&mut self, error: Error) {
        // An interrupted park is routine; retry without the cool-down.
        if let Error::SubmitFailed(errno) = error
            && errno == libc::EINTR
        {
            trace!("submit_and_wait interrupted");
            return;
        }
        metrics::LOOP_ERRORS.increment();
        warn!(error = %error, "unexpected error in the event loop");
        // A persistent failure must not spin the thread.
        thread::sleep(self.error_cooldown);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Completion dispatch. A free function over the split borrows so the
/// completion queue can stay mutably borrowed while handlers enqueue SQEs.
#[allow(clippy::too_many_arguments)]
fn dispatch(
    sq: &mut SubmissionQueue,
    channels: &mut ChannelMap,
    scheduled: &mut ScheduledTasks,
    fixed: &mut FixedBufferTable,
    wakeup: &Arc<WakeupState>,
    task_tx: &Sender<Task>,
    shutdown: &Arc<AtomicBool>,
    start: Instant,
    eventfd: RawFd,
    eventfd_buf_addr: u64,
    prev_deadline_nanos: &mut i64,
    pending_wakeup: &mut bool,
    fd: RawFd,
    res: i32,
    _flags: u32,
    op: u8,
    mask: u16,
) {
    if op == sys::IORING_OP_READ && fd == eventfd {
        *pending_wakeup = false;
        // Keep exactly one eventfd read posted while the loop runs.
        if !shutdown.load(Ordering::Acquire)
            && let Err(e) = unsafe { sq.add_read(eventfd, eventfd_buf_addr, 0, 8, -1, true) }
        {
            warn!(error = %e, "failed to re-arm eventfd read");
        }
        return;
    }
    if op == sys::IORING_OP_TIMEOUT {
        if res == -libc::ETIME {
            *prev_deadline_nanos = NONE;
            metrics::TIMER_EXPIRIES.increment();
        }
        return;
    }

    // Remaining completions are channel-specific.
    let Some(channel) = channels.get(fd) else {
        trace!(fd, op, res, "completion for unregistered fd dropped");
        return;
    };
    let mut ctx = LoopCtx {
        sq,
        channels,
        scheduled,
        fixed,
        wakeup,
        task_tx,
        shutdown,
        start,
    };

    match op {
        sys::IORING_OP_READ | sys::IORING_OP_ACCEPT => {
            ctx.sq.io_op_complete();
            channel.borrow_mut().read_complete(&mut ctx, res);
        }
        sys::IORING_OP_WRITE => {
            ctx.sq.io_op_complete();
            channel.borrow_mut().write_complete(&mut ctx, res);
        }
        sys::IORING_OP_CONNECT => {
            ctx.sq.io_op_complete();
            channel.borrow_mut().connect_complete(&mut ctx, res);
        }
        sys::IORING_OP_POLL_ADD => {
            if res != -libc::ECANCELED {
                let armed = mask as u32;
                if armed & sys::POLLIN != 0 {
                    channel.borrow_mut().poll_in(&mut ctx, res);
                }
                if armed & sys::POLLOUT != 0 {
                    channel.borrow_mut().poll_out(&mut ctx, res);
                }
                if armed & sys::POLLRDHUP != 0 {
                    channel.borrow_mut().poll_rdhup(&mut ctx, res);
                }
            } else if channel.borrow().is_active() {
                // Cancelled by a register pause, not a close: reinstate.
                if let Err(e) = ctx.sq.add_poll(fd, mask as u32) {
                    warn!(fd, error = %e, "failed to re-arm poll");
                }
            }
        }
        sys::IORING_OP_POLL_REMOVE => {
            if res == -libc::ENOENT {
                trace!(fd, "poll remove matched nothing");
            }
            let retired = {
                let ch = channel.borrow();
                !ch.is_active() && !ch.io_scheduled()
            };
            if retired {
                // The cancelled polls were the channel's last business.
                let _ = ctx.channels.take(fd);
                return;
            }
        }
        _ => {
            // CLOSE / ASYNC_CANCEL / TIMEOUT_REMOVE acknowledgments.
            trace!(fd, op, res, "completion acknowledged");
        }
    }
    channel.borrow_mut().process_delayed_close(&mut ctx);
}

/// Loop-owned state handed to tasks and channel callbacks.
pub struct LoopCtx<'a> {
    pub(crate) sq: &'a mut SubmissionQueue,
    pub(crate) channels: &'a mut ChannelMap,
    pub(crate) scheduled: &'a mut ScheduledTasks,
    pub(crate) fixed: &'a mut FixedBufferTable,
    pub(crate) wakeup: &'a Arc<WakeupState>,
    pub(crate) task_tx: &'a Sender<Task>,
    pub(crate) shutdown: &'a Arc<AtomicBool>,
    pub(crate) start: Instant,
}

impl<'a> LoopCtx<'a> {
    /// The submission queue, for enqueueing operations.
    pub fn submission(&mut self) -> &mut SubmissionQueue {
        self.sq
    }

    /// Register a channel under its file descriptor.
    pub fn register_channel(&mut self, fd: RawFd, channel: ChannelRef) {
        self.channels.insert(fd, channel);
    }

    /// Deregister a channel, reconciling fd reuse (see
    /// [`ChannelMap::remove`]).
    pub fn deregister_channel(&mut self, fd: RawFd, channel: &ChannelRef) {
        self.channels.remove(fd, channel);
    }

    pub fn channel(&self, fd: RawFd) -> Option<ChannelRef> {
        self.channels.get(fd)
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Run `task` after `delay` on this loop thread.
    pub fn schedule<F>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        let deadline = self.now_nanos() + delay.as_nanos() as i64;
        self.scheduled.push(deadline, Box::new(task));
    }

    /// Nanoseconds since the loop was created.
    pub fn now_nanos(&self) -> i64 {
        self.start.elapsed().as_nanos() as i64
    }

    /// The fixed-buffer table. Marking it dirty triggers reconciliation at
    /// the loop's next quiet point.
    pub fn fixed_buffers(&mut self) -> &mut FixedBufferTable {
        self.fixed
    }

    /// Request cooperative shutdown of this loop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// A handle to this loop usable from other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            task_tx: self.task_tx.clone(),
            wakeup: self.wakeup.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Cross-thread handle to an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    task_tx: Sender<Task>,
    wakeup: Arc<WakeupState>,
    shutdown: Arc<AtomicBool>,
}

impl LoopHandle {
    pub(crate) fn from_parts(
        task_tx: Sender<Task>,
        wakeup: Arc<WakeupState>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        LoopHandle {
            task_tx,
            wakeup,
            shutdown,
        }
    }

    /// Enqueue a task and wake the loop. Returns false if the loop is gone.
    ///
    /// The enqueue happens before the eventfd write, so the loop observes
    /// the task once it wakes.
    pub fn execute<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut LoopCtx<'_>) + Send + 'static,
    {
        if self.task_tx.send(Box::new(task)).is_err() {
            return false;
        }
        self.wakeup.wake(false);
        true
    }

    /// Force a wake-up without enqueueing work.
    pub fn wakeup(&self) {
        self.wakeup.wake(false);
    }

    /// Request cooperative shutdown and wake the loop so it notices.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.wake(false);
    }
}
