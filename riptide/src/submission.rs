//! Submission side of the ring.
//!
//! The queue is a user-space producer over the mmaped SQ ring: SQE slots are
//! written locally, the tail is published to the kernel with a release
//! store, and `io_uring_enter` hands the batch over. One slot's worth of
//! capacity is held in reserve so the blocking eventfd read can always be
//! re-armed, and non-poll I/O is counted in flight so fixed-buffer
//! re-registration knows when the ring is quiet.

use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{trace, warn};

use crate::completion::UserData;
use crate::error::Error;
use crate::metrics;
use crate::sys;

/// Callback invoked after each successful kernel submission, once the
/// submitted SQEs are stable from the kernel's point of view. Used by
/// callers to recycle iovec arrays referenced by submitted writev ops.
pub type SubmitCallback = Box<dyn FnMut()>;

/// User-space producer over the submission ring.
///
/// Single-producer: only the event loop thread may touch this. The kernel
/// advances the shared head as it consumes entries; this side owns the tail.
pub struct SubmissionQueue {
    k_head: *const AtomicU32,
    k_tail: *const AtomicU32,
    k_dropped: *const AtomicU32,
    sqes: *mut sys::io_uring_sqe,
    ring_mask: u32,
    ring_entries: u32,
    ring_fd: RawFd,
    head: u32,
    tail: u32,
    io_in_flight: u32,
    sqe_flags: u8,
    timeout_ts: Box<sys::kernel_timespec>,
    on_submit: Option<SubmitCallback>,
}

impl SubmissionQueue {
    /// Build the queue over an already-mapped SQ ring and SQE array.
    ///
    /// Zeroes the SQE array and identity-maps the index array once; after
    /// that, slots are selected by `tail & ring_mask` and rewritten in
    /// place.
    ///
    /// # Safety
    ///
    /// `ring_ptr` and `sqes` must point at live mappings for this ring and
    /// the offsets must be the ones the kernel returned. Both mappings must
    /// outlive the queue.
    pub(crate) unsafe fn new(
        ring_ptr: *mut u8,
        off: &sys::io_sqring_offsets,
        sqes: *mut sys::io_uring_sqe,
        ring_fd: RawFd,
        on_submit: Option<SubmitCallback>,
    ) -> Self {
        unsafe {
            let k_head = ring_ptr.add(off.head as usize) as *const AtomicU32;
            let k_tail = ring_ptr.add(off.tail as usize) as *const AtomicU32;
            let ring_mask = *(ring_ptr.add(off.ring_mask as usize) as *const u32);
            let ring_entries = *(ring_ptr.add(off.ring_entries as usize) as *const u32);

            ptr::write_bytes(sqes, 0, ring_entries as usize);
            let array = ring_ptr.add(off.array as usize) as *mut u32;
            for i in 0..ring_entries {
                *array.add(i as usize) = i;
            }

            SubmissionQueue {
                k_head,
                k_tail,
                k_dropped: ring_ptr.add(off.dropped as usize) as *const AtomicU32,
                sqes,
                ring_mask,
                ring_entries,
                ring_fd,
                head: (*k_head).load(Ordering::Relaxed),
                tail: (*k_tail).load(Ordering::Relaxed),
                io_in_flight: 0,
                sqe_flags: 0,
                timeout_ts: Box::new(sys::kernel_timespec::default()),
                on_submit,
            }
        }
    }

    /// Force async execution (`IOSQE_ASYNC`) on subsequently queued data
    /// operations.
    pub fn set_sqe_async(&mut self, enabled: bool) {
        self.sqe_flags = if enabled { sys::IOSQE_ASYNC } else { 0 };
    }

    /// Entries written but not yet consumed by the kernel.
    pub fn pending(&self) -> u32 {
        self.tail.wrapping_sub(self.head)
    }

    /// SQ dropped counter maintained by the kernel.
    pub fn dropped(&self) -> u32 {
        unsafe { (*self.k_dropped).load(Ordering::Relaxed) }
    }

    /// Whether any non-poll, non-eventfd, non-timeout operation is still in
    /// flight.
    pub fn has_io_in_flight(&self) -> bool {
        self.io_in_flight != 0
    }

    /// Record completion of one in-flight I/O operation.
    pub fn io_op_complete(&mut self) {
        self.io_in_flight = self.io_in_flight.saturating_sub(1);
    }

    /// Queue a READ (or READ_FIXED when `buf_index >= 0`) of
    /// `limit - pos` bytes into `addr + pos`. A `blocking` read is the
    /// eventfd wake-up read: it may take the reserved slot and is not
    /// counted in flight.
    ///
    /// # Safety
    ///
    /// `addr + pos .. addr + limit` must stay valid until the completion
    /// arrives.
    pub unsafe fn add_read(
        &mut self,
        fd: RawFd,
        addr: u64,
        pos: u32,
        limit: u32,
        buf_index: i16,
        blocking: bool,
    ) -> Result<(), Error> {
        let op = if buf_index >= 0 {
            sys::IORING_OP_READ_FIXED
        } else {
            sys::IORING_OP_READ
        };
        self.push(
            SqeFields {
                op,
                fd,
                addr: addr + pos as u64,
                len: limit - pos,
                rw_flags: 0,
                offset: 0,
                buf_index: buf_index.max(0) as u16,
                flags: self.sqe_flags,
            },
            blocking,
        )?;
        if !blocking {
            self.io_in_flight += 1;
        }
        Ok(())
    }

    /// Queue a WRITE (or WRITE_FIXED when `buf_index >= 0`) of
    /// `limit - pos` bytes from `addr + pos`.
    ///
    /// # Safety
    ///
    /// `addr + pos .. addr + limit` must stay valid until the completion
    /// arrives.
    pub unsafe fn add_write(
        &mut self,
        fd: RawFd,
        addr: u64,
        pos: u32,
        limit: u32,
        buf_index: i16,
    ) -> Result<(), Error> {
        let op = if buf_index >= 0 {
            sys::IORING_OP_WRITE_FIXED
        } else {
            sys::IORING_OP_WRITE
        };
        self.push(
            SqeFields {
                op,
                fd,
                addr: addr + pos as u64,
                len: limit - pos,
                rw_flags: 0,
                offset: 0,
                buf_index: buf_index.max(0) as u16,
                flags: self.sqe_flags,
            },
            false,
        )?;
        self.io_in_flight += 1;
        Ok(())
    }

    /// Queue a WRITEV over an iovec array.
    ///
    /// # Safety
    ///
    /// The iovec array and every buffer it references must stay valid until
    /// the completion arrives (the array may be recycled after the
    /// submission callback fires).
    pub unsafe fn add_writev(
        &mut self,
        fd: RawFd,
        iovec_addr: u64,
        len: u32,
    ) -> Result<(), Error> {
        self.push(
            SqeFields {
                op: sys::IORING_OP_WRITEV,
                fd,
                addr: iovec_addr,
                len,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: self.sqe_flags,
            },
            false,
        )?;
        self.io_in_flight += 1;
        Ok(())
    }

    /// Queue an ACCEPT. Accepted sockets are non-blocking and close-on-exec.
    pub fn add_accept(&mut self, fd: RawFd) -> Result<(), Error> {
        self.push(
            SqeFields {
                op: sys::IORING_OP_ACCEPT,
                fd,
                addr: 0,
                len: 0,
                rw_flags: (libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) as u32,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )?;
        self.io_in_flight += 1;
        Ok(())
    }

    /// Queue a CONNECT to the sockaddr at `sockaddr_addr`.
    ///
    /// # Safety
    ///
    /// The sockaddr memory must stay valid until the completion arrives.
    pub unsafe fn add_connect(
        &mut self,
        fd: RawFd,
        sockaddr_addr: u64,
        sockaddr_len: u64,
    ) -> Result<(), Error> {
        self.push(
            SqeFields {
                op: sys::IORING_OP_CONNECT,
                fd,
                addr: sockaddr_addr,
                len: 0,
                rw_flags: 0,
                offset: sockaddr_len,
                buf_index: 0,
                flags: 0,
            },
            false,
        )?;
        self.io_in_flight += 1;
        Ok(())
    }

    /// Queue a fire-and-forget CLOSE. Not counted in flight.
    pub fn add_close(&mut self, fd: RawFd) -> Result<(), Error> {
        self.push(
            SqeFields {
                op: sys::IORING_OP_CLOSE,
                fd,
                addr: 0,
                len: 0,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Queue a POLL_ADD with the given mask.
    pub fn add_poll(&mut self, fd: RawFd, poll_mask: u32) -> Result<(), Error> {
        self.push(
            SqeFields {
                op: sys::IORING_OP_POLL_ADD,
                fd,
                addr: 0,
                len: 0,
                rw_flags: poll_mask,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Queue a POLL_REMOVE. The address field carries the user-data word of
    /// the original POLL_ADD so the kernel can match it.
    pub fn add_poll_remove(&mut self, fd: RawFd, poll_mask: u32) -> Result<(), Error> {
        let target = UserData::encode(sys::IORING_OP_POLL_ADD, fd, poll_mask as u16);
        self.push(
            SqeFields {
                op: sys::IORING_OP_POLL_REMOVE,
                fd,
                addr: target.raw(),
                len: 0,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Queue an ASYNC_CANCEL targeting the blocking eventfd READ on `fd`.
    pub fn add_read_cancel(&mut self, fd: RawFd) -> Result<(), Error> {
        let target = UserData::encode(sys::IORING_OP_READ, fd, 0);
        self.push(
            SqeFields {
                op: sys::IORING_OP_ASYNC_CANCEL,
                fd,
                addr: target.raw(),
                len: 0,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Queue a TIMEOUT firing `nanos` from now. The timespec lives in
    /// memory pinned for the queue's lifetime; at most one timeout may be
    /// armed at a time, which the event loop enforces.
    pub fn add_timeout(&mut self, nanos: u64) -> Result<(), Error> {
        let (sec, nsec) = split_nanos(nanos);
        self.timeout_ts.tv_sec = sec;
        self.timeout_ts.tv_nsec = nsec;
        let addr = &*self.timeout_ts as *const sys::kernel_timespec as u64;
        self.push(
            SqeFields {
                op: sys::IORING_OP_TIMEOUT,
                fd: -1,
                addr,
                len: 1,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Queue a TIMEOUT_REMOVE targeting the previously armed TIMEOUT.
    pub fn add_timeout_remove(&mut self) -> Result<(), Error> {
        let target = UserData::encode(sys::IORING_OP_TIMEOUT, -1, 0);
        self.push(
            SqeFields {
                op: sys::IORING_OP_TIMEOUT_REMOVE,
                fd: -1,
                addr: target.raw(),
                len: 0,
                rw_flags: 0,
                offset: 0,
                buf_index: 0,
                flags: 0,
            },
            false,
        )
    }

    /// Publish the tail and submit all pending entries without waiting.
    /// Returns the number of entries the kernel consumed.
    pub fn submit(&mut self) -> Result<u32, Error> {
        self.enter(self.pending(), 0, 0)
    }

    /// Publish the tail, submit pending entries, and block until at least
    /// one completion is available.
    pub fn submit_and_wait(&mut self) -> Result<u32, Error> {
        self.enter(self.pending(), 1, sys::IORING_ENTER_GETEVENTS)
    }

    fn enter(&mut self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32, Error> {
        if to_submit > 0 {
            // SQE field writes must be visible before the kernel observes
            // the new tail.
            unsafe { (*self.k_tail).store(self.tail, Ordering::Release) };
        } else if min_complete == 0 {
            return Ok(0);
        }

        let consumed = match sys::io_uring_enter(self.ring_fd, to_submit, min_complete, flags) {
            Ok(n) => n,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(0);
                metrics::SUBMIT_FAILURES.increment();
                return Err(Error::SubmitFailed(errno));
            }
        };

        self.head = unsafe { (*self.k_head).load(Ordering::Acquire) };
        if let Some(callback) = self.on_submit.as_mut() {
            callback();
        }
        if consumed < to_submit {
            metrics::PARTIAL_SUBMITS.increment();
            warn!(
                offered = to_submit,
                consumed, "kernel consumed fewer SQEs than offered"
            );
        }
        metrics::SQES_SUBMITTED.add(consumed as u64);
        Ok(consumed)
    }

    /// Claim the next SQE slot, flushing to the kernel when the ring is
    /// full. Non-blocking operations leave one slot in reserve so the
    /// eventfd read can always be re-armed.
    fn next_slot(&mut self, blocking: bool) -> Result<*mut sys::io_uring_sqe, Error> {
        let limit = if blocking {
            self.ring_entries
        } else {
            self.ring_entries - 1
        };
        while self.pending() >= limit {
            if self.submit()? == 0 {
                return Err(Error::SubmitQueueFull);
            }
        }
        let index = (self.tail & self.ring_mask) as usize;
        self.tail = self.tail.wrapping_add(1);
        Ok(unsafe { self.sqes.add(index) })
    }

    fn push(&mut self, fields: SqeFields, blocking: bool) -> Result<(), Error> {
        let user_data = UserData::encode(fields.op, fields.fd, low_mask(fields.op, fields.rw_flags));
        let slot = self.next_slot(blocking)?;
        let sqe = sys::io_uring_sqe {
            opcode: fields.op,
            flags: fields.flags,
            ioprio: 0,
            fd: fields.fd,
            off: fields.offset,
            addr: fields.addr,
            len: fields.len,
            rw_flags: fields.rw_flags,
            user_data: user_data.raw(),
            buf_index: fields.buf_index,
            personality: 0,
            splice_fd_in: 0,
            pad2: [0; 2],
        };
        unsafe { ptr::write(slot, sqe) };
        trace!(
            op = fields.op,
            fd = fields.fd,
            user_data = user_data.raw(),
            "queued sqe"
        );
        Ok(())
    }
}

struct SqeFields {
    op: u8,
    fd: RawFd,
    addr: u64,
    len: u32,
    rw_flags: u32,
    offset: u64,
    buf_index: u16,
    flags: u8,
}

/// Only POLL_ADD carries a poll mask in its user-data word; for every other
/// op the rw_flags field means something else (accept flags, etc.).
fn low_mask(op: u8, rw_flags: u32) -> u16 {
    if op == sys::IORING_OP_POLL_ADD {
        rw_flags as u16
    } else {
        0
    }
}

fn split_nanos(nanos: u64) -> (i64, i64) {
    (
        (nanos / 1_000_000_000) as i64,
        (nanos % 1_000_000_000) as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanos_split_into_whole_seconds_and_remainder() {
        assert_eq!(split_nanos(0), (0, 0));
        assert_eq!(split_nanos(999_999_999), (0, 999_999_999));
        assert_eq!(split_nanos(1_000_000_000), (1, 0));
        assert_eq!(split_nanos(1_500_000_000), (1, 500_000_000));
        assert_eq!(split_nanos(50_000_000), (0, 50_000_000));
    }

    #[test]
    fn accept_mask_stays_out_of_user_data() {
        assert_eq!(low_mask(sys::IORING_OP_ACCEPT, 0x80800), 0);
        assert_eq!(
            low_mask(sys::IORING_OP_POLL_ADD, sys::POLLIN),
            sys::POLLIN as u16
        );
    }
}
