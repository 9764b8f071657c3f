//! Completion side of the ring: user-data routing and the CQE drain.
//!
//! Every SQE is tagged with a 64-bit word encoding `{fd, op, poll mask}` so
//! that completions are self-describing — no per-operation lookup table is
//! needed to route a CQE back to its channel.

use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::metrics;
use crate::sys;

/// The user-data word copied verbatim from SQE to CQE.
///
/// Layout: file descriptor in the high 32 bits, opcode in the middle 16,
/// poll mask in the low 16. The opcode is canonicalized at encode time
/// (`READ_FIXED` → `READ`, `WRITE_FIXED`/`WRITEV` → `WRITE`) so completion
/// handlers only ever test the canonical codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    pub fn encode(op: u8, fd: RawFd, poll_mask: u16) -> Self {
        let op = canonical_op(op);
        let op_mask = ((op as u32) << 16) | poll_mask as u32;
        UserData(((fd as u32 as u64) << 32) | op_mask as u64)
    }

    /// Split back into `(fd, op, poll mask)`.
    pub fn decode(self) -> (RawFd, u8, u16) {
        let fd = (self.0 >> 32) as u32 as RawFd;
        let op = ((self.0 >> 16) & 0xffff) as u8;
        let mask = (self.0 & 0xffff) as u16;
        (fd, op, mask)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Collapse the fixed/vectored opcode variants onto their canonical form.
fn canonical_op(op: u8) -> u8 {
    match op {
        sys::IORING_OP_READ_FIXED => sys::IORING_OP_READ,
        sys::IORING_OP_WRITE_FIXED | sys::IORING_OP_WRITEV => sys::IORING_OP_WRITE,
        other => other,
    }
}

/// User-space consumer over the completion ring.
///
/// The kernel advances the shared tail; this side advances the shared head
/// after each entry has been copied out. Single-consumer: only the event
/// loop thread may call [`process`](Self::process).
pub struct CompletionQueue {
    k_head: *const AtomicU32,
    k_tail: *const AtomicU32,
    k_overflow: *const AtomicU32,
    cqes: *const sys::io_uring_cqe,
    ring_mask: u32,
    head: u32,
}

impl CompletionQueue {
    /// Build the queue over an already-mapped CQ ring.
    ///
    /// # Safety
    ///
    /// `ring_ptr` must point at a live CQ ring mapping and the offsets must
    /// be the ones the kernel returned for it. The mapping must outlive the
    /// queue.
    pub(crate) unsafe fn new(ring_ptr: *mut u8, off: &sys::io_cqring_offsets) -> Self {
        unsafe {
            let k_head = ring_ptr.add(off.head as usize) as *const AtomicU32;
            let ring_mask = *(ring_ptr.add(off.ring_mask as usize) as *const u32);
            CompletionQueue {
                k_head,
                k_tail: ring_ptr.add(off.tail as usize) as *const AtomicU32,
                k_overflow: ring_ptr.add(off.overflow as usize) as *const AtomicU32,
                cqes: ring_ptr.add(off.cqes as usize) as *const sys::io_uring_cqe,
                ring_mask,
                head: (*k_head).load(Ordering::Relaxed),
            }
        }
    }

    /// Whether any completions are waiting.
    pub fn has_completions(&self) -> bool {
        self.head != unsafe { (*self.k_tail).load(Ordering::Acquire) }
    }

    /// Number of completions currently waiting.
    pub fn completion_count(&self) -> u32 {
        unsafe { (*self.k_tail).load(Ordering::Acquire) }.wrapping_sub(self.head)
    }

    /// CQ overflow counter maintained by the kernel.
    pub fn overflow(&self) -> u32 {
        unsafe { (*self.k_overflow).load(Ordering::Relaxed) }
    }

    /// Drain waiting completions in FIFO order, invoking `callback` once per
    /// entry with the decoded `(fd, res, flags, op, poll mask)`. Returns the
    /// number of entries handled.
    ///
    /// Each slot is released to the kernel *before* its callback runs — the
    /// entry has already been copied out, and releasing early lets the
    /// kernel refill during dispatch. After the observed window is
    /// exhausted, the shared tail is re-read once to pick up completions
    /// that arrived mid-drain. A callback returning `false` stops the drain.
    pub fn process<F>(&mut self, mut callback: F) -> u32
    where
        F: FnMut(RawFd, i32, u32, u8, u16) -> bool,
    {
        let mut tail = unsafe { (*self.k_tail).load(Ordering::Acquire) };
        if self.head == tail {
            return 0;
        }
        let mut handled = 0u32;
        loop {
            let index = (self.head & self.ring_mask) as usize;
            let cqe = unsafe { ptr::read(self.cqes.add(index)) };

            // The CQE bytes are copied; hand the slot back so the kernel can
            // refill while we dispatch.
            self.head = self.head.wrapping_add(1);
            unsafe { (*self.k_head).store(self.head, Ordering::Release) };

            let (fd, op, mask) = UserData(cqe.user_data).decode();
            handled += 1;
            if !callback(fd, cqe.res, cqe.flags, op, mask) {
                break;
            }
            if self.head == tail {
                tail = unsafe { (*self.k_tail).load(Ordering::Acquire) };
                if self.head == tail {
                    break;
                }
            }
        }
        metrics::CQES_PROCESSED.add(handled as u64);
        handled
    }
}
