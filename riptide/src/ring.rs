//! Ring setup and teardown.
//!
//! The [`RingBuffer`] owns the ring file descriptor and the three shared
//! mappings (SQ ring, CQ ring, SQE array) and hands out the submission and
//! completion queues built over them. All of it is released together on
//! drop; no queue pointer may outlive the holder.

use std::io;
use std::os::fd::RawFd;
use std::ptr;

use tracing::trace;

use crate::completion::CompletionQueue;
use crate::error::Error;
use crate::submission::{SubmissionQueue, SubmitCallback};
use crate::sys;

/// A shared mapping over the ring fd. Unmapped on drop.
struct Mmap {
    ptr: *mut u8,
    len: usize,
}

impl Mmap {
    fn new(ring_fd: RawFd, offset: i64, len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                ring_fd,
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mmap {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Holder of the submission and completion queues plus the ring fd.
pub struct RingBuffer {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    ring_fd: RawFd,
    _sq_ring: Mmap,
    // Absent when the kernel reports IORING_FEAT_SINGLE_MMAP and both rings
    // share the SQ mapping.
    _cq_ring: Option<Mmap>,
    _sqes: Mmap,
}

impl RingBuffer {
    /// Set up a ring with `entries` SQ slots (rounded up by the kernel to a
    /// power of two).
    pub fn new(entries: u32) -> Result<Self, Error> {
        Self::with_submit_callback(entries, None)
    }

    /// Like [`new`](Self::new), with a callback invoked after every
    /// successful kernel submission.
    pub fn with_submit_callback(
        entries: u32,
        on_submit: Option<SubmitCallback>,
    ) -> Result<Self, Error> {
        // A single-slot ring cannot hold the reserved eventfd-read slot
        // plus a data operation.
        let entries = entries.max(2);
        let mut params = sys::io_uring_params::default();
        let ring_fd = sys::io_uring_setup(entries, &mut params)
            .map_err(|e| Error::RingSetup(format!("io_uring_setup: {e}")))?;

        match Self::map_rings(ring_fd, &params, on_submit) {
            Ok(ring) => {
                trace!(
                    ring_fd,
                    sq_entries = params.sq_entries,
                    cq_entries = params.cq_entries,
                    "ring created"
                );
                Ok(ring)
            }
            Err(e) => {
                unsafe {
                    libc::close(ring_fd);
                }
                Err(e)
            }
        }
    }

    fn map_rings(
        ring_fd: RawFd,
        params: &sys::io_uring_params,
        on_submit: Option<SubmitCallback>,
    ) -> Result<RingBuffer, Error> {
        let mut sq_ring_len = params.sq_off.array as usize
            + params.sq_entries as usize * std::mem::size_of::<u32>();
        let cq_ring_len = params.cq_off.cqes as usize
            + params.cq_entries as usize * std::mem::size_of::<sys::io_uring_cqe>();

        let single_mmap = params.features & sys::IORING_FEAT_SINGLE_MMAP != 0;
        if single_mmap {
            sq_ring_len = sq_ring_len.max(cq_ring_len);
        }

        let sq_ring = Mmap::new(ring_fd, sys::IORING_OFF_SQ_RING, sq_ring_len)
            .map_err(|e| Error::RingSetup(format!("mmap sq ring: {e}")))?;
        let cq_ring = if single_mmap {
            None
        } else {
            Some(
                Mmap::new(ring_fd, sys::IORING_OFF_CQ_RING, cq_ring_len)
                    .map_err(|e| Error::RingSetup(format!("mmap cq ring: {e}")))?,
            )
        };
        let sqes = Mmap::new(
            ring_fd,
            sys::IORING_OFF_SQES,
            params.sq_entries as usize * std::mem::size_of::<sys::io_uring_sqe>(),
        )
        .map_err(|e| Error::RingSetup(format!("mmap sqe array: {e}")))?;

        let cq_ptr = cq_ring.as_ref().map_or(sq_ring.ptr, |m| m.ptr);
        let sq = unsafe {
            SubmissionQueue::new(
                sq_ring.ptr,
                &params.sq_off,
                sqes.ptr as *mut sys::io_uring_sqe,
                ring_fd,
                on_submit,
            )
        };
        let cq = unsafe { CompletionQueue::new(cq_ptr, &params.cq_off) };

        Ok(RingBuffer {
            sq,
            cq,
            ring_fd,
            _sq_ring: sq_ring,
            _cq_ring: cq_ring,
            _sqes: sqes,
        })
    }

    pub fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }

    pub fn sq(&self) -> &SubmissionQueue {
        &self.sq
    }

    pub fn sq_mut(&mut self) -> &mut SubmissionQueue {
        &mut self.sq
    }

    pub fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    pub fn cq_mut(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    /// Disjoint mutable borrows of both queues, for completion dispatch
    /// that enqueues follow-up SQEs.
    pub fn split(&mut self) -> (&mut SubmissionQueue, &mut CompletionQueue) {
        (&mut self.sq, &mut self.cq)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // The mappings unmap themselves when their fields drop.
        unsafe {
            libc::close(self.ring_fd);
        }
    }
}
