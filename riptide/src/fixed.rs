//! Fixed-buffer registration.
//!
//! Buffers registered with the kernel (for READ_FIXED / WRITE_FIXED) can
//! only be swapped while no non-poll operation is in flight. The table
//! tracks the desired iovec set and a dirty flag; the event loop quiesces
//! outstanding I/O and then calls [`reconcile`](FixedBufferTable::reconcile).

use std::os::fd::RawFd;
use std::ptr;

use tracing::{trace, warn};

use crate::error::Error;
use crate::sys;

/// A memory region to register, as `(address, length)`. The memory must
/// stay valid while registered.
pub type BufferRegion = (u64, usize);

/// Desired fixed-buffer set plus registration state. Mutated only on the
/// event-loop thread (external threads go through a task).
pub struct FixedBufferTable {
    iovecs: Vec<libc::iovec>,
    dirty: bool,
    registered: bool,
}

impl FixedBufferTable {
    pub fn new() -> Self {
        FixedBufferTable {
            iovecs: Vec::new(),
            dirty: false,
            registered: false,
        }
    }

    /// Replace the buffer set. Takes effect at the loop's next
    /// reconciliation point, once in-flight I/O has drained.
    pub fn set_buffers(&mut self, regions: &[BufferRegion]) {
        self.iovecs = regions
            .iter()
            .map(|&(addr, len)| libc::iovec {
                iov_base: addr as *mut libc::c_void,
                iov_len: len,
            })
            .collect();
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of regions in the desired set.
    pub fn count(&self) -> usize {
        self.iovecs.len()
    }

    /// Re-register the buffer set with the kernel. The caller guarantees no
    /// non-poll operation is in flight.
    pub(crate) fn reconcile(&mut self, ring_fd: RawFd) -> Result<(), Error> {
        if self.registered {
            match sys::io_uring_register(ring_fd, sys::IORING_UNREGISTER_BUFFERS, ptr::null(), 0)
            {
                Ok(()) => {}
                // Nothing was registered kernel-side; idempotent outcome.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    trace!("unregister buffers: nothing registered");
                }
                Err(e) => {
                    warn!(error = %e, "UNREGISTER_BUFFERS failed");
                    return Err(Error::BufferRegistration(e));
                }
            }
            self.registered = false;
        }

        if !self.iovecs.is_empty() {
            sys::io_uring_register(
                ring_fd,
                sys::IORING_REGISTER_BUFFERS,
                self.iovecs.as_ptr() as *const libc::c_void,
                self.iovecs.len() as u32,
            )
            .map_err(Error::BufferRegistration)?;
            self.registered = true;
            trace!(count = self.iovecs.len(), "registered fixed buffers");
        }

        self.dirty = false;
        Ok(())
    }
}

impl Default for FixedBufferTable {
    fn default() -> Self {
        Self::new()
    }
}
