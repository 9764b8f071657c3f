//! Raw io_uring kernel interface.
//!
//! Everything in this module is a hard compatibility surface: the struct
//! layouts, mmap offsets, opcodes and flags must match what the running
//! kernel exports. The three syscalls are invoked through `libc::syscall`
//! since glibc does not wrap them. Type names follow the kernel ABI.

#![allow(non_camel_case_types)]

use std::io;
use std::os::fd::RawFd;

// mmap offsets for the three ring regions.
pub const IORING_OFF_SQ_RING: i64 = 0;
pub const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
pub const IORING_OFF_SQES: i64 = 0x1000_0000;

// io_uring_enter flags.
pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

// Feature bits returned in `io_uring_params.features`.
pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

// Per-SQE flags.
pub const IOSQE_ASYNC: u8 = 1 << 4;

// Opcodes used by the event loop. Values are the kernel's.
pub const IORING_OP_WRITEV: u8 = 2;
pub const IORING_OP_READ_FIXED: u8 = 4;
pub const IORING_OP_WRITE_FIXED: u8 = 5;
pub const IORING_OP_POLL_ADD: u8 = 6;
pub const IORING_OP_POLL_REMOVE: u8 = 7;
pub const IORING_OP_TIMEOUT: u8 = 11;
pub const IORING_OP_TIMEOUT_REMOVE: u8 = 12;
pub const IORING_OP_ACCEPT: u8 = 13;
pub const IORING_OP_ASYNC_CANCEL: u8 = 14;
pub const IORING_OP_CONNECT: u8 = 16;
pub const IORING_OP_CLOSE: u8 = 19;
pub const IORING_OP_READ: u8 = 22;
pub const IORING_OP_WRITE: u8 = 23;

// io_uring_register opcodes.
pub const IORING_REGISTER_BUFFERS: u32 = 0;
pub const IORING_UNREGISTER_BUFFERS: u32 = 1;

// Poll mask bits carried in the SQE's rw_flags word.
pub const POLLIN: u32 = libc::POLLIN as u32;
pub const POLLOUT: u32 = libc::POLLOUT as u32;
pub const POLLRDHUP: u32 = libc::POLLRDHUP as u32;

/// Offsets into the SQ ring mapping, filled in by `io_uring_setup`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_sqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Offsets into the CQ ring mapping, filled in by `io_uring_setup`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_cqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Setup parameters exchanged with `io_uring_setup`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_uring_params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: io_sqring_offsets,
    pub cq_off: io_cqring_offsets,
}

/// Submission queue entry. Exactly 64 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_uring_sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub rw_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub pad2: [u64; 2],
}

/// Completion queue entry. Exactly 16 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_uring_cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

/// `__kernel_timespec` for TIMEOUT SQEs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct kernel_timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

const _: () = assert!(std::mem::size_of::<io_uring_sqe>() == 64);
const _: () = assert!(std::mem::size_of::<io_uring_cqe>() == 16);
const _: () = assert!(std::mem::size_of::<kernel_timespec>() == 16);

/// `io_uring_setup(2)`: create a ring and fill `params` with the region
/// offsets and actual entry counts.
pub fn io_uring_setup(entries: u32, params: &mut io_uring_params) -> io::Result<RawFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_long,
            params as *mut io_uring_params,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as RawFd)
}

/// `io_uring_enter(2)`: submit `to_submit` SQEs and, with
/// [`IORING_ENTER_GETEVENTS`], block until `min_complete` CQEs are
/// available. Returns the number of SQEs the kernel consumed.
pub fn io_uring_enter(
    ring_fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            ring_fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            std::ptr::null::<libc::sigset_t>(),
            0 as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// `io_uring_register(2)`: register or unregister resources with the ring.
pub fn io_uring_register(
    ring_fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            ring_fd as libc::c_long,
            opcode as libc::c_long,
            arg,
            nr_args as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a blocking eventfd. The fd is read through the ring (where the
/// blocking semantics are what we want) and written with plain `write`.
pub fn eventfd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Write a value to an eventfd, ignoring failure. Used on the wake-up path
/// where the only failure mode is a closed loop.
pub fn eventfd_write(fd: RawFd, value: u64) {
    unsafe {
        libc::write(fd, &value as *const u64 as *const libc::c_void, 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn sqe_field_offsets() {
        assert_eq!(offset_of!(io_uring_sqe, opcode), 0);
        assert_eq!(offset_of!(io_uring_sqe, flags), 1);
        assert_eq!(offset_of!(io_uring_sqe, ioprio), 2);
        assert_eq!(offset_of!(io_uring_sqe, fd), 4);
        assert_eq!(offset_of!(io_uring_sqe, off), 8);
        assert_eq!(offset_of!(io_uring_sqe, addr), 16);
        assert_eq!(offset_of!(io_uring_sqe, len), 24);
        assert_eq!(offset_of!(io_uring_sqe, rw_flags), 28);
        assert_eq!(offset_of!(io_uring_sqe, user_data), 32);
        assert_eq!(offset_of!(io_uring_sqe, buf_index), 40);
    }

    #[test]
    fn cqe_field_offsets() {
        assert_eq!(offset_of!(io_uring_cqe, user_data), 0);
        assert_eq!(offset_of!(io_uring_cqe, res), 8);
        assert_eq!(offset_of!(io_uring_cqe, flags), 12);
    }
}
