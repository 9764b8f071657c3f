//! Raw ring integration tests.
//!
//! These exercise the submission/completion queues directly against the
//! kernel, without an event loop: file round-trips, timer expiry, poll
//! wake and cancellation, and index wrap-around on a tiny ring.

use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use riptide::{RingBuffer, sys};

/// One decoded completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Completion {
    fd: RawFd,
    res: i32,
    op: u8,
    mask: u16,
}

/// Drain everything currently sitting in the CQ.
fn drain(ring: &mut RingBuffer) -> Vec<Completion> {
    let mut out = Vec::new();
    ring.cq_mut().process(|fd, res, _flags, op, mask| {
        out.push(Completion { fd, res, op, mask });
        true
    });
    out
}

/// Submit, wait, and drain until `want` completions arrive (or panic after
/// two seconds).
fn await_completions(ring: &mut RingBuffer, want: usize) -> Vec<Completion> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut out = Vec::new();
    while out.len() < want {
        assert!(Instant::now() < deadline, "timed out waiting for completions");
        ring.sq_mut().submit_and_wait().unwrap();
        out.extend(drain(ring));
    }
    out
}

#[test]
fn file_write_read_round_trip() {
    let file = tempfile::tempfile().unwrap();
    let fd = file.as_raw_fd();
    let mut ring = RingBuffer::new(8).unwrap();

    let payload = *b"Hello World!";
    unsafe {
        ring.sq_mut()
            .add_write(fd, payload.as_ptr() as u64, 0, payload.len() as u32, -1)
            .unwrap();
    }
    let written = await_completions(&mut ring, 1);
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].op, sys::IORING_OP_WRITE);
    assert_eq!(written[0].fd, fd);
    assert_eq!(written[0].res, 12);

    let mut buf = [0u8; 100];
    unsafe {
        ring.sq_mut()
            .add_read(fd, buf.as_mut_ptr() as u64, 0, buf.len() as u32, -1, false)
            .unwrap();
    }
    let read = await_completions(&mut ring, 1);
    assert_eq!(read[0].op, sys::IORING_OP_READ);
    assert_eq!(read[0].res, 12);
    assert_eq!(
        &buf[..12],
        &[0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x20, 0x57, 0x6f, 0x72, 0x6c, 0x64, 0x21]
    );
}

#[test]
fn timeout_expires_with_etime() {
    let mut ring = RingBuffer::new(8).unwrap();
    ring.sq_mut().add_timeout(50_000_000).unwrap();

    let start = Instant::now();
    let completions = await_completions(&mut ring, 1);
    assert!(start.elapsed() >= Duration::from_millis(40));

    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].op, sys::IORING_OP_TIMEOUT);
    assert_eq!(completions[0].fd, -1);
    assert_eq!(completions[0].res, -libc::ETIME);
}

#[test]
fn eventfd_poll_wakes_on_cross_thread_write() {
    let efd = sys::eventfd().unwrap();
    let mut ring = RingBuffer::new(8).unwrap();
    ring.sq_mut().add_poll(efd, sys::POLLIN).unwrap();
    ring.sq_mut().submit().unwrap();

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        sys::eventfd_write(efd, 1);
    });

    let completions = await_completions(&mut ring, 1);
    writer.join().unwrap();

    assert_eq!(completions[0].op, sys::IORING_OP_POLL_ADD);
    assert_eq!(completions[0].fd, efd);
    assert_eq!(completions[0].mask, sys::POLLIN as u16);
    assert!(completions[0].res >= 0);
    assert!(completions[0].res as u32 & sys::POLLIN != 0);

    unsafe {
        libc::close(efd);
    }
}

#[test]
fn poll_remove_cancels_armed_poll() {
    let efd = sys::eventfd().unwrap();
    let mut ring = RingBuffer::new(8).unwrap();

    ring.sq_mut().add_poll(efd, sys::POLLIN).unwrap();
    ring.sq_mut().add_poll_remove(efd, sys::POLLIN).unwrap();

    // One CQE for the cancelled POLL_ADD and one for the POLL_REMOVE, in
    // either order.
    let completions = await_completions(&mut ring, 2);
    let poll_add = completions
        .iter()
        .find(|c| c.op == sys::IORING_OP_POLL_ADD)
        .expect("poll add completion");
    let poll_remove = completions
        .iter()
        .find(|c| c.op == sys::IORING_OP_POLL_REMOVE)
        .expect("poll remove completion");

    assert_eq!(poll_add.res, -libc::ECANCELED);
    assert_eq!(poll_remove.res, 0);

    unsafe {
        libc::close(efd);
    }
}

#[test]
fn poll_remove_after_completion_returns_enoent() {
    let efd = sys::eventfd().unwrap();
    let mut ring = RingBuffer::new(8).unwrap();

    // Fire the poll first, then try to remove it.
    ring.sq_mut().add_poll(efd, sys::POLLIN).unwrap();
    ring.sq_mut().submit().unwrap();
    sys::eventfd_write(efd, 1);
    let fired = await_completions(&mut ring, 1);
    assert_eq!(fired[0].op, sys::IORING_OP_POLL_ADD);
    assert!(fired[0].res >= 0);

    ring.sq_mut().add_poll_remove(efd, sys::POLLIN).unwrap();
    let removed = await_completions(&mut ring, 1);
    assert_eq!(removed[0].op, sys::IORING_OP_POLL_REMOVE);
    assert_eq!(removed[0].res, -libc::ENOENT);

    unsafe {
        libc::close(efd);
    }
}

#[test]
fn indices_wrap_on_tiny_ring() {
    let file = tempfile::tempfile().unwrap();
    let payload = *b"wrap";
    let fd = file.as_raw_fd();

    let mut ring = RingBuffer::new(4).unwrap();
    unsafe {
        ring.sq_mut()
            .add_write(fd, payload.as_ptr() as u64, 0, payload.len() as u32, -1)
            .unwrap();
    }
    assert_eq!(await_completions(&mut ring, 1)[0].res, 4);

    // Ten sequential reads through a 4-entry ring; distinct fds per dup so
    // every completion carries a distinct user-data word.
    let mut dups = Vec::new();
    let mut buf = [0u8; 16];
    let mut seen_fds = Vec::new();
    for _ in 0..10 {
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);
        dups.push(dup);
        unsafe {
            ring.sq_mut()
                .add_read(dup, buf.as_mut_ptr() as u64, 0, buf.len() as u32, -1, false)
                .unwrap();
        }
        let completions = await_completions(&mut ring, 1);
        assert_eq!(completions[0].op, sys::IORING_OP_READ);
        assert_eq!(completions[0].res, 4);
        seen_fds.push(completions[0].fd);
    }

    let mut unique = seen_fds.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 10, "user-data words must be distinct");
    assert_eq!(ring.sq().pending(), 0);

    for dup in dups {
        unsafe {
            libc::close(dup);
        }
    }
}

#[test]
fn full_submission_queue_flushes_and_accepts_more() {
    let file = tempfile::tempfile().unwrap();
    let payload = *b"x";
    let fd = file.as_raw_fd();

    let mut ring = RingBuffer::new(4).unwrap();

    // More enqueues than the ring holds: filling it must trigger an
    // implicit submit, after which the extra entries are accepted.
    for _ in 0..6 {
        unsafe {
            ring.sq_mut()
                .add_write(fd, payload.as_ptr() as u64, 0, 1, -1)
                .unwrap();
        }
        assert!(ring.sq().pending() < 4);
    }

    let completions = await_completions(&mut ring, 6);
    assert_eq!(completions.len(), 6);
    assert!(completions.iter().all(|c| c.res == 1));
    assert_eq!(ring.sq().pending(), 0);
}
