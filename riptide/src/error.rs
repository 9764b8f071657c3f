use std::fmt;
use std::io;

/// Errors surfaced by the riptide event loop and ring.
#[derive(Debug)]
pub enum Error {
    /// Underlying I/O failure (eventfd, thread spawn, sockets).
    Io(io::Error),
    /// Ring setup failed (syscall or mmap).
    RingSetup(String),
    /// `io_uring_enter` returned a negative result; carries the errno.
    SubmitFailed(i32),
    /// The submission queue is full and flushing freed no slots.
    SubmitQueueFull,
    /// REGISTER_BUFFERS / UNREGISTER_BUFFERS failed.
    BufferRegistration(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::RingSetup(msg) => write!(f, "ring setup: {msg}"),
            Error::SubmitFailed(errno) => {
                write!(f, "io_uring_enter failed: {}", io::Error::from_raw_os_error(*errno))
            }
            Error::SubmitQueueFull => write!(f, "submission queue full"),
            Error::BufferRegistration(e) => write!(f, "buffer registration: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::BufferRegistration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
